use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use storefront_sync::cache::QueryCoordinator;
use storefront_sync::config::Config;
use storefront_sync::logging;
use storefront_sync::prefetch::{HttpAssetLoader, PrefetchScheduler};
use storefront_sync::storefront::{ProductFilters, StorefrontClient};
use storefront_sync::transport::{
  CredentialStore, HttpBackend, ReqwestBackend, SqliteCredentialStore, Transport,
};

#[derive(Parser, Debug)]
#[command(name = "storefront-sync")]
#[command(about = "Warm a local cache of a storefront catalogue and its images")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./storefront.yaml or $XDG_CONFIG_HOME/storefront/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Only walk products in this category
  #[arg(long)]
  category: Option<String>,

  /// Maximum number of catalogue pages to load
  #[arg(short, long, default_value_t = 3)]
  pages: u32,

  /// Log at debug level and mirror logs to stderr
  #[arg(short, long)]
  verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = logging::init(args.verbose)?;

  let config = Config::load(args.config.as_deref())?;

  let backend: Arc<dyn HttpBackend> = Arc::new(ReqwestBackend::new(config.timeout())?);
  let credentials = Arc::new(SqliteCredentialStore::open()?);
  if let Some(token) = Config::get_api_token() {
    credentials.set_token(&token).await;
  }

  let transport = Transport::new(backend.clone(), config.base_url()?, credentials)
    .with_retry_policy(config.retry.policy())
    .with_timeout(config.timeout());
  let prefetch = PrefetchScheduler::new(
    Arc::new(HttpAssetLoader::new(backend).with_max_bytes(config.prefetch.max_cache_bytes)),
    config.prefetch.concurrency,
  );
  let client = StorefrontClient::new(transport, QueryCoordinator::default(), prefetch, &config);

  info!(url = %config.api.url, "Syncing storefront");

  let banners = client.banners().await;
  if let Some(error) = &banners.error {
    warn!("Banners unavailable: {}", error);
  }
  let categories = client.categories().await;
  if let Some(error) = &categories.error {
    warn!("Categories unavailable: {}", error);
  }
  let brands = client.brands().await;
  if let Some(error) = &brands.error {
    warn!("Brands unavailable: {}", error);
  }

  let filters = ProductFilters {
    category: args.category,
    ..ProductFilters::default()
  };
  let products = client.products(filters);
  while products.page_count() < args.pages as usize {
    let before = products.page_count();
    products.next_page().await;
    if let Some(error) = products.error() {
      warn!("Stopped paging: {}", error);
      break;
    }
    if products.page_count() == before || !products.has_more() {
      break;
    }
  }

  let orders = client.my_orders().await;

  client.prefetch().wait_idle().await;
  let stats = client.prefetch().stats();

  println!(
    "banners: {}  categories: {}  brands: {}",
    banners.data.map_or(0, |b| b.len()),
    categories.data.map_or(0, |c| c.len()),
    brands.data.map_or(0, |b| b.len()),
  );
  println!(
    "products: {} across {} page(s){}",
    products.len(),
    products.page_count(),
    if products.has_more() { ", more available" } else { "" }
  );
  match orders.data {
    Some(orders) => println!("orders: {}", orders.len()),
    None => println!("orders: not signed in"),
  }
  println!("images: {} cached, {} failed", stats.done, stats.failed);

  Ok(())
}
