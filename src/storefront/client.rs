//! Storefront client with transparent caching and image prefetch.

use serde_json::Value;
use std::time::Duration;
use tracing::info;

use crate::cache::{QueryCoordinator, QueryKey, QueryOptions, QueryResult};
use crate::config::{CacheConfig, Config};
use crate::paginate::{Page, Paginator};
use crate::prefetch::{CachePolicy, PrefetchScheduler, Priority};
use crate::query::Query;
use crate::transport::{Transport, TransportError};

use super::types::{Banner, Brand, Category, Order, Product, ProductFilters};

const BANNERS: &str = "banners";
const CATEGORIES: &str = "categories";
const BRANDS: &str = "brands";
const PRODUCTS: &str = "products";
const PRODUCT: &str = "product";
const ORDERS: &str = "orders";
const MY_ORDERS_PATH: &str = "/orders/my-orders";

/// Storefront API client.
///
/// Reads go through the query coordinator under per-family staleness windows,
/// writes invalidate the families they touch, and every successful read
/// queues its images with the prefetch scheduler at the matching tier.
#[derive(Clone)]
pub struct StorefrontClient {
  transport: Transport,
  coordinator: QueryCoordinator,
  prefetch: PrefetchScheduler,
  cache: CacheConfig,
  low_priority_delay: Duration,
}

impl StorefrontClient {
  pub fn new(
    transport: Transport,
    coordinator: QueryCoordinator,
    prefetch: PrefetchScheduler,
    config: &Config,
  ) -> Self {
    Self {
      transport,
      coordinator,
      prefetch,
      cache: config.cache.clone(),
      low_priority_delay: config.prefetch.low_priority_delay(),
    }
  }

  pub fn coordinator(&self) -> &QueryCoordinator {
    &self.coordinator
  }

  pub fn prefetch(&self) -> &PrefetchScheduler {
    &self.prefetch
  }

  fn options(&self, family: &str) -> QueryOptions {
    QueryOptions::new(self.cache.stale_time(family))
  }

  /// GET `path` under `key`, through the cache.
  async fn read<T>(&self, key: QueryKey, family: &str, path: String) -> QueryResult<T>
  where
    T: serde::de::DeserializeOwned,
  {
    let transport = self.transport.clone();
    self
      .coordinator
      .query(&key, &self.options(family), move || async move {
        transport.get(&path).await
      })
      .await
  }

  /// Home-screen banners. Images are queued at high priority.
  pub async fn banners(&self) -> QueryResult<Vec<Banner>> {
    let result: QueryResult<Vec<Banner>> = self
      .read(QueryKey::new(BANNERS), BANNERS, "/banners".to_string())
      .await;

    if let Some(banners) = &result.data {
      self.prefetch.enqueue_many(
        banners.iter().map(|b| b.image.url()),
        Priority::High,
        CachePolicy::Default,
      );
    }
    result
  }

  /// Category list. Icons are primary navigation, so they go in at high priority.
  pub async fn categories(&self) -> QueryResult<Vec<Category>> {
    let result: QueryResult<Vec<Category>> = self
      .read(QueryKey::new(CATEGORIES), CATEGORIES, "/categories".to_string())
      .await;

    if let Some(categories) = &result.data {
      self.prefetch.enqueue_many(
        categories.iter().filter_map(|c| c.icon.as_ref()).map(|i| i.url()),
        Priority::High,
        CachePolicy::Immutable,
      );
    }
    result
  }

  pub async fn brands(&self) -> QueryResult<Vec<Brand>> {
    let result: QueryResult<Vec<Brand>> = self
      .read(QueryKey::new(BRANDS), BRANDS, "/brands".to_string())
      .await;

    if let Some(brands) = &result.data {
      self.prefetch.enqueue_many(
        brands.iter().filter_map(|b| b.logo.as_ref()).map(|i| i.url()),
        Priority::Normal,
        CachePolicy::Immutable,
      );
    }
    result
  }

  /// A single product, with every image queued at high priority.
  pub async fn product(&self, id: &str) -> QueryResult<Product> {
    let result: QueryResult<Product> = self
      .read(product_key(id), PRODUCT, format!("/products/{}", id))
      .await;

    if let Some(product) = &result.data {
      self
        .prefetch
        .enqueue_many(product.image_urls(), Priority::High, CachePolicy::Immutable);
    }
    result
  }

  /// One page of the catalogue, cached under `["products", filters, page]`.
  pub async fn product_page(&self, filters: &ProductFilters, page: u32) -> QueryResult<Page<Product>> {
    let key = products_family(filters).push(page);
    self.read(key, PRODUCTS, products_path(filters, page)).await
  }

  /// Infinite catalogue list. The first page's thumbnails are queued at normal
  /// priority; later pages are below the fold and go in low, after a delay.
  pub fn products(&self, filters: ProductFilters) -> Paginator<Product> {
    let transport = self.transport.clone();
    let fetch_filters = filters.clone();
    let prefetch = self.prefetch.clone();
    let delay = self.low_priority_delay;

    Paginator::new(
      self.coordinator.clone(),
      products_family(&filters),
      self.options(PRODUCTS),
      move |page| {
        let transport = transport.clone();
        let path = products_path(&fetch_filters, page);
        async move { transport.get(&path).await }
      },
    )
    .on_page(move |page, products: &[Product]| {
      let thumbnails: Vec<String> = products
        .iter()
        .filter_map(Product::thumbnail)
        .map(String::from)
        .collect();
      if page == 1 {
        prefetch.enqueue_many(&thumbnails, Priority::Normal, CachePolicy::Immutable);
      } else {
        prefetch.enqueue_deferred(delay, thumbnails, Priority::Low, CachePolicy::Immutable);
      }
    })
  }

  /// The signed-in user's orders. Only fetched when a credential is stored.
  pub async fn my_orders(&self) -> QueryResult<Vec<Order>> {
    let signed_in = self.transport.credentials().get_token().await.is_some();
    let transport = self.transport.clone();

    self
      .coordinator
      .query(
        &orders_key(),
        &self.options(ORDERS).enabled(signed_in),
        move || async move { transport.get(MY_ORDERS_PATH).await },
      )
      .await
  }

  /// Live handle on the signed-in user's orders, for screens that poll.
  /// Disabled when no credential is stored.
  pub async fn watch_my_orders(&self) -> Query<Vec<Order>> {
    let signed_in = self.transport.credentials().get_token().await.is_some();
    let transport = self.transport.clone();

    Query::new(
      self.coordinator.clone(),
      orders_key(),
      self.options(ORDERS).enabled(signed_in),
      move || {
        let transport = transport.clone();
        async move { transport.get(MY_ORDERS_PATH).await }
      },
    )
  }

  pub async fn create_product(&self, product: Value) -> Result<Product, TransportError> {
    let created = self.transport.post("/products", product).await?;
    self.coordinator.invalidate(&QueryKey::new(PRODUCTS));
    self.remember_product(created)
  }

  pub async fn update_product(&self, id: &str, changes: Value) -> Result<Product, TransportError> {
    let updated = self
      .transport
      .put(&format!("/products/{}", id), changes)
      .await?;
    self.coordinator.invalidate(&QueryKey::new(PRODUCTS));
    self.coordinator.invalidate(&product_key(id));
    self.remember_product(updated)
  }

  pub async fn delete_product(&self, id: &str) -> Result<(), TransportError> {
    self.transport.delete(&format!("/products/{}", id)).await?;
    self.coordinator.invalidate(&QueryKey::new(PRODUCTS));
    self.coordinator.invalidate(&product_key(id));
    Ok(())
  }

  /// Forget the session: credential, identity and every cached response.
  pub async fn sign_out(&self) {
    let credentials = self.transport.credentials();
    credentials.clear_token().await;
    credentials.clear_identity().await;
    let entries = self.coordinator.store().len();
    self.coordinator.clear();
    info!(entries, "Signed out, cache cleared");
  }

  /// Seed the detail cache with the server's copy of a written product.
  fn remember_product(&self, payload: Value) -> Result<Product, TransportError> {
    let product: Product = serde_json::from_value(payload.clone())?;
    self
      .coordinator
      .set_data(&product_key(&product.id), payload, self.cache.stale_time(PRODUCT));
    Ok(product)
  }
}

fn orders_key() -> QueryKey {
  QueryKey::new(ORDERS).push("mine")
}

fn product_key(id: &str) -> QueryKey {
  QueryKey::new(PRODUCT).push(id)
}

fn products_family(filters: &ProductFilters) -> QueryKey {
  QueryKey::new(PRODUCTS).push(serde_json::to_value(filters).unwrap_or(Value::Null))
}

fn products_path(filters: &ProductFilters, page: u32) -> String {
  let mut query = url::form_urlencoded::Serializer::new(String::new());
  query.append_pair("page", &page.to_string());
  query.append_pair("limit", &filters.limit.to_string());
  query.append_pair("sort", &filters.sort);
  if let Some(category) = &filters.category {
    query.append_pair("category", category);
  }
  if let Some(brand) = &filters.brand {
    query.append_pair("brand", brand);
  }
  if let Some(search) = &filters.search {
    query.append_pair("search", search);
  }
  format!("/products?{}", query.finish())
}
