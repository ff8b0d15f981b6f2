//! Asset loaders the prefetch scheduler delegates to.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use super::{CachePolicy, PrefetchOptions};
use crate::transport::{HttpBackend, HttpRequest, TransportError};

/// Platform primitive that warms an image cache. Assumed idempotent per URL.
#[async_trait]
pub trait AssetLoader: Send + Sync {
  async fn prefetch(&self, url: &str, options: PrefetchOptions) -> Result<(), TransportError>;
}

/// Default ceiling on cached asset bytes.
pub const DEFAULT_MAX_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
struct CachedAsset {
  bytes: Bytes,
  etag: Option<String>,
  last_modified: Option<String>,
  policy: CachePolicy,
  /// Load order, for evicting the oldest first
  seq: u64,
}

#[derive(Default)]
struct AssetCache {
  assets: HashMap<String, CachedAsset>,
  total: usize,
  next_seq: u64,
}

impl AssetCache {
  /// Store `asset`, evicting the oldest assets until `max_bytes` holds.
  fn insert(&mut self, url: String, mut asset: CachedAsset, max_bytes: usize) {
    asset.seq = self.next_seq;
    self.next_seq += 1;
    self.total += asset.bytes.len();
    if let Some(replaced) = self.assets.insert(url, asset) {
      self.total -= replaced.bytes.len();
    }

    while self.total > max_bytes {
      let Some(oldest) = self
        .assets
        .iter()
        .min_by_key(|(_, a)| a.seq)
        .map(|(url, _)| url.clone())
      else {
        break;
      };
      if let Some(evicted) = self.assets.remove(&oldest) {
        self.total -= evicted.bytes.len();
        debug!(url = %oldest, bytes = evicted.bytes.len(), "Evicted cached asset");
      }
    }
  }
}

/// Downloads assets over HTTP into an in-memory asset cache.
///
/// `Immutable` assets are never requested again once cached. `Default` assets
/// are revalidated with the validators from the previous response, and a 304
/// keeps the cached bytes. The cache holds at most `max_bytes`; the oldest
/// loads are evicted first, and an asset larger than the whole budget is
/// downloaded but not kept.
pub struct HttpAssetLoader {
  backend: Arc<dyn HttpBackend>,
  cache: Mutex<AssetCache>,
  max_bytes: usize,
}

impl HttpAssetLoader {
  pub fn new(backend: Arc<dyn HttpBackend>) -> Self {
    Self {
      backend,
      cache: Mutex::new(AssetCache::default()),
      max_bytes: DEFAULT_MAX_BYTES,
    }
  }

  pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
    self.max_bytes = max_bytes;
    self
  }

  /// Cached bytes for `url`, if it has been loaded.
  pub fn cached(&self, url: &str) -> Option<Bytes> {
    self.cache.lock().assets.get(url).map(|a| a.bytes.clone())
  }

  pub fn len(&self) -> usize {
    self.cache.lock().assets.len()
  }

  /// Total cached bytes.
  pub fn size(&self) -> usize {
    self.cache.lock().total
  }
}

#[async_trait]
impl AssetLoader for HttpAssetLoader {
  async fn prefetch(&self, url: &str, options: PrefetchOptions) -> Result<(), TransportError> {
    let previous = self.cache.lock().assets.get(url).cloned();

    if let Some(asset) = &previous {
      if asset.policy == CachePolicy::Immutable || options.cache_policy == CachePolicy::Immutable {
        debug!(url, "Immutable asset already cached");
        return Ok(());
      }
    }

    let parsed = Url::parse(url).map_err(|e| TransportError::InvalidPath(format!("{}: {}", url, e)))?;
    let mut request = HttpRequest::get(parsed);
    request.headers.push(("Accept".to_string(), "image/*,*/*;q=0.8".to_string()));
    if let Some(asset) = &previous {
      if let Some(etag) = &asset.etag {
        request.headers.push(("If-None-Match".to_string(), etag.clone()));
      }
      if let Some(modified) = &asset.last_modified {
        request
          .headers
          .push(("If-Modified-Since".to_string(), modified.clone()));
      }
    }

    let response = self.backend.execute(request).await?;

    if response.status == 304 && previous.is_some() {
      debug!(url, "Asset not modified");
      return Ok(());
    }

    if !response.is_success() {
      return Err(TransportError::Rejected {
        status: response.status,
        message: format!("Failed to load asset {}", url),
      });
    }

    let asset = CachedAsset {
      etag: response.header("etag").map(String::from),
      last_modified: response.header("last-modified").map(String::from),
      bytes: response.body,
      policy: options.cache_policy,
      seq: 0,
    };
    if asset.bytes.len() > self.max_bytes {
      debug!(url, bytes = asset.bytes.len(), "Asset larger than cache budget, not kept");
      return Ok(());
    }
    debug!(url, bytes = asset.bytes.len(), priority = ?options.priority, "Asset cached");
    self
      .cache
      .lock()
      .insert(url.to_string(), asset, self.max_bytes);

    Ok(())
  }
}
