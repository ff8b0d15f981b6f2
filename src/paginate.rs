//! Cursor-paginated infinite list over the query coordinator.
//!
//! Each page is cached under `[family, filters, page_number]`, so pages are
//! independently cacheable and revalidated, and every page request goes
//! through the retrying transport. The cursor only moves forward, and only
//! after a page was actually obtained.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::{CacheSource, QueryCoordinator, QueryKey, QueryOptions, QueryResult};
use crate::transport::TransportError;

/// Position within a paginated family, as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageCursor {
  #[serde(alias = "page", alias = "currentPage")]
  pub page_number: u32,
  #[serde(alias = "pages")]
  pub total_pages: u32,
  #[serde(alias = "limit", default)]
  pub page_size: u32,
}

/// One page of results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
  #[serde(alias = "products", alias = "data")]
  pub items: Vec<T>,
  #[serde(alias = "pagination")]
  pub cursor: PageCursor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginatorState {
  Idle,
  FetchingFirst,
  FetchingNext,
  /// The last page has been loaded
  Exhausted,
}

type PageFetcher = Arc<dyn Fn(u32) -> BoxFuture<'static, Result<Value, TransportError>> + Send + Sync>;
type PageHook<T> = Arc<dyn Fn(u32, &[T]) + Send + Sync>;

struct PaginatorInner<T> {
  pages: Vec<Vec<T>>,
  cursor: Option<PageCursor>,
  state: PaginatorState,
  error: Option<TransportError>,
  /// Bumped by `refresh` so results from before the reset are discarded
  generation: u64,
}

/// Incremental page loader. Clones share state.
pub struct Paginator<T> {
  inner: Arc<Mutex<PaginatorInner<T>>>,
  coordinator: QueryCoordinator,
  family: QueryKey,
  options: QueryOptions,
  fetch_page: PageFetcher,
  on_page: Option<PageHook<T>>,
}

impl<T> Clone for Paginator<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
      coordinator: self.coordinator.clone(),
      family: self.family.clone(),
      options: self.options.clone(),
      fetch_page: Arc::clone(&self.fetch_page),
      on_page: self.on_page.clone(),
    }
  }
}

impl<T> Paginator<T>
where
  T: DeserializeOwned + Clone + Send + 'static,
{
  /// `family` is the key prefix shared by all pages, e.g. `["products", filters]`.
  /// `fetch_page` receives the 1-based page number.
  pub fn new<F, Fut>(
    coordinator: QueryCoordinator,
    family: QueryKey,
    options: QueryOptions,
    fetch_page: F,
  ) -> Self
  where
    F: Fn(u32) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TransportError>> + Send + 'static,
  {
    Self {
      inner: Arc::new(Mutex::new(PaginatorInner {
        pages: Vec::new(),
        cursor: None,
        state: PaginatorState::Idle,
        error: None,
        generation: 0,
      })),
      coordinator,
      family,
      options,
      fetch_page: Arc::new(move |page| fetch_page(page).boxed()),
      on_page: None,
    }
  }

  /// Called with each newly loaded page, e.g. to prefetch its images.
  pub fn on_page<H>(mut self, hook: H) -> Self
  where
    H: Fn(u32, &[T]) + Send + Sync + 'static,
  {
    self.on_page = Some(Arc::new(hook));
    self
  }

  pub fn family(&self) -> &QueryKey {
    &self.family
  }

  /// Load the next page. No-op while a page is loading or once exhausted.
  pub async fn next_page(&self) {
    let (page_number, generation) = {
      let mut inner = self.inner.lock();
      if inner.state != PaginatorState::Idle {
        debug!(family = %self.family, state = ?inner.state, "next_page ignored");
        return;
      }
      let next = inner.cursor.map(|c| c.page_number + 1).unwrap_or(1);
      inner.state = if next == 1 {
        PaginatorState::FetchingFirst
      } else {
        PaginatorState::FetchingNext
      };
      (next, inner.generation)
    };

    let key = self.family.clone().push(page_number);
    let fetch_page = Arc::clone(&self.fetch_page);
    let result: QueryResult<Page<T>> = self
      .coordinator
      .query(&key, &self.options, move || fetch_page(page_number))
      .await;

    let loaded = {
      let mut inner = self.inner.lock();
      if inner.generation != generation {
        debug!(family = %self.family, page = page_number, "Discarding page from before refresh");
        return;
      }
      Self::apply(&mut inner, &self.family, page_number, result)
    };

    if let (Some(items), Some(hook)) = (loaded, &self.on_page) {
      hook(page_number, &items);
    }
  }

  /// Record the outcome of a page fetch; returns the page's items on success.
  fn apply(
    inner: &mut PaginatorInner<T>,
    family: &QueryKey,
    page_number: u32,
    result: QueryResult<Page<T>>,
  ) -> Option<Vec<T>> {
    let obtained = matches!(
      result.source,
      CacheSource::Network | CacheSource::CacheFresh | CacheSource::CacheStale
    );

    match result.data {
      Some(page) if obtained => {
        let total_pages = page.cursor.total_pages;
        inner.cursor = Some(PageCursor {
          page_number,
          total_pages,
          page_size: page.cursor.page_size,
        });
        inner.pages.push(page.items.clone());
        inner.error = None;
        inner.state = if page_number >= total_pages {
          info!(family = %family, pages = page_number, "Reached last page");
          PaginatorState::Exhausted
        } else {
          PaginatorState::Idle
        };
        Some(page.items)
      }
      _ => {
        inner.state = PaginatorState::Idle;
        inner.error = Some(
          result
            .error
            .unwrap_or_else(|| TransportError::Decode(format!("page {} had no data", page_number))),
        );
        None
      }
    }
  }

  /// Pull-to-refresh: drop every cached page of the family and load page 1 again.
  pub async fn refresh(&self) {
    {
      let mut inner = self.inner.lock();
      inner.pages.clear();
      inner.cursor = None;
      inner.error = None;
      inner.state = PaginatorState::Idle;
      inner.generation += 1;
    }
    self.coordinator.invalidate(&self.family);
    self.next_page().await;
  }

  pub fn has_more(&self) -> bool {
    self.inner.lock().state != PaginatorState::Exhausted
  }

  pub fn state(&self) -> PaginatorState {
    self.inner.lock().state
  }

  pub fn is_loading(&self) -> bool {
    self.state() == PaginatorState::FetchingFirst
  }

  pub fn is_fetching_next_page(&self) -> bool {
    self.state() == PaginatorState::FetchingNext
  }

  pub fn cursor(&self) -> Option<PageCursor> {
    self.inner.lock().cursor
  }

  pub fn error(&self) -> Option<TransportError> {
    self.inner.lock().error.clone()
  }

  pub fn page_count(&self) -> usize {
    self.inner.lock().pages.len()
  }

  /// All loaded items, pages concatenated in fetch order.
  pub fn items(&self) -> Vec<T> {
    self.inner.lock().pages.iter().flatten().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.inner.lock().pages.iter().map(Vec::len).sum()
  }

  /// Whether scrolling to `last_visible_index` should trigger `next_page`:
  /// true once no more than `threshold` loaded items remain below it.
  pub fn should_load_more(&self, last_visible_index: usize, threshold: usize) -> bool {
    let inner = self.inner.lock();
    if inner.state != PaginatorState::Idle {
      return false;
    }
    let loaded: usize = inner.pages.iter().map(Vec::len).sum();
    loaded.saturating_sub(last_visible_index + 1) <= threshold
  }
}
