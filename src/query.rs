//! Subscription handle for UI code, built on the query coordinator.
//!
//! Inspired by TanStack Query, [`Query<T>`] exposes `data`, `is_loading`,
//! `error` and `refetch` for one key, and keeps itself current by listening
//! to the cache store: background refreshes started by anyone sharing the
//! key, failures, and invalidations after writes all show up on the next
//! `poll()`.
//!
//! # Example
//!
//! ```ignore
//! let transport = transport.clone();
//! let mut query: Query<Vec<Brand>> = Query::new(
//!     coordinator.clone(),
//!     QueryKey::new("brands"),
//!     QueryOptions::new(Duration::from_secs(900)),
//!     move || {
//!         let transport = transport.clone();
//!         async move { transport.get("/brands").await }
//!     },
//! );
//!
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! match (query.data(), query.error()) {
//!     (Some(brands), _) => render_brands(brands),
//!     (None, Some(e)) => render_error(e),
//!     (None, None) if query.is_loading() => render_spinner(),
//!     _ => {}
//! }
//! ```

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::cache::{
  CacheEvent, CacheSource, ListenerHandle, QueryCoordinator, QueryKey, QueryOptions, QueryResult,
};
use crate::transport::TransportError;

/// What a subscriber sees for its key.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
  pub data: Option<T>,
  /// A fetch is running and there is no data to show yet
  pub is_loading: bool,
  /// A fetch is running, possibly behind existing data
  pub is_fetching: bool,
  pub error: Option<TransportError>,
  pub source: CacheSource,
}

impl<T> Default for QueryState<T> {
  fn default() -> Self {
    Self {
      data: None,
      is_loading: false,
      is_fetching: false,
      error: None,
      source: CacheSource::Empty,
    }
  }
}

/// A factory function that creates futures for fetching data
type FetcherFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, TransportError>> + Send + Sync>;

enum Message<T> {
  /// Result of a fetch started in the given generation
  Settled(u64, QueryResult<T>),
  Cache(CacheEvent),
}

/// Reactive query over one cache key.
///
/// Query<T> encapsulates:
/// - The fetching logic (via a closure)
/// - Loading/data/error state
/// - Async result and cache-change delivery via a channel
pub struct Query<T> {
  state: QueryState<T>,
  coordinator: QueryCoordinator,
  key: QueryKey,
  options: QueryOptions,
  fetcher: FetcherFn,
  sender: mpsc::UnboundedSender<Message<T>>,
  receiver: mpsc::UnboundedReceiver<Message<T>>,
  /// Bumped on invalidation; results of fetches started earlier are dropped
  generation: u64,
  _listener: ListenerHandle,
}

impl<T: DeserializeOwned + Send + 'static> Query<T> {
  /// Create a query for `key`. Nothing is fetched until [`Query::fetch`].
  pub fn new<F, Fut>(
    coordinator: QueryCoordinator,
    key: QueryKey,
    options: QueryOptions,
    fetcher: F,
  ) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TransportError>> + Send + 'static,
  {
    let (sender, receiver) = mpsc::unbounded_channel();

    let listener_tx = sender.clone();
    let listener = coordinator.store().subscribe(&key, move |event| {
      // Ignore send errors - the query may have been dropped
      let _ = listener_tx.send(Message::Cache(event.clone()));
    });

    Self {
      state: QueryState::default(),
      coordinator,
      key,
      options,
      fetcher: Arc::new(move || fetcher().boxed()),
      sender,
      receiver,
      generation: 0,
      _listener: listener,
    }
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data.as_ref()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading
  }

  pub fn is_fetching(&self) -> bool {
    self.state.is_fetching
  }

  pub fn error(&self) -> Option<&TransportError> {
    self.state.error.as_ref()
  }

  /// Enable or disable fetching, e.g. once the user signs in.
  pub fn set_enabled(&mut self, enabled: bool) {
    self.options.enabled = enabled;
  }

  /// Read through the cache. A no-op while a fetch is already running.
  pub fn fetch(&mut self) {
    if self.state.is_fetching {
      return;
    }
    self.start(false);
  }

  /// Fetch regardless of freshness. Joins a fetch already in flight for the key.
  pub fn refetch(&mut self) {
    self.start(true);
  }

  /// Apply pending results and cache changes.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;
    let mut invalidated = false;

    while let Ok(message) = self.receiver.try_recv() {
      changed = true;
      match message {
        Message::Settled(generation, result) => {
          if generation == self.generation {
            self.apply(result);
          } else {
            debug!(key = %self.key, "Dropping result of a fetch started before invalidation");
          }
        }
        Message::Cache(CacheEvent::Updated(data)) => match serde_json::from_value(data) {
          Ok(data) => {
            self.state.data = Some(data);
            self.state.error = None;
            self.state.source = CacheSource::Network;
            self.settle_flags(false);
          }
          Err(e) => {
            self.state.error = Some(TransportError::from(e));
            self.settle_flags(false);
          }
        },
        Message::Cache(CacheEvent::Failed(error)) => {
          self.state.error = Some(error);
          if self.state.data.is_some() {
            self.state.source = CacheSource::Offline;
          }
          self.settle_flags(false);
        }
        Message::Cache(CacheEvent::Invalidated) => {
          self.generation += 1;
          invalidated = true;
        }
        Message::Cache(CacheEvent::Cleared) => {
          self.generation += 1;
          self.state = QueryState::default();
          invalidated = true;
        }
      }
    }

    if invalidated && self.options.enabled {
      debug!(key = %self.key, "Query invalidated, refetching");
      self.start(false);
    }

    changed
  }

  fn apply(&mut self, result: QueryResult<T>) {
    if result.data.is_some() {
      self.state.data = result.data;
    }
    self.state.error = result.error;
    self.state.source = result.source;
    self.settle_flags(result.is_fetching);
  }

  fn settle_flags(&mut self, is_fetching: bool) {
    self.state.is_fetching = is_fetching;
    self.state.is_loading = is_fetching && self.state.data.is_none();
  }

  fn start(&mut self, force: bool) {
    if !self.options.enabled {
      debug!(key = %self.key, "Query disabled, not fetching");
      return;
    }

    self.settle_flags(true);

    let coordinator = self.coordinator.clone();
    let key = self.key.clone();
    let options = self.options.clone();
    let fetcher = Arc::clone(&self.fetcher);
    let sender = self.sender.clone();
    let generation = self.generation;

    tokio::spawn(async move {
      let fetch = move || fetcher();
      let result = if force {
        coordinator.refetch(&key, &options, fetch).await
      } else {
        coordinator.query(&key, &options, fetch).await
      };
      // Ignore send errors - receiver may have been dropped
      let _ = sender.send(Message::Settled(generation, result));
    });
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("state", &self.state)
      .field("options", &self.options)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::NetworkErrorKind;
  use serde_json::json;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  fn counter_query(
    coordinator: &QueryCoordinator,
    key: &QueryKey,
    counter: &Arc<AtomicU32>,
  ) -> Query<u32> {
    let counter = Arc::clone(counter);
    Query::new(
      coordinator.clone(),
      key.clone(),
      QueryOptions::new(Duration::from_secs(60)),
      move || {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
          tokio::time::sleep(Duration::from_millis(50)).await;
          Ok::<_, TransportError>(json!(n))
        }
      },
    )
  }

  #[tokio::test]
  async fn test_query_success() {
    let mut query: Query<Vec<u32>> = Query::new(
      QueryCoordinator::default(),
      QueryKey::new("numbers"),
      QueryOptions::default(),
      || async { Ok::<_, TransportError>(json!([1, 2, 3])) },
    );

    assert!(!query.is_loading());

    query.fetch();
    assert!(query.is_loading());

    // Wait for the result
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(query.poll());
    assert!(!query.is_loading());
    assert_eq!(query.data(), Some(&vec![1, 2, 3]));
  }

  #[tokio::test]
  async fn test_query_error() {
    let mut query: Query<i32> = Query::new(
      QueryCoordinator::default(),
      QueryKey::new("broken"),
      QueryOptions::default(),
      || async { Err::<Value, _>(TransportError::network(NetworkErrorKind::Refused)) },
    );

    query.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(query.poll());
    assert!(query.data().is_none());
    assert_eq!(query.error().map(TransportError::status), Some(0));
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_while_loading_is_noop() {
    let counter = Arc::new(AtomicU32::new(0));
    let mut query = counter_query(&QueryCoordinator::default(), &QueryKey::new("n"), &counter);

    query.fetch();
    assert!(query.is_loading());

    // Second fetch should be no-op
    query.fetch();
    tokio::time::sleep(Duration::from_millis(100)).await;
    query.poll();

    assert_eq!(query.data(), Some(&1));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_refresh_by_one_subscriber_reaches_the_other() {
    let coordinator = QueryCoordinator::default();
    let key = QueryKey::new("n");
    let counter = Arc::new(AtomicU32::new(0));
    let mut first = counter_query(&coordinator, &key, &counter);
    let mut second = counter_query(&coordinator, &key, &counter);

    first.fetch();
    second.fetch();
    tokio::time::sleep(Duration::from_millis(100)).await;
    first.poll();
    second.poll();
    assert_eq!(first.data(), Some(&1));
    assert_eq!(second.data(), Some(&1));
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    first.refetch();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(second.poll());
    assert_eq!(second.data(), Some(&2));
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidation_triggers_refetch() {
    let coordinator = QueryCoordinator::default();
    let key = QueryKey::new("products").push(1);
    let counter = Arc::new(AtomicU32::new(0));
    let mut query = counter_query(&coordinator, &key, &counter);

    query.fetch();
    tokio::time::sleep(Duration::from_millis(100)).await;
    query.poll();

    coordinator.invalidate(&QueryKey::new("products"));
    assert!(query.poll());
    assert!(query.is_fetching());

    tokio::time::sleep(Duration::from_millis(100)).await;
    query.poll();
    assert_eq!(query.data(), Some(&2));
  }

  #[tokio::test(start_paused = true)]
  async fn test_write_during_fetch_shows_fresh_data() {
    let coordinator = QueryCoordinator::default();
    let key = QueryKey::new("products").push(1);
    let counter = Arc::new(AtomicU32::new(0));
    let mut query = counter_query(&coordinator, &key, &counter);

    query.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;
    coordinator.invalidate(&QueryKey::new("products"));
    assert!(query.poll());

    tokio::time::sleep(Duration::from_millis(100)).await;
    query.poll();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(query.data(), Some(&2));
    assert!(!query.is_fetching());
    assert_eq!(
      coordinator.store().get(&key).and_then(|e| e.data),
      Some(json!(2))
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_clear_drops_previous_session_data() {
    let coordinator = QueryCoordinator::default();
    let key = QueryKey::new("orders").push("mine");
    let mut query: Query<u32> = Query::new(
      coordinator.clone(),
      key.clone(),
      QueryOptions::new(Duration::from_secs(60)),
      || async { Ok::<_, TransportError>(json!(7)) },
    );

    query.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;
    query.poll();
    assert_eq!(query.data(), Some(&7));

    // Signed out: nothing is allowed to be fetched any more.
    query.set_enabled(false);
    coordinator.clear();

    assert!(query.poll());
    assert_eq!(query.data(), None);
    assert!(!query.is_fetching());
    assert!(coordinator.store().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_clear_during_fetch_discards_old_result() {
    let coordinator = QueryCoordinator::default();
    let key = QueryKey::new("orders").push("mine");
    let counter = Arc::new(AtomicU32::new(0));
    let mut query = counter_query(&coordinator, &key, &counter);

    query.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;
    query.set_enabled(false);
    coordinator.clear();

    tokio::time::sleep(Duration::from_millis(100)).await;
    query.poll();
    assert_eq!(query.data(), None);
    assert!(coordinator.store().get(&key).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_disabled_query_waits_until_enabled() {
    let counter = Arc::new(AtomicU32::new(0));
    let mut query = counter_query(&QueryCoordinator::default(), &QueryKey::new("n"), &counter);
    query.set_enabled(false);

    query.fetch();
    assert!(!query.is_loading());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!query.poll());
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    query.set_enabled(true);
    query.fetch();
    tokio::time::sleep(Duration::from_millis(100)).await;
    query.poll();
    assert_eq!(query.data(), Some(&1));
  }
}
