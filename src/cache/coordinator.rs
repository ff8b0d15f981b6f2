//! Query coordinator: freshness checks, request de-duplication and
//! stale-while-revalidate on top of the cache store.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::key::QueryKey;
use super::store::{CacheEntry, CacheStore};
use super::traits::QueryResult;
use crate::transport::{NetworkErrorKind, TransportError};

type SharedFetch = Shared<BoxFuture<'static, Result<Value, TransportError>>>;

/// A running fetch and the store's id for it.
#[derive(Clone)]
struct InFlight {
  fetch_id: u64,
  fetch: SharedFetch,
}

/// Per-query options.
#[derive(Debug, Clone)]
pub struct QueryOptions {
  /// How long fetched data is served without revalidation
  pub stale_time: Duration,
  /// When false no fetch is ever started; used for dependent queries
  pub enabled: bool,
}

impl QueryOptions {
  pub fn new(stale_time: Duration) -> Self {
    Self {
      stale_time,
      enabled: true,
    }
  }

  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self::new(Duration::ZERO)
  }
}

/// Coordinates fetches for every key of one cache store.
///
/// At most one fetch per key is in flight; concurrent callers for the same
/// key attach to it. Fetches run on spawned tasks, so they complete (and
/// update the cache) even if every caller has gone away. Invalidating or
/// clearing a key detaches its running fetch: later reads start a new one,
/// and the old result is never written back.
#[derive(Clone, Default)]
pub struct QueryCoordinator {
  store: CacheStore,
  in_flight: Arc<Mutex<HashMap<QueryKey, InFlight>>>,
}

impl QueryCoordinator {
  pub fn new(store: CacheStore) -> Self {
    Self {
      store,
      in_flight: Arc::default(),
    }
  }

  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  pub fn is_fetching(&self, key: &QueryKey) -> bool {
    self.in_flight.lock().contains_key(key)
  }

  /// Read `key`, fetching with `fetcher` as needed.
  ///
  /// 1. Fresh cache - return it, no fetch
  /// 2. Stale cache - return it and revalidate in the background
  /// 3. Nothing cached - fetch and wait; on failure report the error
  ///
  /// `fetcher` is only invoked if a new fetch actually starts.
  pub async fn query<T, F, Fut>(
    &self,
    key: &QueryKey,
    options: &QueryOptions,
    fetcher: F,
  ) -> QueryResult<T>
  where
    T: DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, TransportError>> + Send + 'static,
  {
    let entry = self.store.get(key);
    let cached = entry.as_ref().and_then(|e| e.data.clone());
    let updated_at = entry.as_ref().and_then(|e| e.updated_at);
    let last_error = entry.as_ref().and_then(|e| e.error.clone());

    if !options.enabled {
      debug!(key = %key, "Query disabled, not fetching");
      return decode_result(QueryResult::disabled(cached, updated_at));
    }

    if let Some(data) = cached {
      if entry.as_ref().is_some_and(|e| e.is_fresh(options.stale_time)) {
        debug!(key = %key, "Cache hit (fresh)");
        return decode_result(QueryResult::from_cache(data, updated_at, false));
      }

      debug!(key = %key, "Cache hit (stale), revalidating in background");
      self.start_fetch(key, options, fetcher);
      return decode_result(QueryResult::from_cache(data, updated_at, true).with_error(last_error));
    }

    debug!(key = %key, "Cache miss");
    let fetch = self.start_fetch(key, options, fetcher);
    self.settle(key, fetch).await
  }

  /// Fetch `key` regardless of freshness, still sharing any in-flight fetch.
  pub async fn refetch<T, F, Fut>(
    &self,
    key: &QueryKey,
    options: &QueryOptions,
    fetcher: F,
  ) -> QueryResult<T>
  where
    T: DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, TransportError>> + Send + 'static,
  {
    if !options.enabled {
      let entry = self.store.get(key);
      return decode_result(QueryResult::disabled(
        entry.as_ref().and_then(|e| e.data.clone()),
        entry.as_ref().and_then(|e| e.updated_at),
      ));
    }

    let fetch = self.start_fetch(key, options, fetcher);
    self.settle(key, fetch).await
  }

  /// Write data directly, e.g. the server's answer to a mutation.
  pub fn set_data(&self, key: &QueryKey, data: Value, stale_time: Duration) {
    self.store.set_data(key, data, stale_time);
  }

  /// Invalidate every key in the `prefix` family, detaching running fetches.
  pub fn invalidate(&self, prefix: &QueryKey) -> usize {
    self.in_flight.lock().retain(|key, _| !key.starts_with(prefix));
    self.store.invalidate(prefix)
  }

  /// Drop every entry and detach every running fetch, e.g. on sign-out.
  pub fn clear(&self) {
    self.in_flight.lock().clear();
    self.store.clear();
  }

  async fn settle<T: DeserializeOwned>(&self, key: &QueryKey, fetch: SharedFetch) -> QueryResult<T> {
    match fetch.await {
      Ok(data) => {
        let updated_at = self.store.get(key).and_then(|e| e.updated_at);
        decode_result(QueryResult::from_network(data, updated_at))
      }
      Err(error) => {
        let entry: Option<CacheEntry> = self.store.get(key);
        decode_result(QueryResult::failed(
          entry.as_ref().and_then(|e| e.data.clone()),
          entry.as_ref().and_then(|e| e.updated_at),
          error,
        ))
      }
    }
  }

  /// Join the in-flight fetch for `key`, or start one.
  ///
  /// The registry lock is released before `fetcher` runs, so a fetcher may
  /// call back into the coordinator.
  fn start_fetch<F, Fut>(&self, key: &QueryKey, options: &QueryOptions, fetcher: F) -> SharedFetch
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, TransportError>> + Send + 'static,
  {
    let (sender, receiver) = oneshot::channel();
    let (fetch_id, fetch) = {
      let mut in_flight = self.in_flight.lock();
      if let Some(existing) = in_flight.get(key) {
        debug!(key = %key, "Joining in-flight fetch");
        return existing.fetch.clone();
      }

      let fetch_id = self.store.begin_fetch(key);
      let fetch = async move {
        receiver
          .await
          .unwrap_or_else(|_| Err(TransportError::network(NetworkErrorKind::Other)))
      }
      .boxed()
      .shared();
      in_flight.insert(
        key.clone(),
        InFlight {
          fetch_id,
          fetch: fetch.clone(),
        },
      );
      (fetch_id, fetch)
    };

    let store = self.store.clone();
    let registry = Arc::clone(&self.in_flight);
    let task_key = key.clone();
    let stale_time = options.stale_time;
    let request = fetcher();

    tokio::spawn(async move {
      let result = request.await;
      if let Err(e) = &result {
        if matches!(e, TransportError::Unauthorized { credential_cleared: false, .. }) {
          debug!(key = %task_key, "Query needs authentication: {}", e);
        } else {
          warn!(key = %task_key, "Query failed: {}", e);
        }
      }
      store.complete_fetch(&task_key, fetch_id, &result, stale_time);

      {
        let mut registry = registry.lock();
        if registry.get(&task_key).is_some_and(|f| f.fetch_id == fetch_id) {
          registry.remove(&task_key);
        }
      }
      // Nobody may be waiting any more.
      let _ = sender.send(result);
    });

    fetch
  }
}

/// Decode the JSON payload of a result into `T`.
fn decode_result<T: DeserializeOwned>(result: QueryResult<Value>) -> QueryResult<T> {
  let QueryResult {
    data,
    error,
    source,
    fetched_at,
    is_fetching,
  } = result;

  match data.map(serde_json::from_value::<T>).transpose() {
    Ok(data) => QueryResult {
      data,
      error,
      source,
      fetched_at,
      is_fetching,
    },
    Err(e) => QueryResult {
      data: None,
      error: Some(TransportError::from(e)),
      source,
      fetched_at,
      is_fetching,
    },
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::traits::CacheSource;
  use crate::transport::NetworkErrorKind;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};

  /// Fetcher factory counting invocations; each call yields the next value.
  fn counting(
    calls: &Arc<AtomicUsize>,
    latency: Duration,
    fail: bool,
  ) -> impl FnOnce() -> BoxFuture<'static, Result<Value, TransportError>> {
    let calls = Arc::clone(calls);
    move || {
      let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
      async move {
        tokio::time::sleep(latency).await;
        if fail {
          Err(TransportError::network(NetworkErrorKind::Unreachable))
        } else {
          Ok(json!(n))
        }
      }
      .boxed()
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_fresh_then_stale_while_revalidate() {
    let coordinator = QueryCoordinator::default();
    let key = QueryKey::new("categories");
    let options = QueryOptions::new(Duration::from_secs(60));
    let calls = Arc::new(AtomicUsize::new(0));

    let first: QueryResult<u32> = coordinator
      .query(&key, &options, counting(&calls, Duration::ZERO, false))
      .await;
    assert_eq!(first.data, Some(1));
    assert_eq!(first.source, CacheSource::Network);

    tokio::time::advance(Duration::from_secs(59)).await;
    let fresh: QueryResult<u32> = coordinator
      .query(&key, &options, counting(&calls, Duration::ZERO, false))
      .await;
    assert_eq!(fresh.data, Some(1));
    assert_eq!(fresh.source, CacheSource::CacheFresh);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(1)).await;
    let stale: QueryResult<u32> = coordinator
      .query(&key, &options, counting(&calls, Duration::from_millis(100), false))
      .await;
    assert_eq!(stale.data, Some(1));
    assert_eq!(stale.source, CacheSource::CacheStale);
    assert!(stale.is_fetching);
    assert_eq!(calls.load(Ordering::SeqCst), 1 + 1);

    // A read while the refresh is running does not start another.
    let again: QueryResult<u32> = coordinator
      .query(&key, &options, counting(&calls, Duration::ZERO, false))
      .await;
    assert_eq!(again.data, Some(1));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let refreshed: QueryResult<u32> = coordinator
      .query(&key, &options, counting(&calls, Duration::ZERO, false))
      .await;
    assert_eq!(refreshed.data, Some(2));
    assert_eq!(refreshed.source, CacheSource::CacheFresh);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_misses_share_one_fetch() {
    let coordinator = QueryCoordinator::default();
    let key = QueryKey::new("banners");
    let options = QueryOptions::default();
    let calls = Arc::new(AtomicUsize::new(0));

    let (a, b): (QueryResult<u32>, QueryResult<u32>) = tokio::join!(
      coordinator.query(&key, &options, counting(&calls, Duration::from_millis(50), false)),
      coordinator.query(&key, &options, counting(&calls, Duration::from_millis(50), false)),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.data, Some(1));
    assert_eq!(b.data, Some(1));
    assert!(!coordinator.is_fetching(&key));
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_refresh_keeps_previous_data() {
    let coordinator = QueryCoordinator::default();
    let key = QueryKey::new("product").push("p1");
    let options = QueryOptions::new(Duration::from_secs(10));
    let calls = Arc::new(AtomicUsize::new(0));

    let _: QueryResult<u32> = coordinator
      .query(&key, &options, counting(&calls, Duration::ZERO, false))
      .await;
    tokio::time::advance(Duration::from_secs(11)).await;

    let failed: QueryResult<u32> = coordinator
      .refetch(&key, &options, counting(&calls, Duration::ZERO, true))
      .await;
    assert_eq!(failed.data, Some(1));
    assert_eq!(failed.source, CacheSource::Offline);
    assert_eq!(failed.error.as_ref().map(TransportError::status), Some(0));

    let entry = coordinator.store().get(&key).unwrap();
    assert_eq!(entry.data, Some(json!(1)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_miss_failure_surfaces_error() {
    let coordinator = QueryCoordinator::default();
    let key = QueryKey::new("orders");
    let calls = Arc::new(AtomicUsize::new(0));

    let result: QueryResult<u32> = coordinator
      .query(&key, &QueryOptions::default(), counting(&calls, Duration::ZERO, true))
      .await;

    assert_eq!(result.data, None);
    assert!(result.error.is_some());
    assert_eq!(result.source, CacheSource::Empty);
    assert!(!result.is_loading());
  }

  #[tokio::test(start_paused = true)]
  async fn test_disabled_query_never_fetches() {
    let coordinator = QueryCoordinator::default();
    let key = QueryKey::new("orders").push("mine");
    let calls = Arc::new(AtomicUsize::new(0));

    let result: QueryResult<u32> = coordinator
      .query(
        &key,
        &QueryOptions::default().enabled(false),
        counting(&calls, Duration::ZERO, false),
      )
      .await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(result.data, None);
    assert!(result.error.is_none());
    assert!(!result.is_loading());
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidation_forces_refetch() {
    let coordinator = QueryCoordinator::default();
    let key = QueryKey::new("products").push(json!({})).push(1);
    let options = QueryOptions::new(Duration::from_secs(300));
    let calls = Arc::new(AtomicUsize::new(0));

    let _: QueryResult<u32> = coordinator
      .query(&key, &options, counting(&calls, Duration::ZERO, false))
      .await;
    coordinator.invalidate(&QueryKey::new("products"));

    let result: QueryResult<u32> = coordinator
      .query(&key, &options, counting(&calls, Duration::ZERO, false))
      .await;
    assert_eq!(result.data, Some(2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidation_detaches_running_fetch() {
    let coordinator = QueryCoordinator::default();
    let key = QueryKey::new("products").push(json!({})).push(1);
    let options = QueryOptions::new(Duration::from_secs(300));
    let calls = Arc::new(AtomicUsize::new(0));

    let reader = coordinator.clone();
    let first_key = key.clone();
    let first_options = options.clone();
    let first = tokio::spawn({
      let calls = Arc::clone(&calls);
      async move {
        let result: QueryResult<u32> = reader
          .query(&first_key, &first_options, counting(&calls, Duration::from_millis(100), false))
          .await;
        result
      }
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(coordinator.is_fetching(&key));
    coordinator.invalidate(&QueryKey::new("products"));
    assert!(!coordinator.is_fetching(&key));

    // The read after the write does not join the earlier fetch.
    let after: QueryResult<u32> = coordinator
      .query(&key, &options, counting(&calls, Duration::from_millis(100), false))
      .await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(after.data, Some(2));

    // The earlier caller still gets its answer, but it never reaches the cache.
    assert_eq!(first.await.unwrap().data, Some(1));
    let later: QueryResult<u32> = coordinator
      .query(&key, &options, counting(&calls, Duration::ZERO, false))
      .await;
    assert_eq!(later.data, Some(2));
    assert_eq!(later.source, CacheSource::CacheFresh);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_clear_discards_running_fetch() {
    let coordinator = QueryCoordinator::default();
    let key = QueryKey::new("orders").push("mine");
    let options = QueryOptions::new(Duration::from_secs(60));
    let calls = Arc::new(AtomicUsize::new(0));

    let reader = coordinator.clone();
    let task_key = key.clone();
    let task_options = options.clone();
    let pending = tokio::spawn({
      let calls = Arc::clone(&calls);
      async move {
        let _: QueryResult<u32> = reader
          .query(&task_key, &task_options, counting(&calls, Duration::from_millis(100), false))
          .await;
      }
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    coordinator.clear();
    pending.await.unwrap();

    assert!(coordinator.store().get(&key).is_none());
    assert!(!coordinator.is_fetching(&key));
  }

  #[tokio::test]
  async fn test_fetcher_may_call_back_into_coordinator() {
    let coordinator = QueryCoordinator::default();
    let key = QueryKey::new("brands");
    let observer = coordinator.clone();
    let observed_key = key.clone();

    let result: QueryResult<bool> = coordinator
      .query(&key, &QueryOptions::default(), move || {
        let fetching = observer.is_fetching(&observed_key);
        async move { Ok::<_, TransportError>(json!(fetching)) }
      })
      .await;

    assert_eq!(result.data, Some(true));
  }

  #[tokio::test]
  async fn test_decode_mismatch_is_an_error() {
    let coordinator = QueryCoordinator::default();
    let key = QueryKey::new("brands");

    let result: QueryResult<Vec<String>> = coordinator
      .query(&key, &QueryOptions::default(), || async {
        Ok::<_, TransportError>(json!({ "not": "a list" }))
      })
      .await;

    assert!(result.data.is_none());
    assert!(matches!(result.error, Some(TransportError::Decode(_))));
  }
}
