//! In-memory cache store with per-key change listeners.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::key::QueryKey;
use crate::transport::TransportError;

/// Fetch status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
  Idle,
  Fetching,
  Error,
}

/// A single cached query result.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: QueryKey,
  /// Last successfully fetched payload. Survives later failed refreshes.
  pub data: Option<Value>,
  /// Monotonic time of the last successful fetch, used for staleness
  pub fetched_at: Option<Instant>,
  /// Wall-clock time of the last successful fetch, for display
  pub updated_at: Option<DateTime<Utc>>,
  pub stale_time: Duration,
  pub status: EntryStatus,
  pub error: Option<TransportError>,
  /// Id of the fetch allowed to write this entry, while one is running
  pub fetch_id: Option<u64>,
}

impl CacheEntry {
  fn empty(key: QueryKey) -> Self {
    Self {
      key,
      data: None,
      fetched_at: None,
      updated_at: None,
      stale_time: Duration::ZERO,
      status: EntryStatus::Idle,
      error: None,
      fetch_id: None,
    }
  }

  fn write(&mut self, data: Value, stale_time: Duration) {
    self.data = Some(data);
    self.fetched_at = Some(Instant::now());
    self.updated_at = Some(Utc::now());
    self.stale_time = stale_time;
    self.status = EntryStatus::Idle;
    self.error = None;
    self.fetch_id = None;
  }

  fn fail(&mut self, error: TransportError) {
    self.status = EntryStatus::Error;
    self.error = Some(error);
    self.fetch_id = None;
  }

  /// Whether the data is younger than `stale_time`.
  pub fn is_fresh(&self, stale_time: Duration) -> bool {
    match (self.data.as_ref(), self.fetched_at) {
      (Some(_), Some(at)) => at.elapsed() < stale_time,
      _ => false,
    }
  }
}

/// Change notification delivered to listeners of a key.
#[derive(Debug, Clone)]
pub enum CacheEvent {
  /// New data was written
  Updated(Value),
  /// A fetch failed; previously cached data (if any) is untouched
  Failed(TransportError),
  /// The entry was removed and the next read must refetch
  Invalidated,
  /// The whole store was emptied; data shown for the key must be dropped
  Cleared,
}

type Listener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

#[derive(Default)]
struct StoreInner {
  entries: Mutex<HashMap<QueryKey, CacheEntry>>,
  listeners: Mutex<HashMap<QueryKey, Vec<(u64, Listener)>>>,
  next_listener_id: AtomicU64,
  next_fetch_id: AtomicU64,
}

/// Keyed map of cache entries shared by everything built on one coordinator.
///
/// Cloning is cheap and yields a handle to the same store.
#[derive(Clone, Default)]
pub struct CacheStore {
  inner: Arc<StoreInner>,
}

impl CacheStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
    self.inner.entries.lock().get(key).cloned()
  }

  pub fn len(&self) -> usize {
    self.inner.entries.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Mark a fetch as started, creating a data-less entry if needed.
  ///
  /// Returns the fetch id to hand back to [`CacheStore::complete_fetch`].
  /// Any later write, invalidation or clear of the key supersedes it.
  pub fn begin_fetch(&self, key: &QueryKey) -> u64 {
    let fetch_id = self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed);
    let mut entries = self.inner.entries.lock();
    let entry = entries
      .entry(key.clone())
      .or_insert_with(|| CacheEntry::empty(key.clone()));
    entry.status = EntryStatus::Fetching;
    entry.fetch_id = Some(fetch_id);
    fetch_id
  }

  /// Record the outcome of fetch `fetch_id`, unless it was superseded.
  ///
  /// Returns `false` (and writes nothing) when the entry was invalidated,
  /// cleared or overwritten after the fetch began.
  pub fn complete_fetch(
    &self,
    key: &QueryKey,
    fetch_id: u64,
    result: &Result<Value, TransportError>,
    stale_time: Duration,
  ) -> bool {
    let event = {
      let mut entries = self.inner.entries.lock();
      match entries.get_mut(key) {
        Some(entry) if entry.fetch_id == Some(fetch_id) => match result {
          Ok(data) => {
            entry.write(data.clone(), stale_time);
            CacheEvent::Updated(data.clone())
          }
          Err(error) => {
            entry.fail(error.clone());
            CacheEvent::Failed(error.clone())
          }
        },
        _ => {
          debug!(key = %key, fetch_id, "Discarding result of superseded fetch");
          return false;
        }
      }
    };
    self.notify(key, &event);
    true
  }

  /// Write fresh data for `key` and notify its listeners.
  ///
  /// A fetch still running for the key can no longer overwrite this.
  pub fn set_data(&self, key: &QueryKey, data: Value, stale_time: Duration) {
    {
      let mut entries = self.inner.entries.lock();
      entries
        .entry(key.clone())
        .or_insert_with(|| CacheEntry::empty(key.clone()))
        .write(data.clone(), stale_time);
    }
    self.notify(key, &CacheEvent::Updated(data));
  }

  /// Record a failed fetch without evicting existing data.
  pub fn set_error(&self, key: &QueryKey, error: TransportError) {
    {
      let mut entries = self.inner.entries.lock();
      entries
        .entry(key.clone())
        .or_insert_with(|| CacheEntry::empty(key.clone()))
        .fail(error.clone());
    }
    self.notify(key, &CacheEvent::Failed(error));
  }

  /// Remove every entry in the `prefix` family. Returns how many were removed.
  pub fn invalidate(&self, prefix: &QueryKey) -> usize {
    let removed: Vec<QueryKey> = {
      let mut entries = self.inner.entries.lock();
      let keys: Vec<QueryKey> = entries
        .keys()
        .filter(|k| k.starts_with(prefix))
        .cloned()
        .collect();
      for key in &keys {
        entries.remove(key);
      }
      keys
    };

    debug!(prefix = %prefix, count = removed.len(), "Invalidated cache family");

    // Listeners of keys that had no entry yet still learn about it.
    let listening: Vec<QueryKey> = self
      .inner
      .listeners
      .lock()
      .keys()
      .filter(|k| k.starts_with(prefix))
      .cloned()
      .collect();
    for key in listening {
      self.notify(&key, &CacheEvent::Invalidated);
    }

    removed.len()
  }

  /// Drop every entry, e.g. when the session ends. Every listened key gets
  /// [`CacheEvent::Cleared`].
  pub fn clear(&self) {
    let removed = {
      let mut entries = self.inner.entries.lock();
      let count = entries.len();
      entries.clear();
      count
    };
    debug!(count = removed, "Cleared cache");

    let listening: Vec<QueryKey> = self.inner.listeners.lock().keys().cloned().collect();
    for key in listening {
      self.notify(&key, &CacheEvent::Cleared);
    }
  }

  /// Listen for changes to `key`. The listener is detached when the returned
  /// handle is dropped or [`ListenerHandle::unsubscribe`] is called.
  pub fn subscribe<F>(&self, key: &QueryKey, listener: F) -> ListenerHandle
  where
    F: Fn(&CacheEvent) + Send + Sync + 'static,
  {
    let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
    self
      .inner
      .listeners
      .lock()
      .entry(key.clone())
      .or_default()
      .push((id, Arc::new(listener)));

    ListenerHandle {
      store: Arc::downgrade(&self.inner),
      key: key.clone(),
      id,
    }
  }

  pub fn listener_count(&self, key: &QueryKey) -> usize {
    self
      .inner
      .listeners
      .lock()
      .get(key)
      .map(Vec::len)
      .unwrap_or(0)
  }

  fn notify(&self, key: &QueryKey, event: &CacheEvent) {
    // Call listeners outside the lock so they may touch the store.
    let listeners: Vec<Listener> = self
      .inner
      .listeners
      .lock()
      .get(key)
      .map(|ls| ls.iter().map(|(_, l)| Arc::clone(l)).collect())
      .unwrap_or_default();

    for listener in listeners {
      listener(event);
    }
  }
}

/// Keeps a store listener attached until dropped.
pub struct ListenerHandle {
  store: Weak<StoreInner>,
  key: QueryKey,
  id: u64,
}

impl ListenerHandle {
  pub fn unsubscribe(self) {
    // Drop does the work.
  }
}

impl Drop for ListenerHandle {
  fn drop(&mut self) {
    let Some(store) = self.store.upgrade() else {
      return;
    };
    let mut listeners = store.listeners.lock();
    if let Some(list) = listeners.get_mut(&self.key) {
      list.retain(|(id, _)| *id != self.id);
      if list.is_empty() {
        listeners.remove(&self.key);
      }
    }
  }
}
