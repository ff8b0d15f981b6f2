//! Priority-tiered background asset prefetch.
//!
//! [`PrefetchScheduler`] accepts `(url, priority, cache policy)` requests,
//! coalesces repeated URLs into a single task, and drains three FIFO tiers
//! (high, then normal, then low) through a bounded number of concurrent
//! downloads so above-the-fold images win the connection.

mod loader;

pub use loader::{AssetLoader, HttpAssetLoader, DEFAULT_MAX_BYTES};

use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Visual importance of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  /// Banners, hero images, primary category icons
  High,
  /// Secondary list thumbnails
  Normal,
  /// Below-the-fold grid thumbnails
  Low,
}

impl Priority {
  const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

  fn tier(self) -> usize {
    self as usize
  }
}

/// How long the loader may keep an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
  /// Standard HTTP cache validation
  #[default]
  Default,
  /// Content never changes for a given URL; cache indefinitely
  Immutable,
}

/// Options handed to the [`AssetLoader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchOptions {
  pub priority: Priority,
  pub cache_policy: CachePolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
  Queued,
  InFlight,
  Done,
  Failed,
}

#[derive(Debug, Clone)]
pub struct PrefetchTask {
  pub url: String,
  pub priority: Priority,
  pub cache_policy: CachePolicy,
  pub state: TaskState,
}

/// Task counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchStats {
  pub queued: usize,
  pub in_flight: usize,
  pub done: usize,
  pub failed: usize,
}

#[derive(Default)]
struct SchedulerState {
  tasks: HashMap<String, PrefetchTask>,
  tiers: [VecDeque<String>; 3],
  active: usize,
  /// Deferred enqueues whose delay has not elapsed yet
  deferred: usize,
}

impl SchedulerState {
  fn pop_next(&mut self) -> Option<String> {
    for priority in Priority::ALL {
      while let Some(url) = self.tiers[priority.tier()].pop_front() {
        if self
          .tasks
          .get(&url)
          .is_some_and(|t| t.state == TaskState::Queued)
        {
          return Some(url);
        }
      }
    }
    None
  }

  fn is_idle(&self) -> bool {
    self.active == 0 && self.deferred == 0 && self.tiers.iter().all(VecDeque::is_empty)
  }
}

struct SchedulerInner {
  loader: Arc<dyn AssetLoader>,
  concurrency: usize,
  state: Mutex<SchedulerState>,
  idle: Notify,
}

/// Bounded-concurrency priority queue of asset downloads. Clones share state.
#[derive(Clone)]
pub struct PrefetchScheduler {
  inner: Arc<SchedulerInner>,
}

impl PrefetchScheduler {
  pub fn new(loader: Arc<dyn AssetLoader>, concurrency: usize) -> Self {
    Self {
      inner: Arc::new(SchedulerInner {
        loader,
        concurrency: concurrency.max(1),
        state: Mutex::new(SchedulerState::default()),
        idle: Notify::new(),
      }),
    }
  }

  /// Queue `url` for download.
  ///
  /// A no-op (returning `false`) if the URL is already queued, downloading
  /// or done. Failed URLs may be queued again.
  pub fn enqueue(&self, url: &str, priority: Priority, cache_policy: CachePolicy) -> bool {
    let queued = {
      let mut state = self.inner.state.lock();
      match state.tasks.get(url).map(|t| t.state) {
        Some(TaskState::Queued | TaskState::InFlight | TaskState::Done) => false,
        Some(TaskState::Failed) | None => {
          state.tasks.insert(
            url.to_string(),
            PrefetchTask {
              url: url.to_string(),
              priority,
              cache_policy,
              state: TaskState::Queued,
            },
          );
          state.tiers[priority.tier()].push_back(url.to_string());
          true
        }
      }
    };

    if queued {
      debug!(url, ?priority, "Prefetch queued");
    }
    pump(&self.inner);
    queued
  }

  /// Queue several URLs at the same tier, skipping empty strings.
  pub fn enqueue_many<I, S>(&self, urls: I, priority: Priority, cache_policy: CachePolicy) -> usize
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    urls
      .into_iter()
      .filter(|u| !u.as_ref().is_empty())
      .filter(|u| self.enqueue(u.as_ref(), priority, cache_policy))
      .count()
  }

  /// Queue URLs after `delay`, so they do not contend with assets needed for
  /// the first paint.
  pub fn enqueue_deferred(
    &self,
    delay: Duration,
    urls: Vec<String>,
    priority: Priority,
    cache_policy: CachePolicy,
  ) {
    self.inner.state.lock().deferred += 1;
    let scheduler = self.clone();
    tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      scheduler.inner.state.lock().deferred -= 1;
      scheduler.enqueue_many(urls, priority, cache_policy);
      pump(&scheduler.inner);
    });
  }

  pub fn state_of(&self, url: &str) -> Option<TaskState> {
    self.inner.state.lock().tasks.get(url).map(|t| t.state)
  }

  pub fn stats(&self) -> PrefetchStats {
    let state = self.inner.state.lock();
    let mut stats = PrefetchStats::default();
    for task in state.tasks.values() {
      match task.state {
        TaskState::Queued => stats.queued += 1,
        TaskState::InFlight => stats.in_flight += 1,
        TaskState::Done => stats.done += 1,
        TaskState::Failed => stats.failed += 1,
      }
    }
    stats
  }

  pub fn is_idle(&self) -> bool {
    self.inner.state.lock().is_idle()
  }

  /// Wait until nothing is queued, downloading or deferred.
  pub async fn wait_idle(&self) {
    loop {
      let notified = self.inner.idle.notified();
      if self.is_idle() {
        return;
      }
      notified.await;
    }
  }
}

/// Start queued tasks until the concurrency limit is reached.
fn pump(inner: &Arc<SchedulerInner>) {
  loop {
    let task = {
      let mut state = inner.state.lock();
      if state.active >= inner.concurrency {
        return;
      }
      let Some(url) = state.pop_next() else {
        if state.is_idle() {
          inner.idle.notify_waiters();
        }
        return;
      };
      let task = match state.tasks.get_mut(&url) {
        Some(task) => {
          task.state = TaskState::InFlight;
          task.clone()
        }
        None => continue,
      };
      state.active += 1;
      task
    };

    let worker = Arc::clone(inner);
    tokio::spawn(async move {
      let options = PrefetchOptions {
        priority: task.priority,
        cache_policy: task.cache_policy,
      };
      let outcome = worker.loader.prefetch(&task.url, options).await;

      let state_after = match &outcome {
        Ok(()) => TaskState::Done,
        Err(e) => {
          warn!(url = %task.url, "Prefetch failed: {}", e);
          TaskState::Failed
        }
      };

      {
        let mut state = worker.state.lock();
        state.active -= 1;
        if let Some(t) = state.tasks.get_mut(&task.url) {
          t.state = state_after;
        }
      }

      pump(&worker);
    });
  }
}
