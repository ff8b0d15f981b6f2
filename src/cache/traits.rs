//! Result and source types returned by the query coordinator.

use chrono::{DateTime, Utc};

use crate::transport::TransportError;

/// Result of a query, including data and metadata about where it came from.
///
/// Absence of data is not an error: a query that has nothing yet reports
/// `data: None`, and `error` is only set when a fetch actually failed.
#[derive(Debug, Clone)]
pub struct QueryResult<T> {
  /// The data, if any is available
  pub data: Option<T>,
  /// The most recent fetch failure for this key, if it has not been superseded
  pub error: Option<TransportError>,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was fetched (wall clock)
  pub fetched_at: Option<DateTime<Utc>>,
  /// A fetch for this key is still running (background revalidation)
  pub is_fetching: bool,
}

impl<T> QueryResult<T> {
  /// Fresh data straight from the network.
  pub fn from_network(data: T, fetched_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data: Some(data),
      error: None,
      source: CacheSource::Network,
      fetched_at,
      is_fetching: false,
    }
  }

  /// Data served from cache. Stale data means a background refresh was started.
  pub fn from_cache(data: T, fetched_at: Option<DateTime<Utc>>, is_stale: bool) -> Self {
    Self {
      data: Some(data),
      error: None,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      fetched_at,
      is_fetching: is_stale,
    }
  }

  /// The fetch failed; whatever was cached before is still served.
  pub fn failed(previous: Option<T>, fetched_at: Option<DateTime<Utc>>, error: TransportError) -> Self {
    let source = if previous.is_some() {
      CacheSource::Offline
    } else {
      CacheSource::Empty
    };
    Self {
      data: previous,
      error: Some(error),
      source,
      fetched_at,
      is_fetching: false,
    }
  }

  /// Fetching is suppressed; only what is already cached is returned.
  pub fn disabled(cached: Option<T>, fetched_at: Option<DateTime<Utc>>) -> Self {
    Self {
      source: if cached.is_some() {
        CacheSource::CacheStale
      } else {
        CacheSource::Empty
      },
      data: cached,
      error: None,
      fetched_at,
      is_fetching: false,
    }
  }

  pub fn with_error(mut self, error: Option<TransportError>) -> Self {
    self.error = error;
    self
  }

  /// No data yet, but a fetch is on its way.
  pub fn is_loading(&self) -> bool {
    self.data.is_none() && self.is_fetching
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> QueryResult<U> {
    QueryResult {
      data: self.data.map(f),
      error: self.error,
      source: self.source,
      fetched_at: self.fetched_at,
      is_fetching: self.is_fetching,
    }
  }
}

/// Indicates where query data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache past its staleness window; a refresh is in progress or suppressed
  CacheStale,
  /// The refresh failed, serving the previously cached data
  Offline,
  /// Nothing cached and nothing fetched
  Empty,
}
