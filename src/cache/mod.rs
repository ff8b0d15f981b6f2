//! Result cache with staleness and dependency control.
//!
//! This module provides a transport-agnostic query cache that:
//! - Keys results by canonical [`QueryKey`]s, with prefix families for invalidation
//! - Serves fresh data without touching the network
//! - Serves stale data immediately while revalidating in the background
//! - Keeps at most one fetch in flight per key
//! - Suppresses fetching entirely for disabled (dependent) queries

mod coordinator;
mod key;
mod store;
mod traits;

pub use coordinator::{QueryCoordinator, QueryOptions};
pub use key::QueryKey;
pub use store::{CacheEntry, CacheEvent, CacheStore, EntryStatus, ListenerHandle};
pub use traits::{CacheSource, QueryResult};
