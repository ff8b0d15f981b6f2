//! Cache-aware data access for a storefront REST backend.
//!
//! [`transport`] talks to the API with retry and credential handling,
//! [`cache`] de-duplicates and caches reads, [`paginate`] and [`query`] build
//! on it for lists and polled handles, [`prefetch`] warms images, and
//! [`storefront`] ties it together for the shop's resources.

pub mod cache;
pub mod config;
pub mod logging;
pub mod paginate;
pub mod prefetch;
pub mod query;
pub mod storefront;
pub mod transport;
