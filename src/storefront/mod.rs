//! Storefront domain: wire types and the cached API client.

pub mod api_types;
pub mod client;
pub mod types;

pub use client::StorefrontClient;
pub use types::{Banner, Brand, Category, Order, Product, ProductFilters};
