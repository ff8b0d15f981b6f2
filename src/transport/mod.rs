//! Resilient request transport.
//!
//! Every call to the storefront backend goes through [`Transport`], which:
//! - Resolves paths against a single configured origin
//! - Attaches the stored bearer credential when there is one
//! - Classifies failures into network errors, rejections and 401s
//! - Retries network errors (and only those) with exponential backoff

mod backend;
mod client;
mod credentials;
mod error;
mod message;
mod retry;

#[cfg(test)]
pub mod testing;

pub use backend::{HttpBackend, HttpRequest, HttpResponse, ReqwestBackend};
pub use client::{RequestDescriptor, Transport};
pub use credentials::{CredentialStore, MemoryCredentialStore, SqliteCredentialStore};
pub use error::{NetworkErrorKind, TransportError};
pub use retry::RetryPolicy;
