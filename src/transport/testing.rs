//! Scripted collaborators for exercising the transport without a network.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::backend::{HttpBackend, HttpRequest, HttpResponse};
use super::credentials::{CredentialStore, MemoryCredentialStore};
use super::error::{NetworkErrorKind, TransportError};

pub fn json_response(status: u16, body: Value) -> HttpResponse {
  HttpResponse {
    status,
    headers: vec![("content-type".to_string(), "application/json".to_string())],
    body: Bytes::from(serde_json::to_vec(&body).unwrap()),
  }
}

type Responder = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync>;

/// Replays queued outcomes in order, then falls back to a responder.
pub struct ScriptedBackend {
  queued: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
  fallback: Responder,
  latency: Duration,
  calls: Mutex<Vec<(Instant, HttpRequest)>>,
}

impl ScriptedBackend {
  pub fn new() -> Self {
    Self::responding(|_| Err(TransportError::network(NetworkErrorKind::Refused)))
  }

  pub fn responding<F>(responder: F) -> Self
  where
    F: Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
  {
    Self {
      queued: Mutex::new(VecDeque::new()),
      fallback: Box::new(responder),
      latency: Duration::ZERO,
      calls: Mutex::new(Vec::new()),
    }
  }

  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = latency;
    self
  }

  pub fn push(&self, outcome: Result<HttpResponse, TransportError>) {
    self.queued.lock().push_back(outcome);
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().len()
  }

  pub fn requests(&self) -> Vec<HttpRequest> {
    self.calls.lock().iter().map(|(_, r)| r.clone()).collect()
  }

  pub fn call_times(&self) -> Vec<Instant> {
    self.calls.lock().iter().map(|(t, _)| *t).collect()
  }
}

#[async_trait]
impl HttpBackend for ScriptedBackend {
  async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
    self.calls.lock().push((Instant::now(), request.clone()));
    if !self.latency.is_zero() {
      tokio::time::sleep(self.latency).await;
    }
    let queued = self.queued.lock().pop_front();
    match queued {
      Some(outcome) => outcome,
      None => (self.fallback)(&request),
    }
  }
}

/// Backend that never answers; only our own timeout can end the call.
pub struct HangingBackend;

#[async_trait]
impl HttpBackend for HangingBackend {
  async fn execute(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
    std::future::pending().await
  }
}

/// Credential store that counts the clears it receives.
#[derive(Default)]
pub struct RecordingCredentials {
  inner: MemoryCredentialStore,
  pub token_clears: AtomicUsize,
  pub identity_clears: AtomicUsize,
}

impl RecordingCredentials {
  pub fn with_token(token: &str) -> Arc<Self> {
    Arc::new(Self {
      inner: MemoryCredentialStore::with_token(token),
      ..Default::default()
    })
  }

  pub fn anonymous() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn clears(&self) -> (usize, usize) {
    (
      self.token_clears.load(Ordering::SeqCst),
      self.identity_clears.load(Ordering::SeqCst),
    )
  }
}

#[async_trait]
impl CredentialStore for RecordingCredentials {
  async fn get_token(&self) -> Option<String> {
    self.inner.get_token().await
  }

  async fn set_token(&self, token: &str) {
    self.inner.set_token(token).await
  }

  async fn clear_token(&self) {
    self.token_clears.fetch_add(1, Ordering::SeqCst);
    self.inner.clear_token().await
  }

  async fn get_identity(&self) -> Option<String> {
    self.inner.get_identity().await
  }

  async fn set_identity(&self, identity: &str) {
    self.inner.set_identity(identity).await
  }

  async fn clear_identity(&self) {
    self.identity_clears.fetch_add(1, Ordering::SeqCst);
    self.inner.clear_identity().await
  }
}
