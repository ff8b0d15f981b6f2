//! Credentialed, retrying HTTP transport for the storefront REST API.

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::backend::{HttpBackend, HttpRequest, HttpResponse};
use super::credentials::CredentialStore;
use super::error::{NetworkErrorKind, TransportError};
use super::message::extract_error_message;
use super::retry::RetryPolicy;

/// One logical request. Lives across retries; `retry_count` records how many
/// retries have already been spent so a re-sent descriptor is never counted twice.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
  pub method: Method,
  pub path: String,
  pub body: Option<Value>,
  pub retry_count: u32,
  pub max_retries: u32,
}

impl RequestDescriptor {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      body: None,
      retry_count: 0,
      max_retries: 0,
    }
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  fn has_retries_left(&self) -> bool {
    self.retry_count < self.max_retries
  }
}

/// Sends requests to a single base origin, attaching the stored bearer token,
/// classifying failures and retrying network errors with exponential backoff.
#[derive(Clone)]
pub struct Transport {
  backend: Arc<dyn HttpBackend>,
  base_url: Url,
  credentials: Arc<dyn CredentialStore>,
  retry: RetryPolicy,
  timeout: Duration,
}

impl Transport {
  pub fn new(
    backend: Arc<dyn HttpBackend>,
    base_url: Url,
    credentials: Arc<dyn CredentialStore>,
  ) -> Self {
    let mut base_url = base_url;
    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }

    Self {
      backend,
      base_url,
      credentials,
      retry: RetryPolicy::default(),
      timeout: Duration::from_secs(30),
    }
  }

  pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  /// Per-attempt abort timer. A timed-out attempt counts as a network error.
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
    &self.credentials
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  /// Build a descriptor carrying this transport's retry budget.
  pub fn descriptor(&self, method: Method, path: impl Into<String>) -> RequestDescriptor {
    RequestDescriptor {
      max_retries: self.retry.max_retries,
      ..RequestDescriptor::new(method, path)
    }
  }

  pub async fn get(&self, path: &str) -> Result<Value, TransportError> {
    self.send(self.descriptor(Method::GET, path)).await
  }

  pub async fn post(&self, path: &str, body: Value) -> Result<Value, TransportError> {
    self
      .send(self.descriptor(Method::POST, path).with_body(body))
      .await
  }

  pub async fn put(&self, path: &str, body: Value) -> Result<Value, TransportError> {
    self
      .send(self.descriptor(Method::PUT, path).with_body(body))
      .await
  }

  pub async fn delete(&self, path: &str) -> Result<Value, TransportError> {
    self.send(self.descriptor(Method::DELETE, path)).await
  }

  /// GET and decode the unwrapped payload into `T`.
  pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, TransportError> {
    let payload = self.get(path).await?;
    Ok(serde_json::from_value(payload)?)
  }

  /// Send a request, retrying network failures while the descriptor has budget.
  pub async fn send(&self, mut descriptor: RequestDescriptor) -> Result<Value, TransportError> {
    let url = self.resolve(&descriptor.path)?;

    loop {
      match self.attempt(&descriptor, &url).await {
        Ok(payload) => return Ok(payload),
        Err(e) if descriptor.has_retries_left() && self.retry.is_retryable(&e) => {
          descriptor.retry_count += 1;
          let delay = self.retry.delay_for(descriptor.retry_count);
          warn!(
            method = %descriptor.method,
            path = %descriptor.path,
            retry = descriptor.retry_count,
            delay_ms = delay.as_millis() as u64,
            "Network error, retrying: {}",
            e
          );
          tokio::time::sleep(delay).await;
        }
        Err(e) => {
          if e.is_retryable() {
            warn!(
              method = %descriptor.method,
              path = %descriptor.path,
              attempts = descriptor.retry_count + 1,
              "Request failed: {}",
              e
            );
          }
          return Err(e);
        }
      }
    }
  }

  /// Resolve `path` against the base URL, refusing anything off-origin.
  pub fn resolve(&self, path: &str) -> Result<Url, TransportError> {
    let parsed = if path.contains("://") {
      Url::parse(path)
    } else {
      self.base_url.join(path.trim_start_matches('/'))
    };

    let url = parsed.map_err(|e| TransportError::InvalidPath(format!("{}: {}", path, e)))?;
    if url.origin() != self.base_url.origin() {
      return Err(TransportError::InvalidPath(format!(
        "{} is outside {}",
        path,
        self.base_url.origin().ascii_serialization()
      )));
    }
    Ok(url)
  }

  async fn attempt(
    &self,
    descriptor: &RequestDescriptor,
    url: &Url,
  ) -> Result<Value, TransportError> {
    let token = self.credentials.get_token().await;
    let request = HttpRequest {
      method: descriptor.method.clone(),
      url: url.clone(),
      bearer: token.clone(),
      headers: Vec::new(),
      body: descriptor.body.clone(),
    };

    let response = match tokio::time::timeout(self.timeout, self.backend.execute(request)).await {
      Ok(outcome) => outcome?,
      Err(_) => return Err(TransportError::network(NetworkErrorKind::Timeout)),
    };

    if response.is_success() {
      return unwrap_envelope(&response);
    }

    let message = extract_error_message(&response.json(), response.status);
    if response.status == 401 {
      return Err(self.reject_credential(token.is_some(), message).await);
    }

    Err(TransportError::Rejected {
      status: response.status,
      message,
    })
  }

  /// Handle a 401. A rejected anonymous call is expected and has no side
  /// effects; a rejected stored credential is wiped along with the identity.
  async fn reject_credential(&self, had_token: bool, message: String) -> TransportError {
    if !had_token {
      debug!("Anonymous request rejected with 401: {}", message);
      return TransportError::Unauthorized {
        message,
        credential_cleared: false,
      };
    }

    warn!("Stored credential rejected, clearing session: {}", message);
    self.credentials.clear_token().await;
    self.credentials.clear_identity().await;

    TransportError::Unauthorized {
      message,
      credential_cleared: true,
    }
  }
}

/// Unwrap `{ success, data, message? }` envelopes; anything else is the payload.
fn unwrap_envelope(response: &HttpResponse) -> Result<Value, TransportError> {
  let body = response.json();

  let Some(success) = body.get("success").and_then(Value::as_bool) else {
    return Ok(body);
  };

  if !success {
    return Err(TransportError::Rejected {
      status: response.status,
      message: extract_error_message(&body, response.status),
    });
  }

  match body {
    Value::Object(mut fields) => Ok(fields.remove("data").unwrap_or(Value::Object(fields))),
    other => Ok(other),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::testing::{
    json_response, HangingBackend, RecordingCredentials, ScriptedBackend,
  };
  use serde_json::json;
  use tokio::time::Instant;

  fn transport(backend: Arc<dyn HttpBackend>, credentials: Arc<dyn CredentialStore>) -> Transport {
    Transport::new(
      backend,
      Url::parse("https://shop.example.com/api").unwrap(),
      credentials,
    )
  }

  #[tokio::test(start_paused = true)]
  async fn test_network_failure_attempted_four_times_with_backoff() {
    let backend = Arc::new(ScriptedBackend::new());
    let client = transport(backend.clone(), RecordingCredentials::anonymous());

    let started = Instant::now();
    let err = client.get("/products").await.unwrap_err();

    assert_eq!(err.status(), 0);
    assert!(matches!(
      err,
      TransportError::Network {
        kind: NetworkErrorKind::Refused,
        ..
      }
    ));
    assert_eq!(backend.call_count(), 4);

    let times = backend.call_times();
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(times[0], started);
    assert_eq!(
      gaps,
      vec![
        Duration::from_millis(1000),
        Duration::from_millis(2000),
        Duration::from_millis(4000)
      ]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_rejections_are_attempted_once() {
    for status in [404u16, 422, 500] {
      let backend = Arc::new(ScriptedBackend::responding(move |_| {
        Ok(json_response(status, json!({ "message": "nope" })))
      }));
      let client = transport(backend.clone(), RecordingCredentials::anonymous());

      let err = client.get("/products").await.unwrap_err();
      assert_eq!(
        err,
        TransportError::Rejected {
          status,
          message: "nope".to_string()
        }
      );
      assert_eq!(backend.call_count(), 1);
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_recovers_after_transient_failure() {
    let backend = Arc::new(ScriptedBackend::responding(|_| {
      Ok(json_response(200, json!({ "success": true, "data": [1, 2] })))
    }));
    backend.push(Err(TransportError::network(NetworkErrorKind::Reset)));
    let client = transport(backend.clone(), RecordingCredentials::anonymous());

    let payload = client.get("/brands").await.unwrap();
    assert_eq!(payload, json!([1, 2]));
    assert_eq!(backend.call_count(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_descriptor_retry_count_is_respected() {
    let backend = Arc::new(ScriptedBackend::new());
    let client = transport(backend.clone(), RecordingCredentials::anonymous());

    let mut descriptor = client.descriptor(Method::GET, "/products");
    descriptor.retry_count = 2;
    client.send(descriptor).await.unwrap_err();

    assert_eq!(backend.call_count(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout_is_a_retryable_network_error() {
    let client = transport(Arc::new(HangingBackend), RecordingCredentials::anonymous())
      .with_retry_policy(RetryPolicy::new(1, Duration::from_millis(10)))
      .with_timeout(Duration::from_secs(30));

    let started = Instant::now();
    let err = client.get("/products").await.unwrap_err();

    assert!(matches!(
      err,
      TransportError::Network {
        kind: NetworkErrorKind::Timeout,
        ..
      }
    ));
    assert_eq!(started.elapsed(), Duration::from_millis(60_010));
  }

  #[tokio::test]
  async fn test_bearer_attached_when_present() {
    let backend = Arc::new(ScriptedBackend::responding(|_| {
      Ok(json_response(200, json!([])))
    }));
    let client = transport(backend.clone(), RecordingCredentials::with_token("tok"));

    client.get("orders/mine").await.unwrap();

    let request = &backend.requests()[0];
    assert_eq!(request.bearer.as_deref(), Some("tok"));
    assert_eq!(
      request.url.as_str(),
      "https://shop.example.com/api/orders/mine"
    );
  }

  #[tokio::test]
  async fn test_401_with_stored_credential_clears_session_once() {
    let backend = Arc::new(ScriptedBackend::responding(|_| {
      Ok(json_response(401, json!({ "message": "Token expired" })))
    }));
    let credentials = RecordingCredentials::with_token("stale");
    let client = transport(backend.clone(), credentials.clone());

    let err = client.get("/orders").await.unwrap_err();

    assert_eq!(
      err,
      TransportError::Unauthorized {
        message: "Token expired".to_string(),
        credential_cleared: true
      }
    );
    assert_eq!(credentials.clears(), (1, 1));
    assert_eq!(credentials.get_token().await, None);
    assert_eq!(backend.call_count(), 1);
  }

  #[tokio::test]
  async fn test_401_without_credential_has_no_side_effects() {
    let backend = Arc::new(ScriptedBackend::responding(|_| {
      Ok(json_response(401, json!({ "error": "No token provided" })))
    }));
    let credentials = RecordingCredentials::anonymous();
    let client = transport(backend, credentials.clone());

    let err = client.get("/orders").await.unwrap_err();

    assert!(err.is_unauthorized());
    assert_eq!(credentials.clears(), (0, 0));
  }

  #[tokio::test]
  async fn test_unsuccessful_envelope_is_a_rejection() {
    let backend = Arc::new(ScriptedBackend::responding(|_| {
      Ok(json_response(
        200,
        json!({ "success": false, "message": "Coupon expired" }),
      ))
    }));
    let client = transport(backend, RecordingCredentials::anonymous());

    let err = client.post("/cart/coupon", json!({ "code": "X" })).await.unwrap_err();
    assert_eq!(err.to_string(), "Coupon expired (status 200)");
  }

  #[test]
  fn test_resolve_rejects_other_origins() {
    let client = transport(
      Arc::new(ScriptedBackend::new()),
      RecordingCredentials::anonymous(),
    );

    assert!(client.resolve("https://evil.example.com/steal").is_err());
    assert_eq!(
      client
        .resolve("https://shop.example.com/api/products")
        .unwrap()
        .as_str(),
      "https://shop.example.com/api/products"
    );
  }
}
