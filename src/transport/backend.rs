//! The raw HTTP seam underneath the transport.
//!
//! [`HttpBackend`] knows nothing about credentials, envelopes or retries; it
//! performs one exchange and reports either a response (of any status) or a
//! classified network failure. Tests substitute scripted backends here.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use serde_json::Value;
use std::error::Error as StdError;
use std::time::Duration;
use url::Url;

use super::error::{NetworkErrorKind, TransportError};
use super::message::{classify_description, classify_io_kind};

/// A fully resolved request, ready to go on the wire.
#[derive(Debug, Clone)]
pub struct HttpRequest {
  pub method: Method,
  pub url: Url,
  pub bearer: Option<String>,
  pub headers: Vec<(String, String)>,
  pub body: Option<Value>,
}

impl HttpRequest {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      bearer: None,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// A response as received, regardless of status.
#[derive(Debug, Clone)]
pub struct HttpResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

impl HttpResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Parse the body as JSON. Non-JSON bodies become a JSON string so that a
  /// plain-text error message is still usable; an empty body is `null`.
  pub fn json(&self) -> Value {
    if self.body.is_empty() {
      return Value::Null;
    }
    serde_json::from_slice(&self.body)
      .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&self.body).into_owned()))
  }
}

/// Performs a single HTTP exchange.
#[async_trait]
pub trait HttpBackend: Send + Sync {
  /// `Err` is always [`TransportError::Network`]: no response was received.
  async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// [`HttpBackend`] backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct ReqwestBackend {
  client: reqwest::Client,
}

impl ReqwestBackend {
  pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .connect_timeout(timeout)
      .build()?;
    Ok(Self { client })
  }
}

impl ReqwestBackend {
  /// JSON is accepted unless the request names its own `Accept`.
  fn build(&self, request: HttpRequest) -> reqwest::RequestBuilder {
    let mut builder = self.client.request(request.method.clone(), request.url.clone());

    if request.header("accept").is_none() {
      builder = builder.header(reqwest::header::ACCEPT, "application/json");
    }
    if let Some(token) = &request.bearer {
      builder = builder.bearer_auth(token);
    }
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }
    builder
  }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
  async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
    let response = self
      .build(request)
      .send()
      .await
      .map_err(classify_reqwest_error)?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
      .collect();
    let body = response.bytes().await.map_err(classify_reqwest_error)?;

    Ok(HttpResponse {
      status,
      headers,
      body,
    })
  }
}

/// Classify a reqwest failure by walking its source chain for an I/O kind.
fn classify_reqwest_error(error: reqwest::Error) -> TransportError {
  if error.is_timeout() {
    return TransportError::network(NetworkErrorKind::Timeout);
  }

  let mut source: Option<&(dyn StdError + 'static)> = error.source();
  while let Some(cause) = source {
    if let Some(io) = cause.downcast_ref::<std::io::Error>() {
      let kind = classify_io_kind(io.kind());
      if kind != NetworkErrorKind::Other {
        return TransportError::network(kind);
      }
    }
    if let Some(kind) = classify_description(&cause.to_string()) {
      return TransportError::network(kind);
    }
    source = cause.source();
  }

  if error.is_connect() {
    return TransportError::network(NetworkErrorKind::Unreachable);
  }

  TransportError::network(NetworkErrorKind::Other)
}
