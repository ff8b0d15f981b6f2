//! Turning raw failures into messages a person can read.

use serde_json::Value;
use std::io;

use super::error::NetworkErrorKind;

/// Extract a human-readable message from an error response body.
///
/// Tried in order: a plain string body, an `error` field, a `message` field,
/// an `errors` array, and finally an `errors` map of field-keyed validation
/// failures. Falls back to a generic message mentioning the status.
pub fn extract_error_message(body: &Value, status: u16) -> String {
  if let Some(text) = body.as_str().map(str::trim).filter(|s| !s.is_empty()) {
    return text.to_string();
  }

  if let Some(text) = non_empty_str(body.get("error")) {
    return text;
  }

  if let Some(text) = non_empty_str(body.get("message")) {
    return text;
  }

  match body.get("errors") {
    Some(Value::Array(errors)) => {
      let joined = join_messages(errors.iter());
      if !joined.is_empty() {
        return joined;
      }
    }
    Some(Value::Object(fields)) => {
      let joined = join_messages(fields.values());
      if !joined.is_empty() {
        return joined;
      }
    }
    _ => {}
  }

  format!("Request failed with status {}", status)
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
  value
    .and_then(Value::as_str)
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .map(String::from)
}

/// Join entries that are either strings or `{ "message": "..." }` objects.
fn join_messages<'a>(values: impl Iterator<Item = &'a Value>) -> String {
  values
    .filter_map(|v| match v {
      Value::String(s) => Some(s.clone()),
      Value::Object(_) => v.get("message").and_then(Value::as_str).map(String::from),
      _ => None,
    })
    .filter(|s| !s.is_empty())
    .collect::<Vec<_>>()
    .join(", ")
}

/// Map an I/O error kind from the socket layer onto our classification.
pub fn classify_io_kind(kind: io::ErrorKind) -> NetworkErrorKind {
  match kind {
    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => NetworkErrorKind::Timeout,
    io::ErrorKind::ConnectionRefused => NetworkErrorKind::Refused,
    io::ErrorKind::ConnectionReset
    | io::ErrorKind::ConnectionAborted
    | io::ErrorKind::BrokenPipe
    | io::ErrorKind::UnexpectedEof => NetworkErrorKind::Reset,
    io::ErrorKind::NotFound | io::ErrorKind::AddrNotAvailable | io::ErrorKind::NotConnected => {
      NetworkErrorKind::Unreachable
    }
    _ => NetworkErrorKind::Other,
  }
}

/// Best-effort classification from an error's display text, for errors that
/// don't expose an I/O kind (DNS resolver failures, mostly).
pub fn classify_description(description: &str) -> Option<NetworkErrorKind> {
  let lower = description.to_lowercase();
  if lower.contains("timed out") || lower.contains("timeout") {
    Some(NetworkErrorKind::Timeout)
  } else if lower.contains("dns") || lower.contains("resolve") || lower.contains("lookup") {
    Some(NetworkErrorKind::Unreachable)
  } else if lower.contains("refused") {
    Some(NetworkErrorKind::Refused)
  } else if lower.contains("reset") || lower.contains("aborted") {
    Some(NetworkErrorKind::Reset)
  } else {
    None
  }
}
