//! Canonical query keys.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Ordered tuple identifying a fetchable resource, e.g. `["products", {filters}, 2]`.
///
/// Two keys are equal iff their serialized JSON forms match. Object parts are
/// serialized with sorted field names, so `{"a":1,"b":2}` and `{"b":2,"a":1}`
/// name the same resource. Keys sharing a leading prefix form a family that
/// can be invalidated together.
#[derive(Clone)]
pub struct QueryKey {
  parts: Vec<Value>,
  canonical: String,
}

impl QueryKey {
  pub fn new(root: &str) -> Self {
    Self::from_parts(vec![Value::String(root.to_string())])
  }

  pub fn from_parts(parts: Vec<Value>) -> Self {
    let canonical = Value::Array(parts.clone()).to_string();
    Self { parts, canonical }
  }

  /// Append a part, returning the extended key.
  pub fn push(self, part: impl Into<Value>) -> Self {
    let mut parts = self.parts;
    parts.push(part.into());
    Self::from_parts(parts)
  }

  pub fn parts(&self) -> &[Value] {
    &self.parts
  }

  /// The serialized form that defines this key's identity.
  pub fn canonical(&self) -> &str {
    &self.canonical
  }

  /// Stable fixed-length id, handy for logs and persistence.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.canonical.as_bytes());
    hex::encode(hasher.finalize())
  }

  /// True if `prefix` matches the leading parts of this key.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    prefix.parts.len() <= self.parts.len()
      && prefix
        .parts
        .iter()
        .zip(&self.parts)
        .all(|(a, b)| a.to_string() == b.to_string())
  }
}

impl PartialEq for QueryKey {
  fn eq(&self, other: &Self) -> bool {
    self.canonical == other.canonical
  }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.canonical.hash(state);
  }
}

impl fmt::Debug for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.canonical)
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.canonical)
  }
}
