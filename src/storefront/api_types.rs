//! Wire shapes that differ from the domain types.
//!
//! The backend sometimes embeds related documents and sometimes sends only
//! their ids; these types absorb that variation during deserialization.

use serde::{Deserialize, Serialize};

/// Reference to a related document: either a bare id or the embedded document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApiRef {
  Id(String),
  Embedded {
    #[serde(alias = "_id")]
    id: String,
    #[serde(default)]
    name: Option<String>,
  },
}

impl ApiRef {
  pub fn id(&self) -> &str {
    match self {
      ApiRef::Id(id) => id,
      ApiRef::Embedded { id, .. } => id,
    }
  }

  pub fn name(&self) -> Option<&str> {
    match self {
      ApiRef::Id(_) => None,
      ApiRef::Embedded { name, .. } => name.as_deref(),
    }
  }
}

/// Image reference: a bare URL or an uploaded-file object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApiImage {
  Url(String),
  Uploaded {
    #[serde(alias = "secure_url")]
    url: String,
  },
}

impl ApiImage {
  pub fn url(&self) -> &str {
    match self {
      ApiImage::Url(url) => url,
      ApiImage::Uploaded { url } => url,
    }
  }
}
