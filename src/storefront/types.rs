use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::api_types::{ApiImage, ApiRef};

/// Product as listed in the catalogue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
  #[serde(alias = "_id")]
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub price: f64,
  #[serde(default)]
  pub stock: Option<i64>,
  #[serde(default)]
  pub images: Vec<ApiImage>,
  #[serde(default)]
  pub brand: Option<ApiRef>,
  #[serde(default)]
  pub category: Option<ApiRef>,
  #[serde(default)]
  pub created_at: Option<DateTime<Utc>>,
}

impl Product {
  /// Image shown in list views.
  pub fn thumbnail(&self) -> Option<&str> {
    self.images.first().map(ApiImage::url)
  }

  pub fn image_urls(&self) -> impl Iterator<Item = &str> {
    self.images.iter().map(ApiImage::url)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Brand {
  #[serde(alias = "_id")]
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub logo: Option<ApiImage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
  #[serde(alias = "_id")]
  pub id: String,
  pub name: String,
  #[serde(default, alias = "image")]
  pub icon: Option<ApiImage>,
}

/// Promotional banner for the home screen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Banner {
  #[serde(alias = "_id")]
  pub id: String,
  #[serde(default)]
  pub title: Option<String>,
  pub image: ApiImage,
  #[serde(default)]
  pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
  #[serde(alias = "_id")]
  pub id: String,
  #[serde(default)]
  pub status: String,
  #[serde(default, alias = "totalAmount")]
  pub total: f64,
  #[serde(default)]
  pub created_at: Option<DateTime<Utc>>,
}

/// Catalogue filters. Part of every product-page cache key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductFilters {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub brand: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub search: Option<String>,
  /// Newest first keeps already-loaded pages stable as products are added
  pub sort: String,
  pub limit: u32,
}

impl Default for ProductFilters {
  fn default() -> Self {
    Self {
      category: None,
      brand: None,
      search: None,
      sort: "-createdAt".to_string(),
      limit: 10,
    }
  }
}
