//! Domain payloads carried through the cache and the feedback queue.
//!
//! The layer stores these opaquely; it never interprets outfit scores,
//! categories or ratings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::QueueItem;

/// A day's worth of generated outfit suggestions for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationBundle {
  pub user_id: String,
  /// Date the bundle was generated for (YYYY-MM-DD)
  pub date: String,
  pub outfits: Vec<Outfit>,
  pub generated_at: DateTime<Utc>,
}

/// A single suggested outfit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outfit {
  pub id: String,
  pub item_ids: Vec<String>,
  pub occasion: Option<String>,
  pub score: Option<f64>,
  pub reasoning: Option<String>,
}

/// Wardrobe item snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WardrobeItem {
  pub id: String,
  pub name: String,
  pub category: String,
  pub color: Option<String>,
  pub image_uri: Option<String>,
}

/// User feedback on a recommended outfit, delivered write-behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutfitFeedback {
  /// Client-generated id; the remote upserts on it, so redelivery is harmless
  pub id: String,
  pub user_id: String,
  pub recommendation_id: Option<String>,
  pub outfit_id: String,
  pub rating: Option<u8>,
  pub liked: Option<bool>,
  pub comment: Option<String>,
  pub created_at: DateTime<Utc>,
}

impl QueueItem for OutfitFeedback {
  fn item_id(&self) -> &str {
    &self.id
  }
}
