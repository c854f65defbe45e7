//! Deterministic, namespaced cache keys.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

pub const RECOMMENDATIONS_PREFIX: &str = "recommendations_";
pub const WARDROBE_PREFIX: &str = "wardrobe_";
pub const OPTIMIZED_IMAGE_PREFIX: &str = "optimized_image_";
pub const QUERY_PREFIX: &str = "query_";

/// Every prefix under which [`super::CacheEntry`] envelopes are stored.
pub const CACHE_PREFIXES: &[&str] = &[
  RECOMMENDATIONS_PREFIX,
  WARDROBE_PREFIX,
  OPTIMIZED_IMAGE_PREFIX,
  QUERY_PREFIX,
];

/// Addresses of cached values. Equal keys always render to the same string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheKey {
  /// Recommendation bundle for a user on a given day (YYYY-MM-DD)
  Recommendations { user_id: String, date: String },
  /// Wardrobe snapshot for a user
  Wardrobe { user_id: String },
  /// Optimized form of an image URI
  OptimizedImage { uri: String },
  /// Memoized result of an ad-hoc query
  Query { key: String },
}

impl CacheKey {
  /// Recommendations key; falls back to the UTC date of `now` when no date is given.
  pub fn recommendations(user_id: &str, date: Option<&str>, now: DateTime<Utc>) -> Self {
    Self::Recommendations {
      user_id: user_id.to_string(),
      date: date
        .map(String::from)
        .unwrap_or_else(|| now.format("%Y-%m-%d").to_string()),
    }
  }

  pub fn wardrobe(user_id: &str) -> Self {
    Self::Wardrobe {
      user_id: user_id.to_string(),
    }
  }

  pub fn optimized_image(uri: &str) -> Self {
    Self::OptimizedImage {
      uri: uri.to_string(),
    }
  }

  pub fn query(key: &str) -> Self {
    Self::Query {
      key: key.to_string(),
    }
  }

  /// The string the entry is stored under.
  pub fn storage_key(&self) -> String {
    match self {
      Self::Recommendations { user_id, date } => {
        format!("{}{}_{}", RECOMMENDATIONS_PREFIX, user_id, date)
      }
      Self::Wardrobe { user_id } => format!("{}{}", WARDROBE_PREFIX, user_id),
      Self::OptimizedImage { uri } => format!("{}{}", OPTIMIZED_IMAGE_PREFIX, uri_digest(uri)),
      Self::Query { key } => format!("{}{}", QUERY_PREFIX, key),
    }
  }
}

/// Whether a store key belongs to the cache namespace.
pub fn is_cache_key(key: &str) -> bool {
  CACHE_PREFIXES.iter().any(|p| key.starts_with(p))
}

/// First 32 hex chars of SHA-256, fixed-length and stable for any URI.
fn uri_digest(uri: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(uri.trim().as_bytes());
  let result = hasher.finalize();
  hex::encode(&result[..16])
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_recommendations_key_with_date() {
    let key = CacheKey::recommendations("u1", Some("2024-01-15"), Utc::now());
    assert_eq!(key.storage_key(), "recommendations_u1_2024-01-15");
  }

  #[test]
  fn test_recommendations_key_defaults_to_today() {
    let now = Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 0).unwrap();
    let key = CacheKey::recommendations("u1", None, now);
    assert_eq!(key.storage_key(), "recommendations_u1_2024-03-09");
  }

  #[test]
  fn test_image_key_is_stable_and_fixed_length() {
    let a = CacheKey::optimized_image("https://cdn.example.com/a.jpg").storage_key();
    let b = CacheKey::optimized_image("https://cdn.example.com/a.jpg").storage_key();
    let c = CacheKey::optimized_image("https://cdn.example.com/b.jpg").storage_key();

    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.len(), OPTIMIZED_IMAGE_PREFIX.len() + 32);
  }

  #[test]
  fn test_is_cache_key() {
    assert!(is_cache_key("wardrobe_u1"));
    assert!(is_cache_key("query_outfits"));
    assert!(!is_cache_key("pending_feedback_queue"));
    assert!(!is_cache_key("performance_metrics"));
  }
}
