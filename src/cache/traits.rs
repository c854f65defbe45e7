//! Core types for the TTL cache.

use serde::{Deserialize, Serialize};

/// Envelope every cached value is stored in.
///
/// Timestamps are epoch milliseconds. `expires_at > timestamp` always holds for
/// entries written by [`super::TtlCache`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
  pub data: T,
  pub timestamp: i64,
  pub expires_at: i64,
}

impl<T> CacheEntry<T> {
  /// `None` when the expiry does not fit in an epoch-millisecond timestamp.
  pub fn new(data: T, now_ms: i64, ttl_ms: i64) -> Option<Self> {
    Some(Self {
      data,
      timestamp: now_ms,
      expires_at: now_ms.checked_add(ttl_ms)?,
    })
  }

  pub fn is_expired(&self, now_ms: i64) -> bool {
    now_ms >= self.expires_at
  }
}

/// Envelope header without the payload, for scanning entries of unknown type.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryHeader {
  pub timestamp: i64,
  pub expires_at: i64,
}

impl EntryHeader {
  pub fn is_expired(&self, now_ms: i64) -> bool {
    now_ms >= self.expires_at
  }
}

/// Why a cache read came back empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Miss {
  Absent,
  Expired,
  Corrupt,
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
  Hit(T),
  Miss(Miss),
}

impl<T> Lookup<T> {
  pub fn into_option(self) -> Option<T> {
    match self {
      Lookup::Hit(data) => Some(data),
      Lookup::Miss(_) => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_entry_serializes_with_camel_case_fields() {
    let entry = CacheEntry::new("uri", 1_000, 500).unwrap();
    let json = serde_json::to_value(&entry).unwrap();
    assert_eq!(
      json,
      serde_json::json!({"data": "uri", "timestamp": 1000, "expiresAt": 1500})
    );
  }

  #[test]
  fn test_expired_at_boundary() {
    let entry = CacheEntry::new((), 0, 10).unwrap();
    assert!(!entry.is_expired(9));
    assert!(entry.is_expired(10));
  }

  #[test]
  fn test_header_reads_any_payload() {
    let header: EntryHeader =
      serde_json::from_str(r#"{"data":[1,2,3],"timestamp":5,"expiresAt":9}"#).unwrap();
    assert_eq!(header.timestamp, 5);
    assert!(header.is_expired(9));
  }

  #[test]
  fn test_expiry_overflow_is_rejected() {
    assert!(CacheEntry::new((), i64::MAX - 10, 11).is_none());
    assert!(CacheEntry::new((), i64::MAX - 10, 10).is_some());
  }
}
