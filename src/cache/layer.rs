//! TTL cache over a key-value store.

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::traits::{CacheEntry, Lookup, Miss};
use crate::clock::Clock;
use crate::metrics::MetricsAggregator;
use crate::store::KeyValueStore;

/// Advisory cache with per-entry expiration.
///
/// Entries are checked lazily: an expired entry is deleted on the read that
/// finds it. Every read is recorded as a hit or a miss in the shared metrics.
/// Writes to the same key are not serialized; the last writer wins.
pub struct TtlCache<S: KeyValueStore> {
  store: Arc<S>,
  clock: Arc<dyn Clock>,
  metrics: Arc<MetricsAggregator>,
}

impl<S: KeyValueStore> TtlCache<S> {
  pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, metrics: Arc<MetricsAggregator>) -> Self {
    Self {
      store,
      clock,
      metrics,
    }
  }

  /// Store `value` under `key` for `ttl`, replacing any previous entry.
  pub async fn try_set<T>(&self, key: &str, value: &T, ttl: Duration) -> Result<()>
  where
    T: Serialize + ?Sized + Sync,
  {
    let ttl_ms = ttl.num_milliseconds();
    if ttl_ms <= 0 {
      return Err(eyre!("Refusing to cache {} with non-positive TTL", key));
    }

    let entry = CacheEntry::new(value, self.clock.now_ms(), ttl_ms)
      .ok_or_else(|| eyre!("Refusing to cache {}: TTL overflows the expiry time", key))?;
    let json = serde_json::to_string(&entry)
      .map_err(|e| eyre!("Failed to serialize cache entry {}: {}", key, e))?;

    self.store.set(key, &json).await?;
    debug!(key, ttl_ms, "cached");
    Ok(())
  }

  /// Best-effort [`try_set`](Self::try_set): failures are logged and dropped.
  pub async fn set<T>(&self, key: &str, value: &T, ttl: Duration)
  where
    T: Serialize + ?Sized + Sync,
  {
    if let Err(e) = self.try_set(key, value, ttl).await {
      warn!(key, error = %e, "cache write failed");
    }
  }

  /// Look up `key`, reporting why a miss happened.
  ///
  /// Only a store read failure is an error; corrupt and expired entries are
  /// misses. Expired entries are removed from the store.
  pub async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Result<Lookup<T>> {
    let Some(raw) = self.store.get(key).await? else {
      self.metrics.record_cache_miss();
      return Ok(Lookup::Miss(Miss::Absent));
    };

    let entry: CacheEntry<T> = match serde_json::from_str(&raw) {
      Ok(entry) => entry,
      Err(e) => {
        debug!(key, error = %e, "unreadable cache entry");
        self.metrics.record_cache_miss();
        return Ok(Lookup::Miss(Miss::Corrupt));
      }
    };

    if entry.is_expired(self.clock.now_ms()) {
      if let Err(e) = self.store.remove(key).await {
        warn!(key, error = %e, "failed to evict expired entry");
      }
      self.metrics.record_cache_miss();
      return Ok(Lookup::Miss(Miss::Expired));
    }

    self.metrics.record_cache_hit();
    Ok(Lookup::Hit(entry.data))
  }

  pub async fn try_get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    Ok(self.lookup(key).await?.into_option())
  }

  /// Read `key`; any failure is a miss.
  pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    match self.lookup(key).await {
      Ok(lookup) => lookup.into_option(),
      Err(e) => {
        warn!(key, error = %e, "cache read failed");
        self.metrics.record_cache_miss();
        None
      }
    }
  }
}

impl<S: KeyValueStore> Clone for TtlCache<S> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      clock: Arc::clone(&self.clock),
      metrics: Arc::clone(&self.metrics),
    }
  }
}
