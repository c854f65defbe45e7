//! The storage trait shared by all backends.

use async_trait::async_trait;
use color_eyre::Result;

/// Async string key-value store.
///
/// Values are opaque strings (serialized JSON in practice). Errors are returned
/// to the caller; the layers above decide whether a failure degrades to a miss.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
  /// Read a value. `Ok(None)` when the key is absent.
  async fn get(&self, key: &str) -> Result<Option<String>>;

  /// Write a value, replacing any previous one.
  async fn set(&self, key: &str, value: &str) -> Result<()>;

  /// Delete a value. Removing an absent key is not an error.
  async fn remove(&self, key: &str) -> Result<()>;

  /// List every key currently stored.
  async fn list_keys(&self) -> Result<Vec<String>>;
}
