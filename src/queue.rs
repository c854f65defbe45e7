//! Durable write-behind queue.
//!
//! Items are appended in memory and the whole list is persisted before
//! `enqueue` returns, so a crash right after the call loses nothing. A drain
//! delivers items in FIFO order and removes each one only after delivery
//! succeeded. Delivery is at-least-once: a crash between remote success and
//! the re-persist delivers the item again, so delivery targets must be
//! idempotent on [`QueueItem::item_id`].

use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::store::KeyValueStore;

/// Store key the feedback queue is persisted under.
pub const FEEDBACK_QUEUE_KEY: &str = "pending_feedback_queue";

/// Trait for items that can wait in the queue.
///
/// Equality tells a delivered item apart from a newer version queued under the
/// same id while the delivery was in flight.
pub trait QueueItem: Clone + PartialEq + Send + Sync + Serialize + DeserializeOwned {
  /// Stable identifier, used for idempotent re-delivery and de-duplication.
  fn item_id(&self) -> &str;
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub delivered: usize,
  pub remaining: usize,
  /// Id of the item that stopped the drain, if any
  pub failed: Option<String>,
}

pub struct WriteBehindQueue<T: QueueItem, S: KeyValueStore> {
  store: Arc<S>,
  key: String,
  items: Mutex<Vec<T>>,
  draining: Mutex<()>,
  /// Set while the persisted list may hold items memory has never seen
  unrestored: AtomicBool,
}

impl<T: QueueItem, S: KeyValueStore> WriteBehindQueue<T, S> {
  pub fn new(store: Arc<S>) -> Self {
    Self {
      store,
      key: FEEDBACK_QUEUE_KEY.to_string(),
      items: Mutex::new(Vec::new()),
      draining: Mutex::new(()),
      unrestored: AtomicBool::new(false),
    }
  }

  /// Persist under a different store key.
  pub fn with_key(mut self, key: &str) -> Self {
    self.key = key.to_string();
    self
  }

  async fn write(&self, items: &[T]) -> Result<()> {
    let json =
      serde_json::to_string(items).map_err(|e| eyre!("Failed to serialize queue: {}", e))?;
    self.store.set(&self.key, &json).await
  }

  /// Fold a persisted list that was never read into `items`.
  ///
  /// Called before any write. Fails while the list still cannot be read, so a
  /// write never replaces items it has not seen.
  async fn reconcile(&self, items: &mut Vec<T>) -> Result<()> {
    if !self.unrestored.load(Ordering::SeqCst) {
      return Ok(());
    }

    let persisted = self
      .read_persisted()
      .await
      .map_err(|e| eyre!("Failed to read persisted queue before writing: {}", e))?;
    *items = merge(persisted, std::mem::take(items));
    self.unrestored.store(false, Ordering::SeqCst);
    info!(len = items.len(), "merged previously unread queue");
    Ok(())
  }

  /// Persisted list; missing or unparseable data reads as empty.
  async fn read_persisted(&self) -> Result<Vec<T>> {
    let Some(json) = self.store.get(&self.key).await? else {
      return Ok(Vec::new());
    };

    match serde_json::from_str::<Vec<T>>(&json) {
      Ok(items) => Ok(items),
      Err(e) => {
        warn!(error = %e, "discarding unreadable persisted queue");
        Ok(Vec::new())
      }
    }
  }

  /// Append `item`, or replace the queued item with the same id in place.
  ///
  /// Returns only after the full list is persisted. If persisting fails the
  /// in-memory change is undone and the error returned.
  pub async fn enqueue(&self, item: T) -> Result<()> {
    let mut items = self.items.lock().await;
    self.reconcile(&mut items).await?;
    let id = item.item_id().to_string();

    let replaced = match items.iter().position(|i| i.item_id() == id) {
      Some(pos) => Some((pos, std::mem::replace(&mut items[pos], item))),
      None => {
        items.push(item);
        None
      }
    };

    if let Err(e) = self.write(&items).await {
      match replaced {
        Some((pos, previous)) => items[pos] = previous,
        None => {
          items.pop();
        }
      }
      warn!(id = %id, error = %e, "failed to persist queue, item not queued");
      return Err(e);
    }

    debug!(id = %id, len = items.len(), "queued");
    Ok(())
  }

  /// Load the persisted list into memory.
  ///
  /// Missing or unparseable data yields an empty list. Items already in
  /// memory are kept: a persisted item with the same id is replaced by the
  /// in-memory one, and items unknown to the store are appended.
  ///
  /// A store read failure is returned and memory is left as it was. Until a
  /// later read succeeds, writes first merge the persisted list.
  pub async fn try_restore(&self) -> Result<usize> {
    let mut items = self.items.lock().await;

    let persisted = match self.read_persisted().await {
      Ok(persisted) => persisted,
      Err(e) => {
        self.unrestored.store(true, Ordering::SeqCst);
        return Err(e);
      }
    };

    *items = merge(persisted, std::mem::take(&mut *items));
    self.unrestored.store(false, Ordering::SeqCst);
    info!(len = items.len(), "restored queue");
    Ok(items.len())
  }

  /// [`try_restore`](Self::try_restore) that never fails.
  pub async fn restore(&self) -> usize {
    match self.try_restore().await {
      Ok(len) => len,
      Err(e) => {
        let len = self.len().await;
        warn!(error = %e, len, "failed to read persisted queue, keeping in-memory items");
        len
      }
    }
  }

  /// Write the current in-memory list to the store.
  pub async fn persist(&self) -> Result<()> {
    let mut items = self.items.lock().await;
    self.reconcile(&mut items).await?;
    self.write(&items).await
  }

  /// Drop the in-memory list without touching the store.
  pub async fn clear_in_memory(&self) {
    self.items.lock().await.clear();
  }

  pub async fn snapshot(&self) -> Vec<T> {
    self.items.lock().await.clone()
  }

  pub async fn len(&self) -> usize {
    self.items.lock().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.items.lock().await.is_empty()
  }

  /// Deliver queued items in FIFO order.
  ///
  /// Each delivered item is removed and the shortened list persisted. An item
  /// replaced by a newer version while its delivery was in flight stays queued
  /// and goes out again. The first failed delivery stops the pass so that
  /// order is kept. The queue lock is not held while `deliver` runs; one drain
  /// runs at a time.
  pub async fn drain<F, Fut>(&self, mut deliver: F) -> DrainReport
  where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<()>>,
  {
    let _draining = self.draining.lock().await;
    let mut report = DrainReport::default();

    loop {
      let next = self.items.lock().await.first().cloned();
      let Some(item) = next else {
        break;
      };
      let id = item.item_id().to_string();

      if let Err(e) = deliver(item.clone()).await {
        warn!(id = %id, error = %e, "delivery failed, keeping item");
        report.failed = Some(id);
        break;
      }

      let mut items = self.items.lock().await;
      if let Err(e) = self.reconcile(&mut items).await {
        warn!(id = %id, error = %e, "delivered but failed to persist queue");
        report.failed = Some(id);
        break;
      }

      let Some(pos) = items.iter().position(|i| i.item_id() == id) else {
        report.delivered += 1;
        continue;
      };
      if items[pos] != item {
        debug!(id = %id, "item replaced during delivery, keeping newer version");
        report.delivered += 1;
        continue;
      }

      let removed = items.remove(pos);
      if let Err(e) = self.write(&items).await {
        // Keep memory in line with the store; the item goes out again next pass
        items.insert(pos, removed);
        warn!(id = %id, error = %e, "delivered but failed to persist queue");
        report.failed = Some(id);
        break;
      }
      report.delivered += 1;
    }

    report.remaining = self.items.lock().await.len();
    if report.delivered > 0 || report.failed.is_some() {
      info!(
        delivered = report.delivered,
        remaining = report.remaining,
        "drained queue"
      );
    }
    report
  }
}

/// `persisted` order first, with in-memory versions winning on equal ids,
/// then in-memory items the store did not have.
fn merge<T: QueueItem>(persisted: Vec<T>, current: Vec<T>) -> Vec<T> {
  let mut merged: Vec<T> = persisted
    .into_iter()
    .map(|p| {
      current
        .iter()
        .find(|c| c.item_id() == p.item_id())
        .cloned()
        .unwrap_or(p)
    })
    .collect();

  for item in current {
    if !merged.iter().any(|m| m.item_id() == item.item_id()) {
      merged.push(item);
    }
  }
  merged
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::MemoryStore;
  use async_trait::async_trait;
  use serde::Deserialize;

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Note {
    id: String,
    text: String,
  }

  impl QueueItem for Note {
    fn item_id(&self) -> &str {
      &self.id
    }
  }

  fn note(id: &str) -> Note {
    Note {
      id: id.to_string(),
      text: format!("text {}", id),
    }
  }

  fn ids(items: &[Note]) -> Vec<&str> {
    items.iter().map(|n| n.id.as_str()).collect()
  }

  /// Memory store whose reads and writes can be switched off.
  #[derive(Default)]
  struct SwitchableStore {
    inner: MemoryStore,
    reads_fail: AtomicBool,
    writes_fail: AtomicBool,
  }

  #[async_trait]
  impl KeyValueStore for SwitchableStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
      if self.reads_fail.load(Ordering::SeqCst) {
        return Err(eyre!("disk busy"));
      }
      self.inner.get(key).await
    }
    async fn set(&self, key: &str, value: &str) -> Result<()> {
      if self.writes_fail.load(Ordering::SeqCst) {
        return Err(eyre!("disk full"));
      }
      self.inner.set(key, value).await
    }
    async fn remove(&self, key: &str) -> Result<()> {
      self.inner.remove(key).await
    }
    async fn list_keys(&self) -> Result<Vec<String>> {
      self.inner.list_keys().await
    }
  }

  #[tokio::test]
  async fn test_enqueue_survives_restart() {
    let store = Arc::new(MemoryStore::new());
    let queue: WriteBehindQueue<Note, _> = WriteBehindQueue::new(Arc::clone(&store));
    for id in ["f1", "f2", "f3"] {
      queue.enqueue(note(id)).await.unwrap();
    }

    queue.persist().await.unwrap();
    queue.clear_in_memory().await;
    assert!(queue.is_empty().await);

    assert_eq!(queue.restore().await, 3);
    assert_eq!(ids(&queue.snapshot().await), vec!["f1", "f2", "f3"]);
  }

  #[tokio::test]
  async fn test_enqueue_is_durable_before_return() {
    let store = Arc::new(MemoryStore::new());
    let queue: WriteBehindQueue<Note, _> = WriteBehindQueue::new(Arc::clone(&store));
    queue.enqueue(note("f1")).await.unwrap();

    // A fresh queue over the same store sees the item without any explicit persist
    let reopened: WriteBehindQueue<Note, _> = WriteBehindQueue::new(store);
    reopened.restore().await;
    assert_eq!(ids(&reopened.snapshot().await), vec!["f1"]);
  }

  #[tokio::test]
  async fn test_re_enqueue_replaces_in_place() {
    let queue: WriteBehindQueue<Note, _> = WriteBehindQueue::new(Arc::new(MemoryStore::new()));
    queue.enqueue(note("a")).await.unwrap();
    queue.enqueue(note("b")).await.unwrap();
    queue
      .enqueue(Note {
        id: "a".to_string(),
        text: "edited".to_string(),
      })
      .await
      .unwrap();

    let items = queue.snapshot().await;
    assert_eq!(ids(&items), vec!["a", "b"]);
    assert_eq!(items[0].text, "edited");
  }

  #[tokio::test]
  async fn test_restore_garbage_starts_empty() {
    let store = Arc::new(MemoryStore::new());
    store.set(FEEDBACK_QUEUE_KEY, "[{\"broken\"").await.unwrap();
    let queue: WriteBehindQueue<Note, _> = WriteBehindQueue::new(store);

    assert_eq!(queue.restore().await, 0);
    assert!(queue.is_empty().await);
  }

  #[tokio::test]
  async fn test_failed_persist_rolls_back() {
    let store = Arc::new(SwitchableStore::default());
    let queue: WriteBehindQueue<Note, _> = WriteBehindQueue::new(Arc::clone(&store));
    queue.enqueue(note("f1")).await.unwrap();

    store.writes_fail.store(true, Ordering::SeqCst);
    assert!(queue.enqueue(note("f2")).await.is_err());
    assert_eq!(ids(&queue.snapshot().await), vec!["f1"]);
  }

  #[tokio::test]
  async fn test_drain_delivers_in_order() {
    let store = Arc::new(MemoryStore::new());
    let queue: WriteBehindQueue<Note, _> = WriteBehindQueue::new(Arc::clone(&store));
    for id in ["f1", "f2", "f3"] {
      queue.enqueue(note(id)).await.unwrap();
    }

    let delivered = std::sync::Mutex::new(Vec::new());
    let report = queue
      .drain(|n| {
        delivered.lock().unwrap().push(n.id);
        async { Ok(()) }
      })
      .await;

    assert_eq!(report.delivered, 3);
    assert_eq!(report.remaining, 0);
    assert_eq!(*delivered.lock().unwrap(), vec!["f1", "f2", "f3"]);
    assert_eq!(
      store.get(FEEDBACK_QUEUE_KEY).await.unwrap().as_deref(),
      Some("[]")
    );
  }

  #[tokio::test]
  async fn test_drain_stops_at_first_failure() {
    let queue: WriteBehindQueue<Note, _> = WriteBehindQueue::new(Arc::new(MemoryStore::new()));
    for id in ["f1", "f2", "f3"] {
      queue.enqueue(note(id)).await.unwrap();
    }

    let report = queue
      .drain(|n| async move {
        if n.id == "f2" {
          Err(eyre!("timeout"))
        } else {
          Ok(())
        }
      })
      .await;

    assert_eq!(report.delivered, 1);
    assert_eq!(report.remaining, 2);
    assert_eq!(report.failed.as_deref(), Some("f2"));
    assert_eq!(ids(&queue.snapshot().await), vec!["f2", "f3"]);
  }

  #[tokio::test]
  async fn test_drain_keeps_item_when_persist_fails() {
    let store = Arc::new(SwitchableStore::default());
    let queue: WriteBehindQueue<Note, _> = WriteBehindQueue::new(Arc::clone(&store));
    queue.enqueue(note("f1")).await.unwrap();

    store.writes_fail.store(true, Ordering::SeqCst);
    let report = queue.drain(|_| async { Ok(()) }).await;

    assert_eq!(report.delivered, 0);
    assert_eq!(report.remaining, 1);
    assert_eq!(ids(&queue.snapshot().await), vec!["f1"]);
  }

  #[tokio::test]
  async fn test_edit_during_delivery_is_not_lost() {
    let queue: WriteBehindQueue<Note, _> = WriteBehindQueue::new(Arc::new(MemoryStore::new()));
    queue
      .enqueue(Note {
        id: "a".to_string(),
        text: "v1".to_string(),
      })
      .await
      .unwrap();

    let delivered = std::sync::Mutex::new(Vec::new());
    let report = queue
      .drain(|n| {
        delivered.lock().unwrap().push(n.text.clone());
        let queue = &queue;
        async move {
          if n.text == "v1" {
            queue
              .enqueue(Note {
                id: "a".to_string(),
                text: "v2".to_string(),
              })
              .await?;
          }
          Ok(())
        }
      })
      .await;

    assert_eq!(*delivered.lock().unwrap(), vec!["v1", "v2"]);
    assert_eq!(report.delivered, 2);
    assert_eq!(report.remaining, 0);
  }

  #[tokio::test]
  async fn test_edit_during_failed_delivery_stays_queued() {
    let queue: WriteBehindQueue<Note, _> = WriteBehindQueue::new(Arc::new(MemoryStore::new()));
    queue.enqueue(note("a")).await.unwrap();

    let report = queue
      .drain(|n| {
        let queue = &queue;
        async move {
          if n.text != "v2" {
            queue
              .enqueue(Note {
                id: "a".to_string(),
                text: "v2".to_string(),
              })
              .await?;
            Ok(())
          } else {
            Err(eyre!("timeout"))
          }
        }
      })
      .await;

    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed.as_deref(), Some("a"));
    let pending = queue.snapshot().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].text, "v2");
  }

  #[tokio::test]
  async fn test_failed_restore_keeps_items_in_memory() {
    let store = Arc::new(SwitchableStore::default());
    let queue: WriteBehindQueue<Note, _> = WriteBehindQueue::new(Arc::clone(&store));
    queue.enqueue(note("a")).await.unwrap();
    queue.enqueue(note("b")).await.unwrap();

    store.reads_fail.store(true, Ordering::SeqCst);
    assert!(queue.try_restore().await.is_err());
    assert_eq!(queue.restore().await, 2);

    store.reads_fail.store(false, Ordering::SeqCst);
    queue.enqueue(note("c")).await.unwrap();

    let reopened: WriteBehindQueue<Note, _> = WriteBehindQueue::new(Arc::clone(&store));
    assert_eq!(reopened.restore().await, 3);
    assert_eq!(ids(&reopened.snapshot().await), vec!["a", "b", "c"]);
  }

  #[tokio::test]
  async fn test_write_after_unread_store_merges_persisted_items() {
    let store = Arc::new(SwitchableStore::default());
    let earlier: WriteBehindQueue<Note, _> = WriteBehindQueue::new(Arc::clone(&store));
    earlier.enqueue(note("a")).await.unwrap();
    earlier.enqueue(note("b")).await.unwrap();

    // A fresh process whose startup read fails
    let queue: WriteBehindQueue<Note, _> = WriteBehindQueue::new(Arc::clone(&store));
    store.reads_fail.store(true, Ordering::SeqCst);
    assert_eq!(queue.restore().await, 0);

    // The store is still unreadable, so nothing may overwrite it
    assert!(queue.enqueue(note("c")).await.is_err());
    assert!(queue.is_empty().await);

    store.reads_fail.store(false, Ordering::SeqCst);
    queue.enqueue(note("c")).await.unwrap();
    assert_eq!(ids(&queue.snapshot().await), vec!["a", "b", "c"]);

    let persisted: Vec<Note> =
      serde_json::from_str(&store.get(FEEDBACK_QUEUE_KEY).await.unwrap().unwrap()).unwrap();
    assert_eq!(ids(&persisted), vec!["a", "b", "c"]);
  }
}
