//! Housekeeping: expired local cache entries and old server-side rows.

use chrono::Duration;
use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{is_cache_key, EntryHeader};
use crate::clock::Clock;
use crate::remote::RemoteDatabase;
use crate::store::KeyValueStore;

/// What a cleanup pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
  /// Cache entries examined
  pub scanned: usize,
  /// Expired entries deleted
  pub removed: usize,
  /// Entries under a cache prefix that could not be parsed, deleted as well
  pub unreadable: usize,
  /// Whether the remote prune succeeded
  pub remote_pruned: bool,
}

/// Server-side rows to prune by age.
#[derive(Debug, Clone)]
pub struct PruneTarget {
  pub table: String,
  pub column: String,
  pub retention: Duration,
}

pub struct Sweeper<S: KeyValueStore> {
  store: Arc<S>,
  clock: Arc<dyn Clock>,
  remote: Arc<dyn RemoteDatabase>,
  target: PruneTarget,
}

impl<S: KeyValueStore> Sweeper<S> {
  pub fn new(
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    remote: Arc<dyn RemoteDatabase>,
    target: PruneTarget,
  ) -> Self {
    Self {
      store,
      clock,
      remote,
      target,
    }
  }

  /// Delete expired and unreadable cache entries, then prune old remote rows.
  ///
  /// Never fails: store and remote errors are logged and the pass continues.
  /// Unexpired entries are not rewritten.
  pub async fn perform_cleanup(&self) -> CleanupReport {
    let mut report = CleanupReport::default();

    if let Err(e) = self.sweep_local(&mut report).await {
      warn!(error = %e, "local cleanup failed");
    }
    report.remote_pruned = self.prune_remote().await;

    info!(
      scanned = report.scanned,
      removed = report.removed,
      unreadable = report.unreadable,
      remote_pruned = report.remote_pruned,
      "cleanup finished"
    );
    report
  }

  async fn sweep_local(&self, report: &mut CleanupReport) -> Result<()> {
    let keys = self.store.list_keys().await?;
    let now = self.clock.now_ms();

    for key in keys.iter().filter(|k| is_cache_key(k)) {
      report.scanned += 1;

      let raw = match self.store.get(key).await {
        Ok(Some(raw)) => raw,
        // Gone since the listing
        Ok(None) => continue,
        Err(e) => {
          warn!(key = %key, error = %e, "failed to read entry during cleanup");
          continue;
        }
      };

      let header: EntryHeader = match serde_json::from_str(&raw) {
        Ok(header) => header,
        Err(e) => {
          debug!(key = %key, error = %e, "deleting unreadable cache entry");
          report.unreadable += 1;
          if let Err(e) = self.store.remove(key).await {
            warn!(key = %key, error = %e, "failed to delete unreadable entry");
          }
          continue;
        }
      };

      if !header.is_expired(now) {
        continue;
      }

      match self.store.remove(key).await {
        Ok(()) => report.removed += 1,
        Err(e) => warn!(key = %key, error = %e, "failed to delete expired entry"),
      }
    }

    Ok(())
  }

  async fn prune_remote(&self) -> bool {
    let Some(cutoff) = self.clock.now().checked_sub_signed(self.target.retention) else {
      warn!(table = %self.target.table, "retention out of range, skipping remote prune");
      return false;
    };

    match self
      .remote
      .delete_older_than(&self.target.table, &self.target.column, cutoff)
      .await
    {
      Ok(()) => {
        debug!(table = %self.target.table, %cutoff, "pruned remote rows");
        true
      }
      Err(e) => {
        warn!(table = %self.target.table, error = %e, "remote prune failed");
        false
      }
    }
  }
}
