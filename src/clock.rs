//! Time source for expiry and freshness checks.

use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Source of wall-clock time in epoch milliseconds.
pub trait Clock: Send + Sync {
  fn now_ms(&self) -> i64;

  fn now(&self) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(self.now_ms()).unwrap_or_default()
  }
}

/// The real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now_ms(&self) -> i64 {
    Utc::now().timestamp_millis()
  }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
  now_ms: Arc<AtomicI64>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now_ms: Arc::new(AtomicI64::new(start.timestamp_millis())),
    }
  }

  /// Start at the current system time.
  pub fn starting_now() -> Self {
    Self::new(Utc::now())
  }

  pub fn advance(&self, by: Duration) {
    self.now_ms.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
  }
}

impl Clock for ManualClock {
  fn now_ms(&self) -> i64 {
    self.now_ms.load(Ordering::SeqCst)
  }
}
