//! Bounded retries with exponential backoff and optional memoization.

use chrono::Duration as TtlDuration;
use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::cache::TtlCache;
use crate::metrics::{MetricCategory, MetricsAggregator};
use crate::store::KeyValueStore;

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts, including the first
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_millis(1000),
      max_delay: Duration::from_secs(30),
    }
  }
}

impl RetryPolicy {
  /// Delay after failed attempt `attempt` (0-based): `2^attempt * base`, capped.
  pub fn backoff(&self, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }
}

/// Runs operations with retries, optionally serving and storing results in the cache.
///
/// Flow per call:
/// 1. With a cache key, a valid cached value is returned without running the operation
/// 2. Otherwise the operation runs; a success is cached (when keyed) and returned
/// 3. A failure sleeps for the backoff and runs again, until attempts run out
/// 4. The last error is returned unchanged
///
/// Every error is retried the same way; there is no retryable/terminal split.
pub struct RetryExecutor<S: KeyValueStore> {
  cache: TtlCache<S>,
  metrics: Arc<MetricsAggregator>,
  policy: RetryPolicy,
  default_ttl: TtlDuration,
}

impl<S: KeyValueStore> RetryExecutor<S> {
  pub fn new(cache: TtlCache<S>, metrics: Arc<MetricsAggregator>) -> Self {
    Self {
      cache,
      metrics,
      policy: RetryPolicy::default(),
      default_ttl: TtlDuration::minutes(5),
    }
  }

  pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
    self.policy = policy;
    self
  }

  /// TTL used for keyed results when the caller gives none.
  pub fn with_default_ttl(mut self, ttl: TtlDuration) -> Self {
    self.default_ttl = ttl;
    self
  }

  /// Execute `operation` under the retry policy, timed as a database query.
  ///
  /// `cache_key` is the full store key the result is memoized under.
  pub async fn execute<T, F, Fut>(
    &self,
    operation: F,
    cache_key: Option<&str>,
    ttl: Option<TtlDuration>,
  ) -> Result<T>
  where
    T: Serialize + DeserializeOwned + Sync,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    self
      .execute_as(Some(MetricCategory::DatabaseQuery), operation, cache_key, ttl)
      .await
  }

  /// [`execute`](Self::execute) with the successful attempt's latency recorded
  /// under `category`, or not at all.
  pub async fn execute_as<T, F, Fut>(
    &self,
    category: Option<MetricCategory>,
    mut operation: F,
    cache_key: Option<&str>,
    ttl: Option<TtlDuration>,
  ) -> Result<T>
  where
    T: Serialize + DeserializeOwned + Sync,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    if let Some(key) = cache_key {
      if let Some(cached) = self.cache.get::<T>(key).await {
        debug!(key, "served from cache");
        return Ok(cached);
      }
    }

    let max_attempts = self.policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
      let started = Instant::now();
      match operation().await {
        Ok(value) => {
          if let Some(category) = category {
            self
              .metrics
              .record_performance_metric(category, started.elapsed().as_secs_f64() * 1000.0);
          }
          self.metrics.record_operation(true);

          if let Some(key) = cache_key {
            self
              .cache
              .set(key, &value, ttl.unwrap_or(self.default_ttl))
              .await;
          }
          return Ok(value);
        }
        Err(e) => {
          attempt += 1;
          if attempt >= max_attempts {
            warn!(attempts = attempt, error = %e, "operation failed, giving up");
            self.metrics.record_operation(false);
            return Err(e);
          }

          let delay = self.policy.backoff(attempt - 1);
          warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %e,
            "operation failed, retrying"
          );
          tokio::time::sleep(delay).await;
        }
      }
    }
  }
}
