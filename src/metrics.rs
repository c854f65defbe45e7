//! Rolling performance metrics: latency samples, cache hit rate, error rate.

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::store::KeyValueStore;

/// Store key the metrics snapshot is persisted under.
pub const METRICS_KEY: &str = "performance_metrics";

/// Latency categories tracked by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricCategory {
  RecommendationGeneration,
  ImageProcessing,
  DatabaseQuery,
}

/// The full metrics object, as persisted.
///
/// Durations are milliseconds. Raw counters are kept next to the derived
/// rates so the rates keep accumulating after a reload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformanceMetrics {
  pub recommendation_generation_time: Vec<f64>,
  pub image_processing_time: Vec<f64>,
  pub database_query_time: Vec<f64>,
  pub cache_hit_rate: f64,
  pub error_rate: f64,
  /// Epoch milliseconds of the last observation
  pub last_updated: i64,
  pub cache_hits: u64,
  pub cache_misses: u64,
  pub operations: u64,
  pub errors: u64,
}

impl PerformanceMetrics {
  fn samples_mut(&mut self, category: MetricCategory) -> &mut Vec<f64> {
    match category {
      MetricCategory::RecommendationGeneration => &mut self.recommendation_generation_time,
      MetricCategory::ImageProcessing => &mut self.image_processing_time,
      MetricCategory::DatabaseQuery => &mut self.database_query_time,
    }
  }

  fn refresh_rates(&mut self) {
    self.cache_hit_rate = ratio(self.cache_hits, self.cache_hits + self.cache_misses);
    self.error_rate = ratio(self.errors, self.operations);
  }
}

/// Averages derived from [`PerformanceMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
  pub avg_recommendation_generation_ms: f64,
  pub avg_image_processing_ms: f64,
  pub avg_database_query_ms: f64,
  pub cache_hit_rate: f64,
  pub error_rate: f64,
  /// Total latency samples currently held across all categories
  pub sample_count: usize,
}

/// What `load` found in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
  /// Fresh data was restored
  Restored,
  /// Data was older than the freshness window and was discarded
  Expired,
  /// Nothing was persisted
  Absent,
  /// Persisted data could not be parsed and was discarded
  Corrupt,
}

/// In-memory metrics shared by every component of the service.
pub struct MetricsAggregator {
  inner: Mutex<PerformanceMetrics>,
  max_samples: usize,
  freshness: Duration,
  clock: Arc<dyn Clock>,
}

impl MetricsAggregator {
  pub fn new(clock: Arc<dyn Clock>) -> Self {
    Self {
      inner: Mutex::new(PerformanceMetrics::default()),
      max_samples: 100,
      freshness: Duration::hours(24),
      clock,
    }
  }

  /// Cap the number of samples kept per category.
  pub fn with_max_samples(mut self, max_samples: usize) -> Self {
    self.max_samples = max_samples.max(1);
    self
  }

  /// Set how old persisted metrics may be and still be restored.
  pub fn with_freshness(mut self, freshness: Duration) -> Self {
    self.freshness = freshness;
    self
  }

  // Metrics are plain data, so a poisoned lock still holds a usable value.
  fn lock(&self) -> MutexGuard<'_, PerformanceMetrics> {
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn record_performance_metric(&self, category: MetricCategory, duration_ms: f64) {
    let now = self.clock.now_ms();
    let mut metrics = self.lock();
    let samples = metrics.samples_mut(category);
    samples.push(duration_ms.max(0.0));
    if samples.len() > self.max_samples {
      let excess = samples.len() - self.max_samples;
      samples.drain(..excess);
    }
    metrics.last_updated = now;
  }

  /// Run `fut` and record its wall time under `category`.
  pub async fn time<T, Fut>(&self, category: MetricCategory, fut: Fut) -> T
  where
    Fut: Future<Output = T>,
  {
    let started = Instant::now();
    let out = fut.await;
    self.record_performance_metric(category, started.elapsed().as_secs_f64() * 1000.0);
    out
  }

  pub fn record_cache_hit(&self) {
    self.update(|m| m.cache_hits += 1);
  }

  pub fn record_cache_miss(&self) {
    self.update(|m| m.cache_misses += 1);
  }

  /// Record the outcome of one remote operation for the error rate.
  pub fn record_operation(&self, success: bool) {
    self.update(|m| {
      m.operations += 1;
      if !success {
        m.errors += 1;
      }
    });
  }

  fn update(&self, f: impl FnOnce(&mut PerformanceMetrics)) {
    let now = self.clock.now_ms();
    let mut metrics = self.lock();
    f(&mut metrics);
    metrics.refresh_rates();
    metrics.last_updated = now;
  }

  pub fn get_performance_metrics(&self) -> PerformanceMetrics {
    self.lock().clone()
  }

  pub fn get_performance_summary(&self) -> PerformanceSummary {
    let metrics = self.lock();
    PerformanceSummary {
      avg_recommendation_generation_ms: mean(&metrics.recommendation_generation_time),
      avg_image_processing_ms: mean(&metrics.image_processing_time),
      avg_database_query_ms: mean(&metrics.database_query_time),
      cache_hit_rate: metrics.cache_hit_rate,
      error_rate: metrics.error_rate,
      sample_count: metrics.recommendation_generation_time.len()
        + metrics.image_processing_time.len()
        + metrics.database_query_time.len(),
    }
  }

  pub fn reset(&self) {
    *self.lock() = PerformanceMetrics::default();
  }

  /// Write the current snapshot to the store.
  pub async fn persist<S: KeyValueStore + ?Sized>(&self, store: &S) -> Result<()> {
    let snapshot = self.get_performance_metrics();
    let json =
      serde_json::to_string(&snapshot).map_err(|e| eyre!("Failed to serialize metrics: {}", e))?;
    store.set(METRICS_KEY, &json).await?;
    debug!(samples = snapshot.database_query_time.len(), "persisted metrics");
    Ok(())
  }

  /// Replace the in-memory metrics with the persisted snapshot if it is fresh.
  ///
  /// Stale or unparseable data resets the metrics to empty. Only a store read
  /// failure is returned as an error.
  pub async fn load<S: KeyValueStore + ?Sized>(&self, store: &S) -> Result<LoadOutcome> {
    let Some(json) = store.get(METRICS_KEY).await? else {
      self.reset();
      return Ok(LoadOutcome::Absent);
    };

    let persisted: PerformanceMetrics = match serde_json::from_str(&json) {
      Ok(m) => m,
      Err(e) => {
        warn!(error = %e, "discarding unreadable metrics snapshot");
        self.reset();
        return Ok(LoadOutcome::Corrupt);
      }
    };

    let age_ms = self.clock.now_ms().saturating_sub(persisted.last_updated);
    if age_ms > self.freshness.num_milliseconds() {
      debug!(age_ms, "discarding expired metrics snapshot");
      self.reset();
      return Ok(LoadOutcome::Expired);
    }

    let mut restored = persisted;
    restored.refresh_rates();
    *self.lock() = restored;
    Ok(LoadOutcome::Restored)
  }
}

fn ratio(part: u64, whole: u64) -> f64 {
  if whole == 0 {
    return 0.0;
  }
  (part as f64 / whole as f64).clamp(0.0, 1.0)
}

fn mean(samples: &[f64]) -> f64 {
  if samples.is_empty() {
    return 0.0;
  }
  samples.iter().sum::<f64>() / samples.len() as f64
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::store::MemoryStore;

  fn aggregator() -> (MetricsAggregator, ManualClock) {
    let clock = ManualClock::starting_now();
    (MetricsAggregator::new(Arc::new(clock.clone())), clock)
  }

  #[test]
  fn test_hit_rate_two_thirds() {
    let (metrics, _) = aggregator();
    metrics.record_cache_hit();
    metrics.record_cache_hit();
    metrics.record_cache_miss();

    let rate = metrics.get_performance_metrics().cache_hit_rate;
    assert!((rate - 2.0 / 3.0).abs() < 1e-9);
  }

  #[test]
  fn test_rates_default_to_zero() {
    let (metrics, _) = aggregator();
    let summary = metrics.get_performance_summary();
    assert_eq!(summary.cache_hit_rate, 0.0);
    assert_eq!(summary.error_rate, 0.0);
    assert_eq!(summary.avg_database_query_ms, 0.0);
  }

  #[test]
  fn test_error_rate() {
    let (metrics, _) = aggregator();
    metrics.record_operation(true);
    metrics.record_operation(true);
    metrics.record_operation(true);
    metrics.record_operation(false);
    assert_eq!(metrics.get_performance_summary().error_rate, 0.25);
  }

  #[test]
  fn test_samples_are_capped() {
    let (metrics, _) = aggregator();
    let metrics = metrics.with_max_samples(3);
    for ms in [1.0, 2.0, 3.0, 4.0, 5.0] {
      metrics.record_performance_metric(MetricCategory::ImageProcessing, ms);
    }

    let snapshot = metrics.get_performance_metrics();
    assert_eq!(snapshot.image_processing_time, vec![3.0, 4.0, 5.0]);
    assert_eq!(metrics.get_performance_summary().avg_image_processing_ms, 4.0);
  }

  #[test]
  fn test_summary_means() {
    let (metrics, _) = aggregator();
    metrics.record_performance_metric(MetricCategory::DatabaseQuery, 10.0);
    metrics.record_performance_metric(MetricCategory::DatabaseQuery, 30.0);
    metrics.record_performance_metric(MetricCategory::RecommendationGeneration, 500.0);

    let summary = metrics.get_performance_summary();
    assert_eq!(summary.avg_database_query_ms, 20.0);
    assert_eq!(summary.avg_recommendation_generation_ms, 500.0);
    assert_eq!(summary.avg_image_processing_ms, 0.0);
    assert_eq!(summary.sample_count, 3);
  }

  #[tokio::test]
  async fn test_time_records_a_sample() {
    let (metrics, _) = aggregator();
    let value = metrics
      .time(MetricCategory::RecommendationGeneration, async { 7 })
      .await;
    assert_eq!(value, 7);
    assert_eq!(
      metrics
        .get_performance_metrics()
        .recommendation_generation_time
        .len(),
      1
    );
  }

  #[tokio::test]
  async fn test_load_discards_snapshot_older_than_a_day() {
    let (metrics, clock) = aggregator();
    let store = MemoryStore::new();
    metrics.record_performance_metric(MetricCategory::DatabaseQuery, 12.0);
    metrics.persist(&store).await.unwrap();

    clock.advance(Duration::hours(25));
    let outcome = metrics.load(&store).await.unwrap();

    assert_eq!(outcome, LoadOutcome::Expired);
    assert!(metrics.get_performance_metrics().database_query_time.is_empty());
  }

  #[tokio::test]
  async fn test_load_handles_extreme_timestamp() {
    let (metrics, _) = aggregator();
    let store = MemoryStore::new();
    store
      .set(METRICS_KEY, &format!("{{\"lastUpdated\":{}}}", i64::MIN))
      .await
      .unwrap();

    assert_eq!(metrics.load(&store).await.unwrap(), LoadOutcome::Expired);
  }

  #[tokio::test]
  async fn test_load_keeps_recent_snapshot() {
    let (metrics, clock) = aggregator();
    let store = MemoryStore::new();
    metrics.record_performance_metric(MetricCategory::DatabaseQuery, 12.0);
    metrics.record_cache_hit();
    metrics.persist(&store).await.unwrap();

    metrics.reset();
    clock.advance(Duration::seconds(1));
    let outcome = metrics.load(&store).await.unwrap();

    assert_eq!(outcome, LoadOutcome::Restored);
    let restored = metrics.get_performance_metrics();
    assert_eq!(restored.database_query_time, vec![12.0]);
    assert_eq!(restored.cache_hit_rate, 1.0);
  }

  #[tokio::test]
  async fn test_load_resets_on_garbage() {
    let (metrics, _) = aggregator();
    let store = MemoryStore::new();
    store.set(METRICS_KEY, "{not json").await.unwrap();
    metrics.record_cache_miss();

    assert_eq!(metrics.load(&store).await.unwrap(), LoadOutcome::Corrupt);
    assert_eq!(metrics.get_performance_metrics(), PerformanceMetrics::default());
  }

  #[tokio::test]
  async fn test_load_absent() {
    let (metrics, _) = aggregator();
    let store = MemoryStore::new();
    assert_eq!(metrics.load(&store).await.unwrap(), LoadOutcome::Absent);
  }
}
