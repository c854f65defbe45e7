//! The resilience service: one instance per process, built at the
//! composition root and shared by `Arc`.

use chrono::Duration;
use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, TtlCache};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::metrics::{
  MetricCategory, MetricsAggregator, PerformanceMetrics, PerformanceSummary,
};
use crate::queue::{DrainReport, WriteBehindQueue};
use crate::remote::{
  ImageOptimizer, PassthroughOptimizer, RecommendationGenerator, RemoteDatabase, RestRemote,
};
use crate::retry::RetryExecutor;
use crate::store::{KeyValueStore, SqliteStore};
use crate::sweeper::{CleanupReport, PruneTarget, Sweeper};
use crate::types::{OutfitFeedback, RecommendationBundle, WardrobeItem};

/// Builder for [`ResilienceService`].
pub struct ServiceBuilder<S: KeyValueStore> {
  config: Config,
  store: Arc<S>,
  remote: Arc<dyn RemoteDatabase>,
  generator: Arc<dyn RecommendationGenerator>,
  optimizer: Arc<dyn ImageOptimizer>,
  clock: Arc<dyn Clock>,
}

impl<S: KeyValueStore> ServiceBuilder<S> {
  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_image_optimizer(mut self, optimizer: Arc<dyn ImageOptimizer>) -> Self {
    self.optimizer = optimizer;
    self
  }

  pub fn build(self) -> ResilienceService<S> {
    let metrics = Arc::new(
      MetricsAggregator::new(Arc::clone(&self.clock))
        .with_max_samples(self.config.metrics.max_samples)
        .with_freshness(self.config.metrics.freshness()),
    );
    let cache = TtlCache::new(
      Arc::clone(&self.store),
      Arc::clone(&self.clock),
      Arc::clone(&metrics),
    );
    let executor = RetryExecutor::new(cache.clone(), Arc::clone(&metrics))
      .with_policy(self.config.retry.policy())
      .with_default_ttl(self.config.cache.query_ttl());
    let queue = WriteBehindQueue::new(Arc::clone(&self.store));
    let sweeper = Sweeper::new(
      Arc::clone(&self.store),
      Arc::clone(&self.clock),
      Arc::clone(&self.remote),
      PruneTarget {
        table: self.config.cleanup.table.clone(),
        column: self.config.cleanup.column.clone(),
        retention: self.config.cleanup.retention(),
      },
    );

    ResilienceService {
      config: self.config,
      store: self.store,
      clock: self.clock,
      metrics,
      cache,
      executor,
      queue,
      sweeper,
      remote: self.remote,
      generator: self.generator,
      optimizer: self.optimizer,
    }
  }
}

/// Caching, retries and write-behind delivery between the app and its backend.
///
/// Reads degrade to misses and writes to no-ops when the local store fails;
/// only [`execute_optimized_query`](Self::execute_optimized_query) and
/// [`pregenerate_recommendations`](Self::pregenerate_recommendations) return
/// errors, after their retries run out.
pub struct ResilienceService<S: KeyValueStore> {
  config: Config,
  store: Arc<S>,
  clock: Arc<dyn Clock>,
  metrics: Arc<MetricsAggregator>,
  cache: TtlCache<S>,
  executor: RetryExecutor<S>,
  queue: WriteBehindQueue<OutfitFeedback, S>,
  sweeper: Sweeper<S>,
  remote: Arc<dyn RemoteDatabase>,
  generator: Arc<dyn RecommendationGenerator>,
  optimizer: Arc<dyn ImageOptimizer>,
}

impl ResilienceService<SqliteStore> {
  /// Open the SQLite store and the REST backend described by `config`.
  pub fn open(config: Config) -> Result<Self> {
    let store = match &config.storage.path {
      Some(path) => SqliteStore::open_at(path)?,
      None => SqliteStore::open()?,
    };
    let remote = Arc::new(RestRemote::new(&config.remote)?);

    Ok(Self::builder(config, Arc::new(store), remote.clone(), remote).build())
  }
}

impl<S: KeyValueStore> ResilienceService<S> {
  pub fn builder(
    config: Config,
    store: Arc<S>,
    remote: Arc<dyn RemoteDatabase>,
    generator: Arc<dyn RecommendationGenerator>,
  ) -> ServiceBuilder<S> {
    ServiceBuilder {
      config,
      store,
      remote,
      generator,
      optimizer: Arc::new(PassthroughOptimizer),
      clock: Arc::new(SystemClock),
    }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  // ==========================================================================
  // Lifecycle
  // ==========================================================================

  /// Load persisted metrics and restore the feedback queue. Never fails.
  pub async fn initialize(&self) {
    match self.metrics.load(self.store.as_ref()).await {
      Ok(outcome) => debug!(?outcome, "loaded metrics"),
      Err(e) => {
        warn!(error = %e, "failed to load metrics, starting empty");
        self.metrics.reset();
      }
    }

    let pending = self.queue.restore().await;
    info!(pending, "resilience layer initialized");
  }

  /// Persist metrics and the queue snapshot. Never fails.
  pub async fn shutdown(&self) {
    let (metrics, queue) = futures::join!(
      self.metrics.persist(self.store.as_ref()),
      self.queue.persist()
    );

    if let Err(e) = metrics {
      warn!(error = %e, "failed to persist metrics on shutdown");
    }
    if let Err(e) = queue {
      warn!(error = %e, "failed to persist feedback queue on shutdown");
    }
    info!("resilience layer shut down");
  }

  // ==========================================================================
  // Recommendations and wardrobe
  // ==========================================================================

  fn recommendations_key(&self, user_id: &str, date_key: Option<&str>) -> String {
    CacheKey::recommendations(user_id, date_key, self.clock.now()).storage_key()
  }

  pub async fn cache_recommendations(
    &self,
    user_id: &str,
    bundle: &RecommendationBundle,
    date_key: Option<&str>,
  ) {
    let key = self.recommendations_key(user_id, date_key);
    self
      .cache
      .set(&key, bundle, self.config.cache.recommendations_ttl())
      .await;
  }

  pub async fn get_cached_recommendations(
    &self,
    user_id: &str,
    date_key: Option<&str>,
  ) -> Option<RecommendationBundle> {
    let key = self.recommendations_key(user_id, date_key);
    self.cache.get(&key).await
  }

  /// Today's bundle from cache, or freshly generated (with retries) and cached.
  pub async fn pregenerate_recommendations(&self, user_id: &str) -> Result<RecommendationBundle> {
    let key = self.recommendations_key(user_id, None);

    self
      .executor
      .execute_as(
        Some(MetricCategory::RecommendationGeneration),
        || {
          let generator = Arc::clone(&self.generator);
          let user_id = user_id.to_string();
          async move { generator.generate(&user_id).await }
        },
        Some(&key),
        Some(self.config.cache.recommendations_ttl()),
      )
      .await
  }

  pub async fn cache_wardrobe_data(&self, user_id: &str, items: &[WardrobeItem]) {
    let key = CacheKey::wardrobe(user_id).storage_key();
    self
      .cache
      .set(&key, items, self.config.cache.wardrobe_ttl())
      .await;
  }

  pub async fn get_cached_wardrobe_data(&self, user_id: &str) -> Option<Vec<WardrobeItem>> {
    let key = CacheKey::wardrobe(user_id).storage_key();
    self.cache.get(&key).await
  }

  /// The cached optimized URI, or the result of optimizing now.
  ///
  /// Falls back to the original URI (uncached) when optimization fails.
  pub async fn optimize_image_loading(&self, uri: &str) -> String {
    let key = CacheKey::optimized_image(uri).storage_key();
    if let Some(cached) = self.cache.get::<String>(&key).await {
      return cached;
    }

    let optimized = self
      .metrics
      .time(MetricCategory::ImageProcessing, self.optimizer.optimize(uri))
      .await;

    match optimized {
      Ok(optimized) => {
        self
          .cache
          .set(&key, &optimized, self.config.cache.image_ttl())
          .await;
        optimized
      }
      Err(e) => {
        warn!(uri, error = %e, "image optimization failed, using original");
        uri.to_string()
      }
    }
  }

  // ==========================================================================
  // Feedback queue
  // ==========================================================================

  /// Queue feedback for delivery. Returns once the queue is persisted.
  pub async fn queue_feedback_for_processing(&self, feedback: OutfitFeedback) -> Result<()> {
    self.queue.enqueue(feedback).await
  }

  pub async fn restore_feedback_queue(&self) -> usize {
    self.queue.restore().await
  }

  /// Deliver pending feedback to the remote database in order.
  pub async fn drain_feedback_queue(&self) -> DrainReport {
    self
      .queue
      .drain(|feedback| {
        let remote = Arc::clone(&self.remote);
        let metrics = Arc::clone(&self.metrics);
        async move {
          let result = remote.upsert_feedback(&feedback).await;
          metrics.record_operation(result.is_ok());
          result
        }
      })
      .await
  }

  pub async fn pending_feedback(&self) -> Vec<OutfitFeedback> {
    self.queue.snapshot().await
  }

  // ==========================================================================
  // Queries and maintenance
  // ==========================================================================

  /// Run `operation` with retries; with a `key`, memoize the result under `query_{key}`.
  pub async fn execute_optimized_query<T, F, Fut>(
    &self,
    operation: F,
    key: Option<&str>,
    ttl: Option<Duration>,
  ) -> Result<T>
  where
    T: Serialize + DeserializeOwned + Sync,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let storage_key = key.map(|k| CacheKey::query(k).storage_key());
    self
      .executor
      .execute(operation, storage_key.as_deref(), ttl)
      .await
  }

  pub async fn perform_cleanup(&self) -> CleanupReport {
    self.sweeper.perform_cleanup().await
  }

  pub fn get_performance_metrics(&self) -> PerformanceMetrics {
    self.metrics.get_performance_metrics()
  }

  pub fn get_performance_summary(&self) -> PerformanceSummary {
    self.metrics.get_performance_summary()
  }

  pub fn record_performance_metric(&self, category: MetricCategory, duration_ms: f64) {
    self.metrics.record_performance_metric(category, duration_ms);
  }
}

impl<S: KeyValueStore + 'static> ResilienceService<S> {
  /// Run cleanup and a queue drain every `interval`, starting immediately.
  ///
  /// The task runs until the handle is aborted or the runtime shuts down.
  pub fn spawn_maintenance(self: &Arc<Self>, interval: std::time::Duration) -> JoinHandle<()> {
    let service = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        service.perform_cleanup().await;
        service.drain_feedback_queue().await;
      }
    })
  }
}
