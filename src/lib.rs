//! Offline resilience layer for the outfit recommendation client.
//!
//! Sits between the app and its backend and keeps the app usable on a flaky
//! connection:
//! - [`cache`]: TTL cache with lazy expiry over a local key-value store
//! - [`retry`]: bounded retries with exponential backoff and memoization
//! - [`queue`]: durable write-behind queue for user feedback
//! - [`metrics`]: rolling latency, hit-rate and error-rate metrics
//! - [`sweeper`]: removal of expired entries and old server-side rows
//! - [`service`]: composes everything and owns startup/shutdown
//!
//! ```ignore
//! let config = Config::load(None)?;
//! let service = Arc::new(ResilienceService::open(config)?);
//! service.initialize().await;
//! let _maintenance = service.spawn_maintenance(service.config().cleanup.interval());
//!
//! let bundle = service.pregenerate_recommendations("u1").await?;
//! service.queue_feedback_for_processing(feedback).await?;
//!
//! service.shutdown().await;
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod remote;
pub mod retry;
pub mod service;
pub mod store;
pub mod sweeper;
pub mod types;

pub use config::Config;
pub use service::{ResilienceService, ServiceBuilder};
