//! External collaborators: the remote database, the recommendation
//! generator and the image optimizer.

mod rest;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;

use crate::types::{OutfitFeedback, RecommendationBundle};

pub use rest::RestRemote;

/// The remote structured database.
#[async_trait]
pub trait RemoteDatabase: Send + Sync {
  /// Insert or update a feedback row by id. Must be idempotent.
  async fn upsert_feedback(&self, feedback: &OutfitFeedback) -> Result<()>;

  /// Delete rows of `table` whose `column` is older than `cutoff`.
  async fn delete_older_than(&self, table: &str, column: &str, cutoff: DateTime<Utc>)
    -> Result<()>;
}

/// The expensive recommendation-generation function.
#[async_trait]
pub trait RecommendationGenerator: Send + Sync {
  async fn generate(&self, user_id: &str) -> Result<RecommendationBundle>;
}

/// Produces a cheaper-to-load variant of an image URI.
#[async_trait]
pub trait ImageOptimizer: Send + Sync {
  async fn optimize(&self, uri: &str) -> Result<String>;
}

/// Optimizer that keeps the original URI.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughOptimizer;

#[async_trait]
impl ImageOptimizer for PassthroughOptimizer {
  async fn optimize(&self, uri: &str) -> Result<String> {
    Ok(uri.to_string())
  }
}
