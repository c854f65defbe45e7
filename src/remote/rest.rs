use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, RequestBuilder};
use url::Url;

use super::{RecommendationGenerator, RemoteDatabase};
use crate::config::{Config, RemoteConfig};
use crate::types::{OutfitFeedback, RecommendationBundle};

/// Client for a PostgREST-style backend (tables under `/rest/v1`,
/// functions under `/functions/v1`).
#[derive(Clone)]
pub struct RestRemote {
  http: reqwest::Client,
  base_url: Url,
  api_key: String,
  feedback_table: String,
  generator_function: String,
}

impl RestRemote {
  /// Create a client, reading the API key from the environment.
  pub fn new(config: &RemoteConfig) -> Result<Self> {
    let api_key = Config::get_api_key()?;
    Self::with_api_key(config, api_key)
  }

  pub fn with_api_key(config: &RemoteConfig, api_key: String) -> Result<Self> {
    let mut base_url = Url::parse(&config.url)
      .map_err(|e| eyre!("Invalid backend url {:?}: {}", config.url, e))?;

    // Url::join replaces the last path segment unless the base ends with '/'
    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }

    let http = reqwest::Client::builder()
      .gzip(true)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url,
      api_key,
      feedback_table: config.feedback_table.clone(),
      generator_function: config.generator_function.clone(),
    })
  }

  fn table_url(&self, table: &str) -> Result<Url> {
    self
      .base_url
      .join(&format!("rest/v1/{}", table))
      .map_err(|e| eyre!("Failed to build url for table {}: {}", table, e))
  }

  fn function_url(&self, name: &str) -> Result<Url> {
    self
      .base_url
      .join(&format!("functions/v1/{}", name))
      .map_err(|e| eyre!("Failed to build url for function {}: {}", name, e))
  }

  /// URL deleting rows of `table` with `column` before `cutoff`.
  fn prune_url(&self, table: &str, column: &str, cutoff: DateTime<Utc>) -> Result<Url> {
    let mut url = self.table_url(table)?;
    url.query_pairs_mut().append_pair(
      column,
      &format!("lt.{}", cutoff.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    Ok(url)
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    self
      .http
      .request(method, url)
      .header("apikey", &self.api_key)
      .bearer_auth(&self.api_key)
  }
}

#[async_trait]
impl RemoteDatabase for RestRemote {
  async fn upsert_feedback(&self, feedback: &OutfitFeedback) -> Result<()> {
    let url = self.table_url(&self.feedback_table)?;

    self
      .request(Method::POST, url)
      .header("Prefer", "resolution=merge-duplicates,return=minimal")
      .json(feedback)
      .send()
      .await
      .and_then(|r| r.error_for_status())
      .map_err(|e| eyre!("Failed to upsert feedback {}: {}", feedback.id, e))?;

    Ok(())
  }

  async fn delete_older_than(
    &self,
    table: &str,
    column: &str,
    cutoff: DateTime<Utc>,
  ) -> Result<()> {
    let url = self.prune_url(table, column, cutoff)?;

    self
      .request(Method::DELETE, url)
      .header("Prefer", "return=minimal")
      .send()
      .await
      .and_then(|r| r.error_for_status())
      .map_err(|e| eyre!("Failed to prune {}: {}", table, e))?;

    Ok(())
  }
}

#[async_trait]
impl RecommendationGenerator for RestRemote {
  async fn generate(&self, user_id: &str) -> Result<RecommendationBundle> {
    let url = self.function_url(&self.generator_function)?;
    let body = serde_json::json!({ "userId": user_id });

    let response = self
      .request(Method::POST, url)
      .json(&body)
      .send()
      .await
      .and_then(|r| r.error_for_status())
      .map_err(|e| eyre!("Failed to generate recommendations for {}: {}", user_id, e))?;

    response
      .json::<RecommendationBundle>()
      .await
      .map_err(|e| eyre!("Failed to parse recommendations for {}: {}", user_id, e))
  }
}
