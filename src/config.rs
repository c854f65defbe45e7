use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub remote: RemoteConfig,
  pub cache: CacheConfig,
  pub retry: RetryConfig,
  pub metrics: MetricsConfig,
  pub cleanup: CleanupConfig,
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
  /// Base URL of the backend (e.g. "https://project.supabase.co")
  pub url: String,
  /// Table feedback rows are upserted into
  pub feedback_table: String,
  /// Name of the recommendation-generation function
  pub generator_function: String,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      url: String::new(),
      feedback_table: "outfit_feedback".to_string(),
      generator_function: "generate-recommendations".to_string(),
    }
  }
}

/// Default time-to-live per kind of cached data.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub recommendations_ttl_hours: i64,
  pub wardrobe_ttl_days: i64,
  pub image_ttl_days: i64,
  pub query_ttl_minutes: i64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      recommendations_ttl_hours: 24,
      wardrobe_ttl_days: 7,
      image_ttl_days: 30,
      query_ttl_minutes: 5,
    }
  }
}

/// Out-of-range values saturate; [`Config::validate`] rejects them at load time.
impl CacheConfig {
  pub fn recommendations_ttl(&self) -> Duration {
    Duration::try_hours(self.recommendations_ttl_hours).unwrap_or(Duration::MAX)
  }

  pub fn wardrobe_ttl(&self) -> Duration {
    Duration::try_days(self.wardrobe_ttl_days).unwrap_or(Duration::MAX)
  }

  pub fn image_ttl(&self) -> Duration {
    Duration::try_days(self.image_ttl_days).unwrap_or(Duration::MAX)
  }

  pub fn query_ttl(&self) -> Duration {
    Duration::try_minutes(self.query_ttl_minutes).unwrap_or(Duration::MAX)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    let policy = RetryPolicy::default();
    Self {
      max_attempts: policy.max_attempts,
      base_delay_ms: policy.base_delay.as_millis() as u64,
      max_delay_ms: policy.max_delay.as_millis() as u64,
    }
  }
}

impl RetryConfig {
  pub fn policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_attempts: self.max_attempts,
      base_delay: std::time::Duration::from_millis(self.base_delay_ms),
      max_delay: std::time::Duration::from_millis(self.max_delay_ms),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
  /// Samples kept per latency category
  pub max_samples: usize,
  /// Persisted metrics older than this are discarded at startup
  pub freshness_hours: i64,
}

impl Default for MetricsConfig {
  fn default() -> Self {
    Self {
      max_samples: 100,
      freshness_hours: 24,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
  /// Period of the background maintenance task
  pub interval_minutes: u64,
  /// Server-side rows older than this are pruned
  pub retention_days: i64,
  pub table: String,
  /// Timestamp column compared against the retention cutoff
  pub column: String,
}

impl Default for CleanupConfig {
  fn default() -> Self {
    Self {
      interval_minutes: 60,
      retention_days: 30,
      table: "outfit_recommendations".to_string(),
      column: "created_at".to_string(),
    }
  }
}

impl MetricsConfig {
  pub fn freshness(&self) -> Duration {
    Duration::try_hours(self.freshness_hours).unwrap_or(Duration::MAX)
  }
}

impl CleanupConfig {
  pub fn interval(&self) -> std::time::Duration {
    std::time::Duration::from_secs(self.interval_minutes.max(1).saturating_mul(60))
  }

  pub fn retention(&self) -> Duration {
    Duration::try_days(self.retention_days).unwrap_or(Duration::MAX)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// SQLite file (defaults to the platform data directory)
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./outfit-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/outfit-cache/config.yaml
  ///
  /// Without any file the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("outfit-cache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("outfit-cache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Self = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  /// Reject durations that are not positive or do not fit in a timestamp.
  pub fn validate(&self) -> Result<()> {
    let checks = [
      (
        "cache.recommendations_ttl_hours",
        Duration::try_hours(self.cache.recommendations_ttl_hours),
      ),
      (
        "cache.wardrobe_ttl_days",
        Duration::try_days(self.cache.wardrobe_ttl_days),
      ),
      (
        "cache.image_ttl_days",
        Duration::try_days(self.cache.image_ttl_days),
      ),
      (
        "cache.query_ttl_minutes",
        Duration::try_minutes(self.cache.query_ttl_minutes),
      ),
      (
        "metrics.freshness_hours",
        Duration::try_hours(self.metrics.freshness_hours),
      ),
      (
        "cleanup.retention_days",
        Duration::try_days(self.cleanup.retention_days),
      ),
    ];

    for (name, duration) in checks {
      match duration {
        Some(d) if d > Duration::zero() && d <= max_span() => {}
        _ => return Err(eyre!("Invalid config value for {}: must be a positive, bounded duration", name)),
      }
    }
    Ok(())
  }

  /// Get the backend API key from environment variables.
  ///
  /// Checks OUTFIT_CACHE_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("OUTFIT_CACHE_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!("Backend API key not found. Set OUTFIT_CACHE_API_KEY or SUPABASE_ANON_KEY environment variable.")
      })
  }
}

/// Longest duration accepted from config: about 100 years.
fn max_span() -> Duration {
  Duration::try_days(36_500).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_yaml_gives_defaults() {
    let config = Config::from_yaml("{}").unwrap();
    assert_eq!(config.cache.recommendations_ttl(), Duration::hours(24));
    assert_eq!(config.cache.wardrobe_ttl(), Duration::days(7));
    assert_eq!(config.cache.image_ttl(), Duration::days(30));
    assert_eq!(config.retry.policy(), RetryPolicy::default());
    assert_eq!(config.metrics.max_samples, 100);
    assert_eq!(config.cleanup.table, "outfit_recommendations");
  }

  #[test]
  fn test_partial_sections_keep_other_defaults() {
    let config = Config::from_yaml(
      r#"
remote:
  url: https://example.supabase.co
retry:
  max_attempts: 5
cleanup:
  retention_days: 7
"#,
    )
    .unwrap();

    assert_eq!(config.remote.url, "https://example.supabase.co");
    assert_eq!(config.remote.feedback_table, "outfit_feedback");
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.retry.base_delay_ms, 1000);
    assert_eq!(config.cleanup.retention(), Duration::days(7));
    assert_eq!(config.cleanup.interval_minutes, 60);
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    assert!(Config::load(Some(Path::new("/definitely/not/here.yaml"))).is_err());
  }

  #[test]
  fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "metrics:\n  max_samples: 10\n").unwrap();

    let config = Config::load(Some(path.as_path())).unwrap();
    assert_eq!(config.metrics.max_samples, 10);
  }

  #[test]
  fn test_out_of_range_durations_are_rejected() {
    let huge = format!("cache:\n  wardrobe_ttl_days: {}\n", i64::MAX);
    assert!(Config::from_yaml(&huge).is_err());
    assert!(Config::from_yaml("cache:\n  query_ttl_minutes: 0\n").is_err());
    assert!(Config::from_yaml("cleanup:\n  retention_days: -1\n").is_err());
    assert!(Config::from_yaml("metrics:\n  freshness_hours: 9999999999999\n").is_err());
  }

  #[test]
  fn test_out_of_range_accessors_saturate() {
    let mut config = Config::default();
    config.cache.image_ttl_days = i64::MAX;
    config.cleanup.interval_minutes = u64::MAX;
    assert_eq!(config.cache.image_ttl(), Duration::MAX);
    assert_eq!(config.cleanup.interval(), std::time::Duration::from_secs(u64::MAX));
  }
}
