//! Configuration management.
//!
//! osintflow configuration can come from:
//! - Built-in defaults
//! - Config file (~/.config/osintflow/config.toml)
//! - Environment variables (OSINTFLOW_*)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// osintflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub oracle: OracleConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub scraper: ScraperConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

/// Scheduler and run-pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between scheduler ticks
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,

    /// How long `stop()` waits for each in-flight run
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_seconds: u64,

    /// Upper bound on runs executing at the same time
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            stop_timeout_seconds: default_stop_timeout(),
            max_concurrent_runs: default_max_concurrent_runs(),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_seconds)
    }
}

fn default_poll_interval() -> u64 {
    60
}

fn default_stop_timeout() -> u64 {
    5
}

fn default_max_concurrent_runs() -> usize {
    8
}

/// Analysis oracle (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    #[serde(default = "default_oracle_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_oracle_model")]
    pub model: String,

    /// Model used for image analysis
    #[serde(default = "default_oracle_model")]
    pub vision_model: String,

    /// Name of the environment variable holding the API key
    #[serde(default = "default_oracle_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_oracle_timeout")]
    pub timeout_seconds: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            endpoint: default_oracle_endpoint(),
            model: default_oracle_model(),
            vision_model: default_oracle_model(),
            api_key_env: default_oracle_key_env(),
            timeout_seconds: default_oracle_timeout(),
        }
    }
}

fn default_oracle_endpoint() -> String {
    "https://openrouter.ai/api/v1/chat/completions".to_string()
}

fn default_oracle_model() -> String {
    "gpt-4o".to_string()
}

fn default_oracle_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}

fn default_oracle_timeout() -> u64 {
    60
}

/// Query target settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Per-request timeout
    #[serde(default = "default_query_timeout")]
    pub timeout_seconds: u64,

    /// Fixed pause between calls within one api_query step
    #[serde(default = "default_call_delay")]
    pub call_delay_ms: u64,

    /// Shared per-target budget across all executions
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_query_timeout(),
            call_delay_ms: default_call_delay(),
            requests_per_minute: default_requests_per_minute(),
        }
    }
}

fn default_query_timeout() -> u64 {
    10
}

fn default_call_delay() -> u64 {
    1000
}

fn default_requests_per_minute() -> u32 {
    30
}

/// Content extractor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    #[serde(default = "default_scraper_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_scraper_timeout(),
        }
    }
}

fn default_scraper_timeout() -> u64 {
    30
}

/// Metrics exporter settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Socket address for the Prometheus scrape endpoint (disabled if unset)
    #[serde(default)]
    pub listen: Option<String>,
}

impl Config {
    /// Load configuration from default locations.
    pub fn load() -> Self {
        let mut config = Self::default();

        let path = Self::config_dir().join("config.toml");
        if let Ok(partial) = Self::load_partial_from_path(&path) {
            config.apply_partial(partial);
        }

        config.apply_env_overrides();
        config
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("osintflow"))
            .unwrap_or_else(|| PathBuf::from(".osintflow"))
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("osintflow"))
            .unwrap_or_else(|| PathBuf::from(".osintflow"))
    }

    /// Resolved database path.
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("osintflow.db"))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("OSINTFLOW_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
        if let Some(v) = env_parse::<u64>("OSINTFLOW_POLL_INTERVAL_SECONDS") {
            self.engine.poll_interval_seconds = v;
        }
        if let Some(v) = env_parse::<u64>("OSINTFLOW_STOP_TIMEOUT_SECONDS") {
            self.engine.stop_timeout_seconds = v;
        }
        if let Some(v) = env_parse::<usize>("OSINTFLOW_MAX_CONCURRENT_RUNS") {
            self.engine.max_concurrent_runs = v;
        }
        if let Ok(endpoint) = std::env::var("OSINTFLOW_ORACLE_ENDPOINT") {
            self.oracle.endpoint = endpoint;
        }
        if let Ok(model) = std::env::var("OSINTFLOW_ORACLE_MODEL") {
            self.oracle.model = model;
        }
        if let Some(v) = env_parse::<u64>("OSINTFLOW_QUERY_TIMEOUT_SECONDS") {
            self.query.timeout_seconds = v;
        }
        if let Some(v) = env_parse::<u64>("OSINTFLOW_QUERY_CALL_DELAY_MS") {
            self.query.call_delay_ms = v;
        }
        if let Ok(listen) = std::env::var("OSINTFLOW_METRICS_LISTEN") {
            self.metrics.listen = Some(listen);
        }
    }

    fn load_partial_from_path(path: &Path) -> std::result::Result<PartialConfig, ()> {
        let content = std::fs::read_to_string(path).map_err(|_| ())?;
        toml::from_str(&content).map_err(|_| ())
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(storage) = partial.storage {
            self.storage = storage;
        }
        if let Some(engine) = partial.engine {
            self.engine = engine;
        }
        if let Some(oracle) = partial.oracle {
            self.oracle = oracle;
        }
        if let Some(query) = partial.query {
            self.query = query;
        }
        if let Some(scraper) = partial.scraper {
            self.scraper = scraper;
        }
        if let Some(metrics) = partial.metrics {
            self.metrics = metrics;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    storage: Option<StorageConfig>,
    engine: Option<EngineConfig>,
    oracle: Option<OracleConfig>,
    query: Option<QueryConfig>,
    scraper: Option<ScraperConfig>,
    metrics: Option<MetricsConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.engine.poll_interval_seconds, 60);
        assert_eq!(config.engine.stop_timeout_seconds, 5);
        assert_eq!(config.query.timeout_seconds, 10);
        assert_eq!(config.query.call_delay_ms, 1000);
        assert_eq!(config.scraper.timeout_seconds, 30);
        assert!(config.metrics.listen.is_none());
    }

    #[test]
    fn test_partial_file_overrides_only_given_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[engine]
poll_interval_seconds = 5

[query]
call_delay_ms = 0
"#,
        )
        .unwrap();

        let partial = Config::load_partial_from_path(&path).unwrap();
        let mut config = Config::default();
        config.apply_partial(partial);

        assert_eq!(config.engine.poll_interval_seconds, 5);
        // Missing keys inside a given section fall back to their defaults
        assert_eq!(config.engine.stop_timeout_seconds, 5);
        assert_eq!(config.query.call_delay_ms, 0);
        assert_eq!(config.query.timeout_seconds, 10);
        assert_eq!(config.oracle.model, "gpt-4o");
    }

    #[test]
    fn test_poll_interval_never_zero() {
        let engine = EngineConfig {
            poll_interval_seconds: 0,
            ..EngineConfig::default()
        };
        assert_eq!(engine.poll_interval(), Duration::from_secs(1));
    }
}
