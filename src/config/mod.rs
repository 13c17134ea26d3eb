//! Configuration parsing.
//!
//! Handles loading configuration from YAML files, with environment variable
//! interpolation, and turns it into the settings each component needs.

mod vars;

pub use vars::{InterpolationResult, interpolate};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{
    ConfigError, EmptyBucketSnafu, EmptyDatasetSnafu, EmptyProjectSnafu, EnvInterpolationSnafu,
    ReadFileSnafu, YamlParseSnafu, ZeroPollIntervalSnafu,
};
use crate::export::ExportConfig;
use crate::job::WaitConfig;
use crate::warehouse::BigQueryConfig;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub warehouse: WarehouseConfig,
    pub storage: StorageConfig,
    /// Export pipeline tuning (optional).
    #[serde(default)]
    pub export: ExportSettings,
    /// Metrics configuration (optional, disabled by default).
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Warehouse connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WarehouseConfig {
    /// Project that runs the jobs and owns the temporary dataset.
    pub project: String,

    /// Dataset that receives temporary result tables.
    pub dataset: String,

    /// Processing location for jobs (e.g. "US", "europe-west1").
    #[serde(default)]
    pub location: Option<String>,

    /// OAuth2 bearer token forwarded on every request.
    #[serde(default)]
    pub access_token: Option<String>,

    /// Base URL of the REST API.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Per-request timeout in seconds (default: 60).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Retries for throttled or unavailable responses (default: 5).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial delay between retries, doubled per attempt (default: 1000).
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_api_url() -> String {
    "https://bigquery.googleapis.com/bigquery/v2".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    1000
}

/// Bucket that receives extracted shards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Bucket URL, optionally with a key prefix.
    /// Examples: "gs://tmp-exports", "gs://tmp-exports/bulkquery", "/var/tmp/shards"
    pub bucket: String,

    /// Storage options (credentials, endpoints, etc.)
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
}

/// Export pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportSettings {
    /// Directory for local artifacts (default: the system temp directory).
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    /// Initial delay between job status polls (default: 1000).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound for the backed-off poll delay (default: 10000).
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,

    /// Give up waiting on a single job after this long (default: no limit).
    #[serde(default)]
    pub job_timeout_secs: Option<u64>,

    /// Delete the temporary table and shards when a stage fails (default: false).
    #[serde(default)]
    pub cleanup_on_failure: bool,

    /// Gzip level for the local artifact, 0-9 (default: 6).
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            temp_dir: None,
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            job_timeout_secs: None,
            cleanup_on_failure: false,
            compression_level: default_compression_level(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_poll_interval_ms() -> u64 {
    10_000
}

fn default_compression_level() -> u32 {
    6
}

/// Metrics configuration for the Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Whether the endpoint is served (default: false).
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text, interpolating environment variables.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let result = interpolate(content);
        if !result.is_ok() {
            return EnvInterpolationSnafu {
                message: result.errors.join("\n"),
            }
            .fail();
        }

        let config: Config = serde_yaml::from_str(&result.text).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.warehouse.project.is_empty(), EmptyProjectSnafu);
        ensure!(!self.warehouse.dataset.is_empty(), EmptyDatasetSnafu);
        ensure!(!self.storage.bucket.is_empty(), EmptyBucketSnafu);
        ensure!(self.export.poll_interval_ms > 0, ZeroPollIntervalSnafu);
        Ok(())
    }

    /// Settings for the BigQuery REST client.
    pub fn bigquery(&self) -> BigQueryConfig {
        BigQueryConfig {
            project: self.warehouse.project.clone(),
            location: self.warehouse.location.clone(),
            access_token: self.warehouse.access_token.clone(),
            api_url: self.warehouse.api_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(self.warehouse.request_timeout_secs),
            max_retries: self.warehouse.max_retries,
            retry_delay: Duration::from_millis(self.warehouse.retry_delay_ms),
        }
    }

    /// Settings for the export pipeline.
    pub fn export_config(&self) -> ExportConfig {
        let poll_interval = Duration::from_millis(self.export.poll_interval_ms);
        ExportConfig {
            project: self.warehouse.project.clone(),
            dataset: self.warehouse.dataset.clone(),
            temp_dir: self
                .export
                .temp_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
            wait: WaitConfig {
                poll_interval,
                max_poll_interval: Duration::from_millis(self.export.max_poll_interval_ms)
                    .max(poll_interval),
                timeout: self.export.job_timeout_secs.map(Duration::from_secs),
            },
            cleanup_on_failure: self.export.cleanup_on_failure,
            compression_level: self.export.compression_level.min(9),
        }
    }
}
