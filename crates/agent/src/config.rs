//! Agent configuration

use accounting_lib::store::{ElasticConfig, RetryPolicy};
use accounting_lib::usage::CadvisorConfig;
use accounting_lib::EngineConfig;
use anyhow::{anyhow, Context, Result};
use chrono::FixedOffset;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Used when `--config` is not given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/accounting/agent.toml";

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Site name stamped on every record
    #[serde(default)]
    pub site: Option<String>,

    /// Offset from UTC used for measurement days, in minutes
    #[serde(default)]
    pub utc_offset_minutes: i32,

    /// Containers reconciled concurrently during a poll
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Prometheus text exposition written at exit
    #[serde(default)]
    pub metrics_textfile: Option<PathBuf>,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub event_log: EventLogSettings,

    #[serde(default)]
    pub monitoring: MonitoringSettings,

    #[serde(default)]
    pub outbox: OutboxSettings,

    /// Static DockerId to image mapping
    #[serde(default)]
    pub images: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Elasticsearch,
    /// Nothing survives the process, for dry runs
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    #[serde(default = "default_store_url")]
    pub url: String,
    #[serde(default = "default_store_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_lifecycle_collection")]
    pub lifecycle_collection: String,
    #[serde(default = "default_records_prefix")]
    pub records_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventLogSettings {
    #[serde(default = "default_event_log")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringSettings {
    #[serde(default = "default_monitoring_url")]
    pub url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_monitoring_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutboxSettings {
    /// Spool directory for record batches; batches are not published when unset
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_max_concurrency() -> usize {
    8
}

fn default_backend() -> StoreBackend {
    StoreBackend::Elasticsearch
}

fn default_store_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_store_timeout() -> u64 {
    30
}

fn default_lifecycle_collection() -> String {
    "accounting_agent_logs".to_string()
}

fn default_records_prefix() -> String {
    "local_sdc_accounting".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    200
}

fn default_max_backoff() -> u64 {
    5_000
}

fn default_event_log() -> PathBuf {
    PathBuf::from("/var/log/rancher/agent.log")
}

fn default_monitoring_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_api_version() -> String {
    "1.3".to_string()
}

fn default_monitoring_timeout() -> u64 {
    10
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_store_url(),
            timeout_secs: default_store_timeout(),
            lifecycle_collection: default_lifecycle_collection(),
            records_prefix: default_records_prefix(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl Default for EventLogSettings {
    fn default() -> Self {
        Self {
            path: default_event_log(),
        }
    }
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            url: default_monitoring_url(),
            api_version: default_api_version(),
            timeout_secs: default_monitoring_timeout(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from an optional TOML file overlaid by
    /// `ACCOUNTING_*` environment variables (`__` separates nested keys)
    pub fn load(path: &Path) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("ACCOUNTING")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

        config
            .try_deserialize()
            .context("Invalid agent configuration")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
        }
    }

    pub fn engine_config(&self) -> Result<EngineConfig> {
        let utc_offset = FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .ok_or_else(|| anyhow!("utc_offset_minutes {} is out of range", self.utc_offset_minutes))?;

        Ok(EngineConfig {
            site: self.site.clone().filter(|site| !site.is_empty()),
            utc_offset,
            lifecycle_collection: self.store.lifecycle_collection.clone(),
            records_prefix: self.store.records_prefix.clone(),
            max_concurrency: self.max_concurrency,
            retry: self.retry_policy(),
        })
    }

    pub fn elastic_config(&self) -> ElasticConfig {
        ElasticConfig {
            url: self.store.url.clone(),
            timeout: Duration::from_secs(self.store.timeout_secs),
        }
    }

    pub fn cadvisor_config(&self) -> CadvisorConfig {
        CadvisorConfig {
            url: self.monitoring.url.clone(),
            api_version: self.monitoring.api_version.clone(),
            timeout: Duration::from_secs(self.monitoring.timeout_secs),
        }
    }
}
