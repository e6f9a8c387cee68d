//! cAdvisor docker API sample source

use super::{async_trait, FetchedSamples, SampleSource};
use crate::error::SourceError;
use crate::models::UsageSample;
use chrono::{DateTime, SubsecRound, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Connection settings for a cAdvisor endpoint
#[derive(Debug, Clone)]
pub struct CadvisorConfig {
    /// Base URL, e.g. `http://localhost:8080`
    pub url: String,
    /// API version segment, e.g. `1.3`
    pub api_version: String,
    pub timeout: Duration,
}

impl Default for CadvisorConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            api_version: "1.3".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ContainerInfo {
    id: Option<String>,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    spec: ContainerSpec,
    #[serde(default)]
    stats: Vec<ContainerStats>,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerSpec {
    image: Option<String>,
    creation_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContainerStats {
    timestamp: Option<String>,
    cpu: Option<CpuStats>,
    network: Option<NetworkStats>,
    #[serde(default)]
    filesystem: Vec<FilesystemStats>,
}

#[derive(Debug, Deserialize)]
struct CpuStats {
    usage: CpuUsage,
}

#[derive(Debug, Deserialize)]
struct CpuUsage {
    /// Nanoseconds
    total: u64,
}

#[derive(Debug, Deserialize)]
struct NetworkStats {
    rx_bytes: Option<u64>,
    tx_bytes: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FilesystemStats {
    usage: u64,
}

/// Samples read from cAdvisor's `/api/v<version>/docker/` endpoint
pub struct CadvisorSource {
    client: Client,
    endpoint: Url,
}

impl CadvisorSource {
    pub fn new(config: &CadvisorConfig) -> Result<Self, SourceError> {
        let client = Client::builder().timeout(config.timeout).build()?;

        let version = format!("v{}", config.api_version);
        let mut endpoint = Url::parse(&config.url)
            .map_err(|e| SourceError::Decode(format!("invalid monitoring URL {}: {}", config.url, e)))?;
        endpoint
            .path_segments_mut()
            .map_err(|_| SourceError::Decode(format!("{} cannot be a base URL", config.url)))?
            .pop_if_empty()
            .extend(["api", version.as_str(), "docker", ""]);

        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

/// Turn one container entry into a sample, or the reason it was dropped
fn to_sample(key: &str, info: ContainerInfo) -> Result<UsageSample, String> {
    let docker_id = info
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| format!("container {} has no id", key))?;

    let latest = info
        .stats
        .into_iter()
        .last()
        .ok_or_else(|| format!("container {} has no stats", docker_id))?;

    let cpu = latest
        .cpu
        .ok_or_else(|| format!("container {} has no cpu usage", docker_id))?;
    let network = latest
        .network
        .ok_or_else(|| format!("container {} has no network stats", docker_id))?;
    let (Some(rx_bytes), Some(tx_bytes)) = (network.rx_bytes, network.tx_bytes) else {
        return Err(format!("container {} has incomplete network stats", docker_id));
    };
    let storage = latest
        .filesystem
        .first()
        .map(|fs| fs.usage)
        .ok_or_else(|| format!("container {} has no filesystem stats", docker_id))?;

    let timestamp = latest
        .timestamp
        .as_deref()
        .and_then(parse_time)
        .unwrap_or_else(Utc::now)
        .trunc_subsecs(0);

    let mut sample = UsageSample::new(docker_id, timestamp);
    sample.cpu_duration = cpu.usage.total / 1_000_000_000;
    sample.network_inbound = rx_bytes;
    sample.network_outbound = tx_bytes;
    sample.storage_used = storage;
    sample.name = info.aliases.into_iter().next();
    sample.image_name = info.spec.image.filter(|image| !image.is_empty());
    sample.creation_time = info
        .spec
        .creation_time
        .as_deref()
        .and_then(parse_time)
        .map(|ts| ts.trunc_subsecs(0));
    Ok(sample)
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[async_trait]
impl SampleSource for CadvisorSource {
    async fn fetch_samples(&self) -> Result<FetchedSamples, SourceError> {
        debug!(url = %self.endpoint, "Fetching container samples");
        let response = self.client.get(self.endpoint.clone()).send().await?;
        if !response.status().is_success() {
            return Err(SourceError::Status(response.status().as_u16()));
        }

        let containers: BTreeMap<String, ContainerInfo> = response
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;

        let mut fetched = FetchedSamples::default();
        for (key, info) in containers {
            match to_sample(&key, info) {
                Ok(sample) => fetched.samples.push(sample),
                Err(reason) => {
                    warn!(container = %key, reason = %reason, "Skipping container sample");
                    fetched.skipped.push(reason);
                }
            }
        }
        Ok(fetched)
    }

    fn describe(&self) -> String {
        self.endpoint.to_string()
    }
}
