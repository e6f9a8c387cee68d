//! Merging lifecycle state and usage samples into accounting records

use crate::models::{AccountingRecord, LifecycleState, MeasurementDay, UsageCounters, UsageSample};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, SubsecRound, Utc};
use std::collections::HashMap;

/// Best-effort lookup of a container's image
#[async_trait]
pub trait ImageResolver: Send + Sync {
    /// Image name, `None` when unknown
    async fn resolve(&self, docker_id: &str) -> Option<String>;
}

/// Resolver for deployments without an image catalogue
#[derive(Debug, Clone, Copy, Default)]
pub struct NoImages;

#[async_trait]
impl ImageResolver for NoImages {
    async fn resolve(&self, _docker_id: &str) -> Option<String> {
        None
    }
}

/// Fixed DockerId to image mapping, usually from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticImages {
    images: HashMap<String, String>,
}

impl StaticImages {
    pub fn new(images: HashMap<String, String>) -> Self {
        Self { images }
    }
}

#[async_trait]
impl ImageResolver for StaticImages {
    async fn resolve(&self, docker_id: &str) -> Option<String> {
        self.images.get(docker_id).cloned()
    }
}

/// Builds records for one site
#[derive(Debug, Clone)]
pub struct RecordAssembler {
    site: Option<String>,
    offset: FixedOffset,
}

impl RecordAssembler {
    pub fn new(site: Option<String>, offset: FixedOffset) -> Self {
        Self { site, offset }
    }

    /// Day a timestamp is filed under, in site-local time
    pub fn measurement_day(&self, at: DateTime<Utc>) -> MeasurementDay {
        MeasurementDay::from_timestamp(at, self.offset)
    }

    /// Record for a polled sample.
    ///
    /// `resolved_image` is only used when the sample carries no image.
    pub fn from_sample(
        &self,
        sample: &UsageSample,
        instance: u32,
        lifecycle: Option<&LifecycleState>,
        resolved_image: Option<String>,
    ) -> AccountingRecord {
        let mut record = self.base(
            &sample.docker_id,
            sample.timestamp,
            instance,
            sample.counters(),
            lifecycle,
        );
        record.name = sample.name.clone();
        record.image_name = sample.image_name.clone().or(resolved_image);
        record.creation_time = lifecycle
            .map(|state| state.creation_time)
            .or(sample.creation_time);
        record
    }

    /// Record for a container replayed from the log but absent from the poll.
    ///
    /// Counters carry over from the newest stored record so nothing already
    /// reported is lowered. The record is filed at `LastSeen`, or at the
    /// prior record's time when the log lags behind the polls, so newer
    /// counters never land on an older day. On a new day the carried
    /// counters open instance 1.
    pub fn from_lifecycle(
        &self,
        state: &LifecycleState,
        prior: Option<&AccountingRecord>,
        resolved_image: Option<String>,
    ) -> AccountingRecord {
        let at = match prior {
            Some(prior) if prior.timestamp > state.last_seen => prior.timestamp,
            _ => state.last_seen,
        };
        let day = self.measurement_day(at).to_string();

        let (instance, counters) = match prior {
            Some(prior) if prior.measurement_day == day => (prior.instance, prior.counters()),
            Some(prior) => (1, prior.counters()),
            None => (1, UsageCounters::default()),
        };

        let mut record = self.base(&state.docker_id, at, instance, counters, Some(state));
        record.name = prior.and_then(|p| p.name.clone());
        record.image_name = prior
            .and_then(|p| p.image_name.clone())
            .or(resolved_image);
        record.creation_time = Some(state.creation_time);
        record
    }

    fn base(
        &self,
        docker_id: &str,
        at: DateTime<Utc>,
        instance: u32,
        counters: UsageCounters,
        lifecycle: Option<&LifecycleState>,
    ) -> AccountingRecord {
        AccountingRecord {
            site: self.site.clone(),
            docker_id: docker_id.to_string(),
            measurement_day: self.measurement_day(at).to_string(),
            instance,
            name: None,
            image_name: None,
            // Stored at second precision
            timestamp: at.trunc_subsecs(0),
            cpu_duration: counters.cpu_duration,
            network_inbound: counters.network_inbound,
            network_outbound: counters.network_outbound,
            storage_used: counters.storage_used,
            status: lifecycle.map(|state| state.status),
            wall_duration: lifecycle.map(|state| state.wall_duration),
            suspend_duration: lifecycle.map(|state| state.suspend_duration),
            creation_time: None,
            last_seen: lifecycle.map(|state| state.last_seen),
        }
    }
}
