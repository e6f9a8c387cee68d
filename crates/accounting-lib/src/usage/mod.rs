//! Usage sampling and instance reconciliation
//!
//! A sample source reports cumulative counters per container "right now";
//! the reconciler decides which instance of the container they belong to.

mod cadvisor;
mod reconciler;

pub use cadvisor::{CadvisorConfig, CadvisorSource};
pub use reconciler::{reconcile, Counter, CounterCheck, InstanceDecision, PriorRecordLookup};

use crate::error::SourceError;
use crate::models::UsageSample;

pub use async_trait::async_trait;

/// Samples from one poll, plus the containers that could not be read
#[derive(Debug, Clone, Default)]
pub struct FetchedSamples {
    pub samples: Vec<UsageSample>,
    /// Why each dropped container was skipped
    pub skipped: Vec<String>,
}

/// Source of per-container usage counters
#[async_trait]
pub trait SampleSource: Send + Sync {
    /// Poll every container currently known to the source
    async fn fetch_samples(&self) -> Result<FetchedSamples, SourceError>;

    /// Human-readable location, for logs
    fn describe(&self) -> String;
}
