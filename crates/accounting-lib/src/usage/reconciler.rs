//! Instance reconciliation
//!
//! Counters reported by the monitoring source are cumulative for the life of
//! a container process. When one goes backwards the container was restarted
//! (or recreated under the same id), and usage from then on is filed under a
//! new instance so the earlier totals are never overwritten with smaller ones.

use crate::error::{AccountingError, Result};
use crate::models::{AccountingRecord, MeasurementDay, UsageCounters};
use crate::store::{find_newest, DocumentStore, Query, SortOrder};
use std::fmt;
use std::sync::Arc;

/// Cumulative counters checked for regressions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    CpuDuration,
    NetworkInbound,
    NetworkOutbound,
}

impl Counter {
    /// Comparison order, the first regression decides
    pub const ORDER: [Counter; 3] = [
        Counter::CpuDuration,
        Counter::NetworkInbound,
        Counter::NetworkOutbound,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Counter::CpuDuration => "CpuDuration",
            Counter::NetworkInbound => "NetworkInbound",
            Counter::NetworkOutbound => "NetworkOutbound",
        }
    }

    fn read(&self, counters: &UsageCounters) -> u64 {
        match self {
            Counter::CpuDuration => counters.cpu_duration,
            Counter::NetworkInbound => counters.network_inbound,
            Counter::NetworkOutbound => counters.network_outbound,
        }
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of comparing one counter against the prior record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterCheck {
    Passed,
    Regressed { previous: u64, sampled: u64 },
    /// An earlier counter already regressed
    NotCompared,
}

/// Instance to file a sample under, with the per-counter verdicts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDecision {
    pub instance: u32,
    /// One entry per counter, in [`Counter::ORDER`]; empty without a prior
    pub checks: Vec<(Counter, CounterCheck)>,
}

impl InstanceDecision {
    /// The counter that showed a reset, if any
    pub fn regression(&self) -> Option<(Counter, u64, u64)> {
        self.checks.iter().find_map(|(counter, check)| match check {
            CounterCheck::Regressed { previous, sampled } => Some((*counter, *previous, *sampled)),
            _ => None,
        })
    }

    /// Whether the counters were reset since the prior record
    pub fn is_split(&self) -> bool {
        self.regression().is_some()
    }
}

/// Decide the instance `sampled` is filed under on `day`, given the newest
/// stored record.
///
/// Instances are numbered per day. A prior record from the same day keeps
/// its instance, or the next one after a regression. A prior record from an
/// earlier day is still compared, so a reset is reported, but the sample
/// opens instance 1 of its own day.
///
/// `StorageUsed` is a gauge and never triggers a split.
pub fn reconcile(
    sampled: &UsageCounters,
    prior: Option<&AccountingRecord>,
    day: MeasurementDay,
) -> InstanceDecision {
    let Some(prior) = prior else {
        return InstanceDecision {
            instance: 1,
            checks: Vec::new(),
        };
    };

    let previous = prior.counters();
    let mut checks = Vec::with_capacity(Counter::ORDER.len());
    let mut regressed = false;

    for counter in Counter::ORDER {
        let check = if regressed {
            CounterCheck::NotCompared
        } else {
            let (before, now) = (counter.read(&previous), counter.read(sampled));
            if before > now {
                regressed = true;
                CounterCheck::Regressed {
                    previous: before,
                    sampled: now,
                }
            } else {
                CounterCheck::Passed
            }
        };
        checks.push((counter, check));
    }

    let instance = if prior.measurement_day != day.to_string() {
        1
    } else if regressed {
        prior.instance + 1
    } else {
        prior.instance
    };
    InstanceDecision { instance, checks }
}

/// Looks up the newest stored record of a container
pub struct PriorRecordLookup {
    store: Arc<dyn DocumentStore>,
    prefix: String,
}

impl PriorRecordLookup {
    pub fn new(store: Arc<dyn DocumentStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Newest record in the month of `day`, else in the month before
    pub async fn latest(&self, docker_id: &str, day: MeasurementDay) -> Result<Option<AccountingRecord>> {
        for month in [day.month_label(), day.previous_month_label()] {
            let query = Query::new(format!("{}-{}.*", self.prefix, month))
                .filter("DockerId", docker_id)
                .sort_by("@timestamp", SortOrder::Descending)
                .limit(2);

            if let Some(hit) = find_newest(self.store.as_ref(), &query).await? {
                let record = serde_json::from_value(hit.source).map_err(|e| {
                    AccountingError::serialization(format!("record {}/{}", hit.collection, hit.id), e)
                })?;
                return Ok(Some(record));
            }
        }
        Ok(None)
    }
}
