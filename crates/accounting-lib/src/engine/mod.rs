//! Accounting passes
//!
//! The engine drives one bounded unit of work per call:
//!
//! - `replay`: fold new agent log events into lifecycle state
//! - `poll`: sample usage counters, split instances, write records
//! - `cycle`: replay, then poll, then records for containers the poll missed
//!
//! Periodic scheduling is left to the caller (cron, systemd timer).

use crate::error::{AccountingError, Result};
use crate::lifecycle::{EventLogSource, LifecycleTracker, ReplayReport};
use crate::models::{timestamp, AccountingRecord, Checkpoint, LifecycleState, UsageSample};
use crate::observability::{AccountingMetrics, StructuredLogger};
use crate::records::{ImageResolver, NoImages, RecordAssembler, RecordPublisher, RecordWriter};
use crate::store::{DocumentStore, RetryPolicy, RetryingStore};
use crate::usage::{reconcile, PriorRecordLookup, SampleSource};
use chrono::{FixedOffset, Offset, Utc};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Engine settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Site stamped on every record; omitted from record ids when unset
    pub site: Option<String>,
    /// Offset used to compute measurement days
    pub utc_offset: FixedOffset,
    /// Collection holding lifecycle state and the log checkpoint
    pub lifecycle_collection: String,
    /// Daily record collections are `<prefix>-<YYYY.MM.DD>`
    pub records_prefix: String,
    /// Containers processed concurrently during a poll
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            site: None,
            utc_offset: Utc.fix(),
            lifecycle_collection: "accounting_agent_logs".to_string(),
            records_prefix: "local_sdc_accounting".to_string(),
            max_concurrency: 8,
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome of a poll pass
#[derive(Debug, Clone, Default)]
pub struct PollReport {
    /// Records written, ordered by DockerId
    pub records: Vec<AccountingRecord>,
    /// Containers the sample source could not read
    pub samples_skipped: usize,
    /// Records that opened a new instance
    pub instance_splits: usize,
}

/// Outcome of a full cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub replay: ReplayReport,
    pub poll: PollReport,
    /// Records written for replayed containers absent from the poll
    pub lifecycle_only: Vec<AccountingRecord>,
}

impl CycleReport {
    pub fn records_written(&self) -> usize {
        self.poll.records.len() + self.lifecycle_only.len()
    }
}

/// Shared by every per-container task of a pass
struct EngineInner {
    tracker: LifecycleTracker,
    priors: PriorRecordLookup,
    writer: RecordWriter,
    assembler: RecordAssembler,
    images: Arc<dyn ImageResolver>,
    metrics: AccountingMetrics,
    logger: StructuredLogger,
}

/// Builder for [`AccountingEngine`]
pub struct AccountingEngineBuilder {
    store: Arc<dyn DocumentStore>,
    config: EngineConfig,
    images: Arc<dyn ImageResolver>,
    publisher: Option<Arc<dyn RecordPublisher>>,
}

impl AccountingEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn images(mut self, images: Arc<dyn ImageResolver>) -> Self {
        self.images = images;
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn RecordPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn build(self) -> AccountingEngine {
        let metrics = AccountingMetrics::new();
        let logger = StructuredLogger::new(self.config.site.clone().unwrap_or_else(|| "-".to_string()));
        let store: Arc<dyn DocumentStore> =
            Arc::new(RetryingStore::new(self.store, self.config.retry, metrics.clone()));

        let inner = EngineInner {
            tracker: LifecycleTracker::new(
                store.clone(),
                self.config.lifecycle_collection.clone(),
                self.config.retry,
            ),
            priors: PriorRecordLookup::new(store.clone(), self.config.records_prefix.clone()),
            writer: RecordWriter::new(store, self.config.records_prefix.clone()),
            assembler: RecordAssembler::new(self.config.site.clone(), self.config.utc_offset),
            images: self.images,
            metrics,
            logger,
        };

        AccountingEngine {
            config: self.config,
            inner: Arc::new(inner),
            publisher: self.publisher,
        }
    }
}

/// Runs accounting passes against a document store
pub struct AccountingEngine {
    config: EngineConfig,
    inner: Arc<EngineInner>,
    publisher: Option<Arc<dyn RecordPublisher>>,
}

impl AccountingEngine {
    pub fn builder(store: Arc<dyn DocumentStore>) -> AccountingEngineBuilder {
        AccountingEngineBuilder {
            store,
            config: EngineConfig::default(),
            images: Arc::new(NoImages),
            publisher: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &AccountingMetrics {
        &self.inner.metrics
    }

    /// Replay new agent log events into lifecycle state
    pub async fn replay_lifecycle(&self, log: &dyn EventLogSource) -> Result<ReplayReport> {
        self.instrumented("replay", |report: &ReplayReport| report.outcome.states.len(), async {
            let report = self.replay_states(log).await?;
            self.commit_checkpoint(&report).await?;
            Ok(report)
        })
        .await
    }

    /// Sample usage and write one record per container, then publish them
    pub async fn poll_usage(&self, source: &dyn SampleSource) -> Result<PollReport> {
        self.instrumented("poll", |report: &PollReport| report.records.len(), async {
            let report = self.poll_inner(source, &BTreeMap::new()).await?;
            self.publish(&report.records).await?;
            Ok(report)
        })
        .await
    }

    /// Replay, poll, and account for replayed containers the poll missed.
    ///
    /// The log checkpoint moves only after every record of the cycle is
    /// written and published, so a failed cycle replays the same events
    /// again and still produces records for containers that stopped.
    pub async fn run_cycle(
        &self,
        log: &dyn EventLogSource,
        source: &dyn SampleSource,
    ) -> Result<CycleReport> {
        self.instrumented("cycle", CycleReport::records_written, async {
            let replay = self.replay_states(log).await?;
            let poll = self.poll_inner(source, &replay.outcome.states).await?;

            let polled: BTreeSet<&str> = poll.records.iter().map(|r| r.docker_id.as_str()).collect();
            let mut lifecycle_only = Vec::new();
            for state in replay.outcome.states.values() {
                if !polled.contains(state.docker_id.as_str()) {
                    lifecycle_only.push(self.account_lifecycle_only(state).await?);
                }
            }

            let mut batch = poll.records.clone();
            batch.extend(lifecycle_only.iter().cloned());
            self.publish(&batch).await?;
            self.commit_checkpoint(&replay).await?;

            Ok(CycleReport {
                replay,
                poll,
                lifecycle_only,
            })
        })
        .await
    }

    async fn instrumented<T, F>(&self, pass: &str, containers: impl Fn(&T) -> usize, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let logger = &self.inner.logger;
        let metrics = &self.inner.metrics;
        let started = Instant::now();
        logger.log_pass_started(pass);

        let result = work.await;
        let elapsed = started.elapsed();
        metrics.observe_pass_duration(pass, elapsed.as_secs_f64());

        match &result {
            Ok(value) => logger.log_pass_completed(pass, containers(value), elapsed.as_millis()),
            Err(err) => {
                if let AccountingError::Ambiguous {
                    collection,
                    key,
                    matches,
                } = err
                {
                    logger.log_ambiguous_lookup(collection, key, *matches);
                }
                metrics.inc_pass_failures(pass);
                logger.log_pass_failed(pass, &err.to_string());
            }
        }
        result
    }

    async fn replay_states(&self, log: &dyn EventLogSource) -> Result<ReplayReport> {
        let inner = &self.inner;
        let report = inner.tracker.replay_states(log).await?;

        inner.metrics.inc_log_lines_skipped(report.lines_skipped as u64);
        inner
            .metrics
            .inc_lifecycle_events_applied(report.outcome.applied as u64);
        inner
            .metrics
            .inc_lifecycle_events_ignored(report.outcome.ignored as u64);
        Ok(report)
    }

    async fn commit_checkpoint(&self, report: &ReplayReport) -> Result<()> {
        let inner = &self.inner;
        inner.tracker.advance_checkpoint(&report.outcome).await?;

        if let Some(checkpoint) = &report.outcome.checkpoint {
            inner.logger.log_checkpoint_advanced(
                &describe_checkpoint(&report.previous),
                &describe_checkpoint(checkpoint),
                report.outcome.states.len(),
            );
        } else {
            info!(
                collection = %inner.tracker.collection(),
                "No new lifecycle events, checkpoint unchanged"
            );
        }
        Ok(())
    }

    async fn poll_inner(
        &self,
        source: &dyn SampleSource,
        replayed: &BTreeMap<String, LifecycleState>,
    ) -> Result<PollReport> {
        let inner = &self.inner;
        let fetched = source.fetch_samples().await?;
        for reason in &fetched.skipped {
            inner.metrics.inc_samples_skipped();
            inner.logger.log_record_skipped(None, reason);
        }

        let samples = newest_per_container(fetched.samples);
        debug!(
            source = %source.describe(),
            containers = samples.len(),
            "Reconciling usage samples"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for sample in samples {
            let inner = Arc::clone(&self.inner);
            let semaphore = Arc::clone(&semaphore);
            let lifecycle = replayed.get(&sample.docker_id).cloned();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| AccountingError::Task(e.to_string()))?;
                account_sample(&inner, sample, lifecycle).await
            });
        }

        let mut report = PollReport {
            samples_skipped: fetched.skipped.len(),
            ..Default::default()
        };
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.map_err(|e| AccountingError::Task(e.to_string()));
            match outcome {
                Ok(Ok((record, split))) => {
                    report.instance_splits += usize::from(split);
                    report.records.push(record);
                }
                Ok(Err(err)) | Err(err) => {
                    // Remaining containers are abandoned, the next pass redoes them
                    tasks.abort_all();
                    return Err(err);
                }
            }
        }

        report.records.sort_by(|a, b| a.docker_id.cmp(&b.docker_id));
        Ok(report)
    }

    async fn account_lifecycle_only(&self, state: &LifecycleState) -> Result<AccountingRecord> {
        let inner = &self.inner;
        let day = inner.assembler.measurement_day(state.last_seen);
        let prior = inner.priors.latest(&state.docker_id, day).await?;

        let image = match prior.as_ref().and_then(|p| p.image_name.as_ref()) {
            Some(_) => None,
            None => inner.images.resolve(&state.docker_id).await,
        };

        let record = inner.assembler.from_lifecycle(state, prior.as_ref(), image);
        inner.writer.upsert(&record).await?;
        inner.metrics.inc_records_written();
        Ok(record)
    }

    async fn publish(&self, records: &[AccountingRecord]) -> Result<()> {
        let Some(publisher) = &self.publisher else {
            return Ok(());
        };
        if records.is_empty() {
            return Ok(());
        }

        publisher.publish(records).await?;
        self.inner
            .logger
            .log_batch_published(records.len(), &publisher.describe());
        Ok(())
    }
}

/// Reconcile, merge and write one sample. Returns the record and whether it
/// opened a new instance.
async fn account_sample(
    inner: &EngineInner,
    sample: UsageSample,
    replayed: Option<LifecycleState>,
) -> Result<(AccountingRecord, bool)> {
    let day = inner.assembler.measurement_day(sample.timestamp);
    let prior = inner.priors.latest(&sample.docker_id, day).await?;
    let decision = reconcile(&sample.counters(), prior.as_ref(), day);

    if let Some((counter, previous, sampled)) = decision.regression() {
        inner.metrics.inc_instance_splits(counter.name());
        inner.logger.log_instance_split(
            &sample.docker_id,
            counter.name(),
            previous,
            sampled,
            decision.instance,
        );
    }

    let lifecycle = match replayed {
        Some(state) => Some(state),
        None => inner.tracker.latest_state(&sample.docker_id).await?,
    };

    let image = match sample.image_name {
        Some(_) => None,
        None => inner.images.resolve(&sample.docker_id).await,
    };

    let record = inner
        .assembler
        .from_sample(&sample, decision.instance, lifecycle.as_ref(), image);
    inner.writer.upsert(&record).await?;
    inner.metrics.inc_records_written();
    Ok((record, decision.is_split()))
}

/// Keep only the newest sample of each container
fn newest_per_container(samples: Vec<UsageSample>) -> Vec<UsageSample> {
    let mut newest: BTreeMap<String, UsageSample> = BTreeMap::new();
    for sample in samples {
        match newest.entry(sample.docker_id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(sample);
            }
            Entry::Occupied(mut slot) => {
                if sample.timestamp > slot.get().timestamp {
                    slot.insert(sample);
                }
            }
        }
    }
    newest.into_values().collect()
}

fn describe_checkpoint(checkpoint: &Checkpoint) -> String {
    if checkpoint.is_initial() {
        "none".to_string()
    } else {
        timestamp::format(&checkpoint.timestamp)
    }
}
