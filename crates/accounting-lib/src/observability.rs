//! Observability infrastructure for the accounting agent
//!
//! Provides:
//! - Prometheus metrics (pass latency, events applied, instance splits, records written)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder,
    HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Histogram buckets for pass durations (in seconds)
const PASS_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AccountingMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct AccountingMetricsInner {
    pass_duration_seconds: HistogramVec,
    log_lines_skipped: IntCounter,
    lifecycle_events_applied: IntCounter,
    lifecycle_events_ignored: IntCounter,
    samples_skipped: IntCounter,
    instance_splits: IntCounterVec,
    records_written: IntCounter,
    store_retries: IntCounterVec,
    pass_failures: IntCounterVec,
}

impl AccountingMetricsInner {
    fn new() -> Self {
        Self {
            pass_duration_seconds: register_histogram_vec!(
                "accounting_pass_duration_seconds",
                "Wall time of one accounting pass",
                &["pass"],
                PASS_BUCKETS.to_vec()
            )
            .expect("Failed to register pass_duration_seconds"),

            log_lines_skipped: register_int_counter!(
                "accounting_log_lines_skipped_total",
                "Agent log lines that did not match the lifecycle pattern"
            )
            .expect("Failed to register log_lines_skipped"),

            lifecycle_events_applied: register_int_counter!(
                "accounting_lifecycle_events_applied_total",
                "Start/stop events applied to lifecycle state"
            )
            .expect("Failed to register lifecycle_events_applied"),

            lifecycle_events_ignored: register_int_counter!(
                "accounting_lifecycle_events_ignored_total",
                "Qualifying events with an unrecognized transition"
            )
            .expect("Failed to register lifecycle_events_ignored"),

            samples_skipped: register_int_counter!(
                "accounting_samples_skipped_total",
                "Monitoring samples dropped as malformed or duplicate"
            )
            .expect("Failed to register samples_skipped"),

            instance_splits: register_int_counter_vec!(
                "accounting_instance_splits_total",
                "New instances allocated after a counter regression",
                &["counter"]
            )
            .expect("Failed to register instance_splits"),

            records_written: register_int_counter!(
                "accounting_records_written_total",
                "Accounting records upserted into the document store"
            )
            .expect("Failed to register records_written"),

            store_retries: register_int_counter_vec!(
                "accounting_store_retries_total",
                "Document store operations retried after a transient failure",
                &["operation"]
            )
            .expect("Failed to register store_retries"),

            pass_failures: register_int_counter_vec!(
                "accounting_pass_failures_total",
                "Accounting passes aborted by a fatal error",
                &["pass"]
            )
            .expect("Failed to register pass_failures"),
        }
    }
}

/// Accounting metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AccountingMetrics {
    _private: (),
}

impl Default for AccountingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountingMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AccountingMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AccountingMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn observe_pass_duration(&self, pass: &str, duration_secs: f64) {
        self.inner()
            .pass_duration_seconds
            .with_label_values(&[pass])
            .observe(duration_secs);
    }

    pub fn inc_log_lines_skipped(&self, count: u64) {
        self.inner().log_lines_skipped.inc_by(count);
    }

    pub fn inc_lifecycle_events_applied(&self, count: u64) {
        self.inner().lifecycle_events_applied.inc_by(count);
    }

    pub fn inc_lifecycle_events_ignored(&self, count: u64) {
        self.inner().lifecycle_events_ignored.inc_by(count);
    }

    pub fn inc_samples_skipped(&self) {
        self.inner().samples_skipped.inc();
    }

    pub fn inc_instance_splits(&self, counter: &str) {
        self.inner()
            .instance_splits
            .with_label_values(&[counter])
            .inc();
    }

    pub fn inc_records_written(&self) {
        self.inner().records_written.inc();
    }

    pub fn inc_store_retries(&self, operation: &str) {
        self.inner()
            .store_retries
            .with_label_values(&[operation])
            .inc();
    }

    pub fn inc_pass_failures(&self, pass: &str) {
        self.inner().pass_failures.with_label_values(&[pass]).inc();
    }

    /// Render every registered metric in the Prometheus text format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&prometheus::gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Structured logger for accounting events
///
/// Provides consistent JSON-formatted logging for passes, instance splits,
/// checkpoints and skipped inputs.
#[derive(Clone)]
pub struct StructuredLogger {
    site: String,
}

impl StructuredLogger {
    pub fn new(site: impl Into<String>) -> Self {
        Self { site: site.into() }
    }

    /// Log the start of a pass
    pub fn log_pass_started(&self, pass: &str) {
        info!(
            event = "pass_started",
            site = %self.site,
            pass = %pass,
            "Accounting pass started"
        );
    }

    /// Log a successful pass
    pub fn log_pass_completed(&self, pass: &str, containers: usize, elapsed_ms: u128) {
        info!(
            event = "pass_completed",
            site = %self.site,
            pass = %pass,
            containers = containers,
            elapsed_ms = elapsed_ms,
            "Accounting pass completed"
        );
    }

    /// Log an aborted pass
    pub fn log_pass_failed(&self, pass: &str, error: &str) {
        error!(
            event = "pass_failed",
            site = %self.site,
            pass = %pass,
            error = %error,
            "Accounting pass aborted, checkpoint left untouched"
        );
    }

    /// Log a counter regression that opened a new instance
    pub fn log_instance_split(
        &self,
        docker_id: &str,
        counter: &str,
        previous_value: u64,
        sampled_value: u64,
        new_instance: u32,
    ) {
        warn!(
            event = "instance_split",
            site = %self.site,
            docker_id = %docker_id,
            counter = %counter,
            previous_value = previous_value,
            sampled_value = sampled_value,
            new_instance = new_instance,
            "Counter regression detected, starting a new instance"
        );
    }

    /// Log a checkpoint advance
    pub fn log_checkpoint_advanced(&self, from: &str, to: &str, containers: usize) {
        info!(
            event = "checkpoint_advanced",
            site = %self.site,
            from = %from,
            to = %to,
            containers = containers,
            "Agent log checkpoint advanced"
        );
    }

    /// Log an input item dropped without aborting the pass
    pub fn log_record_skipped(&self, docker_id: Option<&str>, reason: &str) {
        warn!(
            event = "record_skipped",
            site = %self.site,
            docker_id = ?docker_id,
            reason = %reason,
            "Skipping malformed input"
        );
    }

    /// Log a lookup that matched more documents than it should
    pub fn log_ambiguous_lookup(&self, collection: &str, key: &str, matches: usize) {
        error!(
            event = "ambiguous_lookup",
            site = %self.site,
            collection = %collection,
            key = %key,
            matches = matches,
            "Lookup expected to be unique returned several documents"
        );
    }

    /// Log a batch handed to the downstream transport
    pub fn log_batch_published(&self, records: usize, destination: &str) {
        info!(
            event = "batch_published",
            site = %self.site,
            records = records,
            destination = %destination,
            "Published accounting record batch"
        );
    }
}
