//! Bounded exponential backoff for transient store failures

use super::{async_trait, DocumentStore, Query, StoredDocument};
use crate::error::StoreError;
use crate::observability::AccountingMetrics;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry budget for a single store operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay after the given failed attempt (1-based), doubling each time
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails permanently, or the budget runs out.
    ///
    /// Only [`StoreError::Transient`] is retried; the last transient error is
    /// returned once `max_attempts` is exhausted.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        mut on_retry: impl FnMut(),
        mut op: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.backoff_for(attempt);
                    warn!(
                        operation = %operation,
                        attempt = attempt,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "Transient store failure, retrying"
                    );
                    on_retry();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Poll until a freshly created collection becomes visible.
///
/// Returns `false` when it is still missing after the retry budget, which
/// callers treat as "does not exist".
pub async fn wait_for_collection(
    store: &dyn DocumentStore,
    collection: &str,
    policy: &RetryPolicy,
) -> Result<bool, StoreError> {
    let max_attempts = policy.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match store.exists(collection).await {
            Ok(true) => return Ok(true),
            Ok(false) => {
                debug!(collection = %collection, attempt = attempt, "Collection not visible yet");
            }
            Err(err) if err.is_transient() => {
                warn!(collection = %collection, attempt = attempt, error = %err, "Transient failure checking collection");
            }
            Err(err) => return Err(err),
        }
        if attempt < max_attempts {
            tokio::time::sleep(policy.backoff_for(attempt)).await;
        }
    }
    Ok(false)
}

/// Store wrapper that retries transient failures of every operation
pub struct RetryingStore {
    inner: Arc<dyn DocumentStore>,
    policy: RetryPolicy,
    metrics: AccountingMetrics,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn DocumentStore>, policy: RetryPolicy, metrics: AccountingMetrics) -> Self {
        Self {
            inner,
            policy,
            metrics,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl DocumentStore for RetryingStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        self.policy
            .run(
                "get",
                || self.metrics.inc_store_retries("get"),
                || self.inner.get(collection, id),
            )
            .await
    }

    async fn put(&self, collection: &str, id: &str, document: &Value) -> Result<(), StoreError> {
        self.policy
            .run(
                "put",
                || self.metrics.inc_store_retries("put"),
                || self.inner.put(collection, id, document),
            )
            .await
    }

    async fn query(&self, query: &Query) -> Result<Vec<StoredDocument>, StoreError> {
        self.policy
            .run(
                "query",
                || self.metrics.inc_store_retries("query"),
                || self.inner.query(query),
            )
            .await
    }

    async fn exists(&self, collection: &str) -> Result<bool, StoreError> {
        self.policy
            .run(
                "exists",
                || self.metrics.inc_store_retries("exists"),
                || self.inner.exists(collection),
            )
            .await
    }
}
