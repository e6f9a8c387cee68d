//! Store-backed lifecycle replay pass

use super::parser::parse_lines;
use super::replay::{qualifying_events, replay, ReplayOutcome};
use super::source::EventLogSource;
use crate::error::{AccountingError, Result};
use crate::models::{timestamp, Checkpoint, LifecycleState};
use crate::store::{find_newest, wait_for_collection, DocumentStore, Query, RetryPolicy, SortOrder};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Summary of a persisted replay pass
#[derive(Debug, Clone)]
pub struct ReplayReport {
    /// Checkpoint the pass started from
    pub previous: Checkpoint,
    pub outcome: ReplayOutcome,
    /// Log lines that did not parse as lifecycle events
    pub lines_skipped: usize,
}

impl ReplayReport {
    /// Whether the checkpoint moved
    pub fn advanced(&self) -> bool {
        self.outcome.checkpoint.is_some()
    }
}

/// Reads and writes lifecycle state and the log checkpoint
pub struct LifecycleTracker {
    store: Arc<dyn DocumentStore>,
    collection: String,
    retry: RetryPolicy,
}

impl LifecycleTracker {
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            store,
            collection: collection.into(),
            retry,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Stored checkpoint, or the initial one on a first run
    pub async fn load_checkpoint(&self) -> Result<Checkpoint> {
        if !wait_for_collection(self.store.as_ref(), &self.collection, &self.retry).await? {
            debug!(collection = %self.collection, "Lifecycle collection missing, starting from scratch");
            return Ok(Checkpoint::initial());
        }

        match self.store.get(&self.collection, Checkpoint::DOCUMENT_ID).await? {
            Some(doc) => serde_json::from_value(doc)
                .map_err(|e| AccountingError::serialization("checkpoint", e)),
            None => Ok(Checkpoint::initial()),
        }
    }

    /// Most recent stored state of a container across all months
    pub async fn latest_state(&self, docker_id: &str) -> Result<Option<LifecycleState>> {
        let query = Query::new(self.collection.as_str())
            .filter("DockerId", docker_id)
            .sort_by("LastSeen", SortOrder::Descending)
            .limit(2);

        match find_newest(self.store.as_ref(), &query).await? {
            Some(hit) => serde_json::from_value(hit.source)
                .map(Some)
                .map_err(|e| AccountingError::serialization(format!("lifecycle state {}", hit.id), e)),
            None => Ok(None),
        }
    }

    /// Latest state of every container in `docker_ids`, one lookup each
    pub async fn load_priors(&self, docker_ids: &BTreeSet<String>) -> Result<HashMap<String, LifecycleState>> {
        let mut priors = HashMap::with_capacity(docker_ids.len());
        for docker_id in docker_ids {
            if let Some(state) = self.latest_state(docker_id).await? {
                priors.insert(docker_id.clone(), state);
            }
        }
        Ok(priors)
    }

    /// Write every monthly state document of the pass
    pub async fn persist_states(&self, outcome: &ReplayOutcome) -> Result<()> {
        for (id, state) in &outcome.documents {
            let doc = serde_json::to_value(state)
                .map_err(|e| AccountingError::serialization(format!("lifecycle state {}", id), e))?;
            self.store.put(&self.collection, id, &doc).await?;
        }
        Ok(())
    }

    /// Store the checkpoint produced by the pass, if any.
    ///
    /// Written only once everything derived from the pass is stored. Events
    /// replayed again over their own stored states change nothing, so a pass
    /// that fails before this point is simply redone.
    pub async fn advance_checkpoint(&self, outcome: &ReplayOutcome) -> Result<()> {
        if let Some(checkpoint) = &outcome.checkpoint {
            let doc = serde_json::to_value(checkpoint)
                .map_err(|e| AccountingError::serialization("checkpoint", e))?;
            self.store
                .put(&self.collection, Checkpoint::DOCUMENT_ID, &doc)
                .await?;
        }
        Ok(())
    }

    /// Replay every new event from `source` and persist the result
    pub async fn replay(&self, source: &dyn EventLogSource) -> Result<ReplayReport> {
        let report = self.replay_states(source).await?;
        self.advance_checkpoint(&report.outcome).await?;
        Ok(report)
    }

    /// Replay every new event from `source` and store the resulting states,
    /// leaving the checkpoint where it was
    pub async fn replay_states(&self, source: &dyn EventLogSource) -> Result<ReplayReport> {
        let previous = self.load_checkpoint().await?;
        let lines = source.read_lines().await?;
        let parsed = parse_lines(&lines);

        let docker_ids: BTreeSet<String> = qualifying_events(&parsed.events, &previous)
            .map(|event| event.docker_id.clone())
            .collect();
        info!(
            log = %source.describe(),
            checkpoint = %timestamp::format(&previous.timestamp),
            events = parsed.events.len(),
            containers = docker_ids.len(),
            "Replaying agent log"
        );

        let priors = self.load_priors(&docker_ids).await?;
        let outcome = replay(&parsed.events, priors, &previous);
        self.persist_states(&outcome).await?;

        Ok(ReplayReport {
            previous,
            outcome,
            lines_skipped: parsed.skipped,
        })
    }
}
