//! Pure lifecycle replay
//!
//! Folds lifecycle events into per-container duration accounting. Nothing
//! here touches the store: priors are handed in, and the documents to write
//! come back in a [`ReplayOutcome`].

use super::parser::LogEvent;
use crate::models::{Checkpoint, ContainerStatus, LifecycleState};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::warn;

/// Result of folding one batch of events
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    /// Final state of every container touched by the pass
    pub states: BTreeMap<String, LifecycleState>,
    /// Monthly documents to persist, keyed by document id
    pub documents: BTreeMap<String, LifecycleState>,
    /// New checkpoint, `None` when no event qualified
    pub checkpoint: Option<Checkpoint>,
    /// Events that created or moved a container state
    pub applied: usize,
    /// Unrecognized events on already known containers
    pub ignored: usize,
    /// Containers credited up to the new checkpoint
    pub extrapolated: usize,
}

/// Events strictly newer than the checkpoint
pub fn qualifying_events<'a>(
    events: &'a [LogEvent],
    checkpoint: &Checkpoint,
) -> impl Iterator<Item = &'a LogEvent> + 'a {
    let boundary = checkpoint.timestamp;
    events.iter().filter(move |event| event.timestamp > boundary)
}

/// Fold `events` on top of the stored `priors`.
///
/// Events at or before the checkpoint are discarded. Containers still
/// Running after the last event are credited up to the new checkpoint;
/// Stopped containers are left where their last event put them.
pub fn replay(
    events: &[LogEvent],
    priors: HashMap<String, LifecycleState>,
    checkpoint: &Checkpoint,
) -> ReplayOutcome {
    let mut working = priors;
    let mut outcome = ReplayOutcome::default();
    let mut running: BTreeSet<String> = BTreeSet::new();
    let mut last_event: Option<DateTime<Utc>> = None;

    for event in qualifying_events(events, checkpoint) {
        last_event = Some(event.timestamp);
        let incoming = event.transition.status();

        let state = match working.get_mut(&event.docker_id) {
            Some(state) => {
                let Some(incoming) = incoming else {
                    outcome.ignored += 1;
                    continue;
                };
                accrue(state, event.timestamp);
                state.status = incoming;
                state.clone()
            }
            None => {
                let state = LifecycleState::first_sighting(
                    event.docker_id.clone(),
                    incoming.unwrap_or(ContainerStatus::Stopped),
                    event.timestamp,
                );
                working.insert(event.docker_id.clone(), state.clone());
                state
            }
        };

        outcome.applied += 1;
        match state.status {
            ContainerStatus::Running => running.insert(state.docker_id.clone()),
            ContainerStatus::Stopped => running.remove(&state.docker_id),
        };
        record(&mut outcome, state);
    }

    let Some(now) = last_event else {
        return outcome;
    };

    for docker_id in &running {
        if let Some(state) = working.get_mut(docker_id) {
            accrue(state, now);
            outcome.extrapolated += 1;
            let state = state.clone();
            record(&mut outcome, state);
        }
    }

    outcome.checkpoint = Some(Checkpoint::new(now));
    outcome
}

/// Credit the time since `LastSeen` to the bucket of the current status
fn accrue(state: &mut LifecycleState, at: DateTime<Utc>) {
    let mut delta = (at - state.last_seen).num_seconds();
    if delta < 0 {
        warn!(
            docker_id = %state.docker_id,
            last_seen = %state.last_seen,
            event_time = %at,
            "Event predates stored state, clamping duration to zero"
        );
        delta = 0;
    }

    let delta = delta as u64;
    match state.status {
        ContainerStatus::Running => state.wall_duration += delta,
        ContainerStatus::Stopped => state.suspend_duration += delta,
    }
    if at > state.last_seen {
        state.last_seen = at;
    }
}

fn record(outcome: &mut ReplayOutcome, state: LifecycleState) {
    outcome.documents.insert(state.document_id(), state.clone());
    outcome.states.insert(state.docker_id.clone(), state);
}
