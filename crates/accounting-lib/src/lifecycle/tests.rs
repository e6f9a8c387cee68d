//! Tests for lifecycle replay
//!
//! The pure fold is exercised directly; the tracker tests run whole passes
//! against the in-memory store.

#[cfg(test)]
mod replay_tests {
    use crate::lifecycle::{replay, LogEvent, Transition};
    use crate::models::{Checkpoint, ContainerStatus, LifecycleState};
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::HashMap;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    fn started(ts: DateTime<Utc>, id: &str) -> LogEvent {
        LogEvent::new(ts, id, Transition::Started)
    }

    fn deactivated(ts: DateTime<Utc>, id: &str) -> LogEvent {
        LogEvent::new(ts, id, Transition::Deactivated)
    }

    fn fixture() -> Vec<LogEvent> {
        vec![
            started(at(2018, 1, 1, 0, 0, 0), "A"),
            started(at(2018, 1, 2, 1, 0, 0), "B"),
            deactivated(at(2018, 1, 2, 2, 0, 0), "B"),
            started(at(2018, 12, 31, 0, 0, 0), "B"),
            deactivated(at(2018, 12, 31, 1, 0, 0), "B"),
            deactivated(at(2018, 12, 31, 23, 59, 59), "A"),
        ]
    }

    fn assert_durations_cover_lifetime(state: &LifecycleState) {
        assert_eq!(
            (state.wall_duration + state.suspend_duration) as i64,
            state.tracked_seconds(),
            "durations do not cover the tracked lifetime of {}",
            state.docker_id
        );
    }

    #[test]
    fn test_full_year_fixture() {
        let outcome = replay(&fixture(), HashMap::new(), &Checkpoint::initial());

        let a = &outcome.states["A"];
        assert_eq!(a.wall_duration, 31_535_999);
        assert_eq!(a.suspend_duration, 0);
        assert_eq!(a.status, ContainerStatus::Stopped);

        let b = &outcome.states["B"];
        assert_eq!(b.wall_duration, 7_200);
        assert_eq!(b.suspend_duration, 31_356_000);
        assert_eq!(b.status, ContainerStatus::Stopped);

        assert_eq!(
            outcome.checkpoint,
            Some(Checkpoint::new(at(2018, 12, 31, 23, 59, 59)))
        );
        assert_eq!(outcome.applied, 6);
        assert_eq!(outcome.extrapolated, 0);
        assert_durations_cover_lifetime(a);
        assert_durations_cover_lifetime(b);
    }

    #[test]
    fn test_documents_are_filed_by_month_of_last_seen() {
        let outcome = replay(&fixture(), HashMap::new(), &Checkpoint::initial());

        let ids: Vec<&str> = outcome.documents.keys().map(String::as_str).collect();
        assert_eq!(ids, vec!["2018-1-A", "2018-1-B", "2018-12-A", "2018-12-B"]);
        assert_eq!(outcome.documents["2018-12-A"], outcome.states["A"]);
        // January document holds the state as of the last January event
        assert_eq!(outcome.documents["2018-1-B"].last_seen, at(2018, 1, 2, 2, 0, 0));
    }

    #[test]
    fn test_running_containers_extrapolate_to_checkpoint() {
        let events = vec![
            started(at(2018, 6, 1, 10, 0, 0), "C"),
            started(at(2018, 6, 1, 11, 0, 0), "D"),
            deactivated(at(2018, 6, 1, 12, 0, 0), "D"),
        ];

        let outcome = replay(&events, HashMap::new(), &Checkpoint::initial());

        let c = &outcome.states["C"];
        assert_eq!(c.status, ContainerStatus::Running);
        assert_eq!(c.wall_duration, 7_200);
        assert_eq!(c.last_seen, at(2018, 6, 1, 12, 0, 0));

        // Stopped containers are not credited past their last event
        let d = &outcome.states["D"];
        assert_eq!(d.wall_duration, 3_600);
        assert_eq!(d.last_seen, at(2018, 6, 1, 12, 0, 0));
        assert_eq!(outcome.extrapolated, 1);
    }

    #[test]
    fn test_replaying_same_log_twice_changes_nothing() {
        let first = replay(&fixture(), HashMap::new(), &Checkpoint::initial());
        let checkpoint = first.checkpoint.unwrap();

        let second = replay(&fixture(), first.states.clone().into_iter().collect(), &checkpoint);

        assert!(second.states.is_empty());
        assert!(second.documents.is_empty());
        assert_eq!(second.checkpoint, None);
    }

    #[test]
    fn test_second_pass_continues_from_stored_state() {
        let first_events = vec![started(at(2018, 6, 1, 10, 0, 0), "C")];
        let first = replay(&first_events, HashMap::new(), &Checkpoint::initial());
        assert_eq!(first.states["C"].wall_duration, 0);

        let mut log = first_events.clone();
        log.push(deactivated(at(2018, 6, 1, 13, 0, 0), "C"));
        log.push(started(at(2018, 6, 1, 14, 0, 0), "C"));

        let second = replay(
            &log,
            first.states.into_iter().collect(),
            &first.checkpoint.unwrap(),
        );
        let c = &second.states["C"];
        assert_eq!(c.wall_duration, 10_800);
        assert_eq!(c.suspend_duration, 3_600);
        assert_eq!(c.creation_time, at(2018, 6, 1, 10, 0, 0));
        assert_durations_cover_lifetime(c);
    }

    #[test]
    fn test_first_sighting_deactivated_creates_stopped_state() {
        let events = vec![deactivated(at(2018, 3, 1, 0, 0, 0), "E")];
        let outcome = replay(&events, HashMap::new(), &Checkpoint::initial());

        let e = &outcome.states["E"];
        assert_eq!(e.status, ContainerStatus::Stopped);
        assert_eq!(e.wall_duration, 0);
        assert_eq!(e.suspend_duration, 0);
        assert_eq!(e.creation_time, at(2018, 3, 1, 0, 0, 0));
    }

    #[test]
    fn test_first_sighting_unrecognized_creates_stopped_state() {
        let events = vec![LogEvent::new(
            at(2018, 3, 1, 0, 0, 0),
            "F",
            Transition::Other("purged".to_string()),
        )];
        let outcome = replay(&events, HashMap::new(), &Checkpoint::initial());

        assert_eq!(outcome.states["F"].status, ContainerStatus::Stopped);
        assert_eq!(outcome.checkpoint, Some(Checkpoint::new(at(2018, 3, 1, 0, 0, 0))));
    }

    #[test]
    fn test_unrecognized_event_advances_checkpoint_only() {
        let events = vec![
            started(at(2018, 3, 1, 0, 0, 0), "G"),
            deactivated(at(2018, 3, 1, 1, 0, 0), "G"),
            LogEvent::new(at(2018, 3, 1, 5, 0, 0), "G", Transition::Other("restarting".to_string())),
        ];
        let outcome = replay(&events, HashMap::new(), &Checkpoint::initial());

        let g = &outcome.states["G"];
        assert_eq!(g.last_seen, at(2018, 3, 1, 1, 0, 0));
        assert_eq!(g.suspend_duration, 0);
        assert_eq!(outcome.ignored, 1);
        assert_eq!(outcome.checkpoint, Some(Checkpoint::new(at(2018, 3, 1, 5, 0, 0))));
    }

    #[test]
    fn test_unrecognized_event_extends_running_extrapolation() {
        let events = vec![
            started(at(2018, 3, 1, 0, 0, 0), "H"),
            LogEvent::new(at(2018, 3, 1, 2, 0, 0), "H", Transition::Other("paused".to_string())),
        ];
        let outcome = replay(&events, HashMap::new(), &Checkpoint::initial());

        assert_eq!(outcome.states["H"].wall_duration, 7_200);
    }

    #[test]
    fn test_events_at_or_before_checkpoint_are_discarded() {
        let checkpoint = Checkpoint::new(at(2018, 1, 2, 2, 0, 0));
        let outcome = replay(&fixture(), HashMap::new(), &checkpoint);

        // A's start is at or before the checkpoint, so A is first seen at its stop
        let a = &outcome.states["A"];
        assert_eq!(a.creation_time, at(2018, 12, 31, 23, 59, 59));
        assert_eq!(a.wall_duration, 0);
        assert_eq!(outcome.applied, 3);
    }

    #[test]
    fn test_no_qualifying_events_leaves_checkpoint() {
        let outcome = replay(&[], HashMap::new(), &Checkpoint::initial());
        assert_eq!(outcome.checkpoint, None);
        assert!(outcome.documents.is_empty());
    }

    #[test]
    fn test_negative_delta_is_clamped() {
        let mut prior = LifecycleState::first_sighting("K", ContainerStatus::Running, at(2018, 3, 1, 0, 0, 0));
        prior.last_seen = at(2018, 3, 1, 12, 0, 0);
        prior.wall_duration = 43_200;
        let priors = HashMap::from([("K".to_string(), prior)]);

        let events = vec![deactivated(at(2018, 3, 1, 11, 0, 0), "K")];
        let outcome = replay(&events, priors, &Checkpoint::new(at(2018, 3, 1, 10, 0, 0)));

        let k = &outcome.states["K"];
        assert_eq!(k.status, ContainerStatus::Stopped);
        assert_eq!(k.wall_duration, 43_200);
        assert_eq!(k.last_seen, at(2018, 3, 1, 12, 0, 0));
    }
}

#[cfg(test)]
mod replay_property_tests {
    use crate::lifecycle::{replay, LogEvent, Transition};
    use crate::models::{Checkpoint, ContainerStatus};
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;
    use std::collections::HashMap;

    const DOCKER_IDS: &[&str] = &["a", "b", "c", "d", "e"];

    /// Mostly start/stop, now and then a transition replay does not act on
    fn arb_transition() -> impl Strategy<Value = Transition> {
        prop_oneof![
            4 => Just(Transition::Started),
            4 => Just(Transition::Deactivated),
            1 => "(paused|restarting|purged)".prop_map(Transition::Other),
        ]
    }

    /// Time-ordered log with strictly increasing timestamps
    fn arb_log(max_events: usize) -> impl Strategy<Value = Vec<LogEvent>> {
        prop::collection::vec(
            (1i64..200_000, prop::sample::select(DOCKER_IDS), arb_transition()),
            1..=max_events,
        )
        .prop_map(|steps| {
            let mut ts = Utc.with_ymd_and_hms(2018, 1, 1, 0, 0, 0).unwrap();
            steps
                .into_iter()
                .map(|(gap, docker_id, transition)| {
                    ts += Duration::seconds(gap);
                    LogEvent::new(ts, docker_id, transition)
                })
                .collect()
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        /// Wall plus suspend time always covers creation to last seen.
        #[test]
        fn prop_durations_cover_tracked_lifetime(log in arb_log(60)) {
            let outcome = replay(&log, HashMap::new(), &Checkpoint::initial());

            for state in outcome.states.values() {
                prop_assert_eq!(
                    (state.wall_duration + state.suspend_duration) as i64,
                    state.tracked_seconds(),
                    "durations of {} do not cover its lifetime",
                    &state.docker_id
                );
            }
            let last = log.last().map(|event| Checkpoint::new(event.timestamp));
            prop_assert_eq!(outcome.checkpoint, last);
        }

        /// Two passes split anywhere agree with one pass over the whole log.
        ///
        /// Containers the second pass never touches keep what the first
        /// pass gave them, which for Running ones stops at the first
        /// checkpoint.
        #[test]
        fn prop_split_passes_match_single_pass(
            log in arb_log(60),
            split in any::<prop::sample::Index>(),
        ) {
            let cut = split.index(log.len() + 1);
            let whole = replay(&log, HashMap::new(), &Checkpoint::initial());

            let first = replay(&log[..cut], HashMap::new(), &Checkpoint::initial());
            let checkpoint = first.checkpoint.clone().unwrap_or_else(Checkpoint::initial);
            let second = replay(&log, first.states.clone().into_iter().collect(), &checkpoint);

            for (docker_id, expected) in &whole.states {
                match second.states.get(docker_id) {
                    Some(state) => prop_assert_eq!(state, expected),
                    None => {
                        let carried = &first.states[docker_id];
                        match carried.status {
                            ContainerStatus::Stopped => prop_assert_eq!(carried, expected),
                            ContainerStatus::Running => {
                                prop_assert!(carried.wall_duration <= expected.wall_duration)
                            }
                        }
                    }
                }
            }
            prop_assert_eq!(second.checkpoint.or(first.checkpoint), whole.checkpoint);
        }

        /// Replaying a log over the states it already produced changes
        /// nothing, as happens when a pass fails before its checkpoint.
        #[test]
        fn prop_replay_over_own_states_is_idempotent(log in arb_log(60)) {
            let first = replay(&log, HashMap::new(), &Checkpoint::initial());
            let again = replay(&log, first.states.clone().into_iter().collect(), &Checkpoint::initial());

            for (docker_id, state) in &again.states {
                prop_assert_eq!(state, &first.states[docker_id]);
            }
            for (id, state) in &again.documents {
                prop_assert_eq!(state, &first.states[&state.docker_id]);
                prop_assert_eq!(id, &state.document_id());
            }
            prop_assert_eq!(again.checkpoint, first.checkpoint);
        }
    }
}

#[cfg(test)]
mod tracker_tests {
    use crate::error::{AccountingError, SourceError, StoreError};
    use crate::lifecycle::{EventLogSource, LifecycleTracker};
    use crate::models::{Checkpoint, ContainerStatus, LifecycleState};
    use crate::store::{DocumentStore, MemoryStore, Query, RetryPolicy, StoredDocument};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    const COLLECTION: &str = "accounting_agent_logs";

    struct StaticLog(Vec<String>);

    #[async_trait]
    impl EventLogSource for StaticLog {
        async fn read_lines(&self) -> Result<Vec<String>, SourceError> {
            Ok(self.0.clone())
        }

        fn describe(&self) -> String {
            "static".to_string()
        }
    }

    /// Memory store that refuses writes to one document id
    struct RejectingStore {
        inner: MemoryStore,
        rejected_id: String,
    }

    #[async_trait]
    impl DocumentStore for RejectingStore {
        async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
            self.inner.get(collection, id).await
        }

        async fn put(&self, collection: &str, id: &str, document: &Value) -> Result<(), StoreError> {
            if id == self.rejected_id {
                return Err(StoreError::Status {
                    status: 400,
                    body: "mapper_parsing_exception".to_string(),
                });
            }
            self.inner.put(collection, id, document).await
        }

        async fn query(&self, query: &Query) -> Result<Vec<StoredDocument>, StoreError> {
            self.inner.query(query).await
        }

        async fn exists(&self, collection: &str) -> Result<bool, StoreError> {
            self.inner.exists(collection).await
        }
    }

    fn line(ts: &str, docker_id: &str, what: &str) -> String {
        format!(
            r#"time="{}" level=info msg="rancher id [1i{}]: Container with docker id [{}] has been {}""#,
            ts,
            docker_id.len(),
            docker_id,
            what
        )
    }

    fn fixture_lines() -> Vec<String> {
        vec![
            line("2018-01-01T00:00:00Z", "A", "started"),
            "time=\"2018-01-01T00:00:01Z\" level=info msg=\"Listening on /var/run/agent.sock\"".to_string(),
            line("2018-01-02T01:00:00Z", "B", "started"),
            line("2018-01-02T02:00:00Z", "B", "deactivated"),
            line("2018-12-31T00:00:00Z", "B", "started"),
            line("2018-12-31T01:00:00Z", "B", "deactivated"),
            line("2018-12-31T23:59:59Z", "A", "deactivated"),
        ]
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    fn tracker(store: Arc<dyn DocumentStore>) -> LifecycleTracker {
        LifecycleTracker::new(store, COLLECTION, fast_retry())
    }

    #[tokio::test]
    async fn test_replay_persists_states_and_checkpoint() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(store.clone());

        let report = tracker.replay(&StaticLog(fixture_lines())).await.unwrap();
        assert!(report.previous.is_initial());
        assert!(report.advanced());
        assert_eq!(report.lines_skipped, 1);

        let checkpoint = store.get(COLLECTION, "1").await.unwrap().unwrap();
        assert_eq!(checkpoint, json!({"timestamp": "2018-12-31T23:59:59"}));

        let a: LifecycleState =
            serde_json::from_value(store.get(COLLECTION, "2018-12-A").await.unwrap().unwrap()).unwrap();
        assert_eq!(a.wall_duration, 31_535_999);
        assert_eq!(a.status, ContainerStatus::Stopped);

        let b = tracker.latest_state("B").await.unwrap().unwrap();
        assert_eq!(b.wall_duration, 7_200);
        assert_eq!(b.suspend_duration, 31_356_000);
    }

    #[tokio::test]
    async fn test_second_replay_of_same_log_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(store.clone());
        tracker.replay(&StaticLog(fixture_lines())).await.unwrap();

        let before: Vec<Option<String>> = ["1", "2018-12-A", "2018-12-B"]
            .iter()
            .map(|id| store.raw(COLLECTION, id))
            .collect();

        let report = tracker.replay(&StaticLog(fixture_lines())).await.unwrap();
        assert!(!report.advanced());
        assert!(report.outcome.documents.is_empty());

        let after: Vec<Option<String>> = ["1", "2018-12-A", "2018-12-B"]
            .iter()
            .map(|id| store.raw(COLLECTION, id))
            .collect();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_states_replayed_again_before_checkpoint_are_unchanged() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(store.clone());
        let ids = ["2018-1-A", "2018-1-B", "2018-12-A", "2018-12-B"];

        let first = tracker.replay_states(&StaticLog(fixture_lines())).await.unwrap();
        assert!(first.advanced());
        assert_eq!(store.get(COLLECTION, Checkpoint::DOCUMENT_ID).await.unwrap(), None);
        let before: Vec<Option<String>> = ids.iter().map(|id| store.raw(COLLECTION, id)).collect();

        // Same events again, this time over the states stored above
        let second = tracker.replay(&StaticLog(fixture_lines())).await.unwrap();
        assert!(second.previous.is_initial());
        assert_eq!(second.outcome.states, first.outcome.states);

        let after: Vec<Option<String>> = ids.iter().map(|id| store.raw(COLLECTION, id)).collect();
        assert_eq!(before, after);
        assert_eq!(
            store.get(COLLECTION, Checkpoint::DOCUMENT_ID).await.unwrap(),
            Some(json!({"timestamp": "2018-12-31T23:59:59"}))
        );
    }

    #[tokio::test]
    async fn test_appended_events_build_on_stored_state() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(store.clone());

        let mut lines = vec![line("2018-11-30T23:00:00Z", "C", "started")];
        tracker.replay(&StaticLog(lines.clone())).await.unwrap();

        lines.push(line("2018-12-01T01:00:00Z", "C", "deactivated"));
        let report = tracker.replay(&StaticLog(lines)).await.unwrap();

        let c = &report.outcome.states["C"];
        assert_eq!(c.wall_duration, 7_200);
        assert_eq!(c.creation_time, Utc.with_ymd_and_hms(2018, 11, 30, 23, 0, 0).unwrap());

        // November document keeps its last November value
        let november: LifecycleState =
            serde_json::from_value(store.get(COLLECTION, "2018-11-C").await.unwrap().unwrap()).unwrap();
        assert_eq!(november.wall_duration, 0);
        assert_eq!(tracker.latest_state("C").await.unwrap().unwrap(), *c);
    }

    #[tokio::test]
    async fn test_empty_log_does_not_write_checkpoint() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(store.clone());

        let report = tracker.replay(&StaticLog(vec!["noise".to_string()])).await.unwrap();
        assert!(!report.advanced());
        assert_eq!(store.count(COLLECTION), 0);
    }

    #[tokio::test]
    async fn test_failed_state_write_keeps_checkpoint() {
        let store = Arc::new(RejectingStore {
            inner: MemoryStore::new(),
            rejected_id: "2018-12-B".to_string(),
        });
        let tracker = tracker(store.clone());

        let result = tracker.replay(&StaticLog(fixture_lines())).await;
        assert!(matches!(result, Err(AccountingError::Store(_))));
        assert_eq!(store.inner.get(COLLECTION, Checkpoint::DOCUMENT_ID).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ambiguous_prior_state_aborts_replay() {
        let store = Arc::new(MemoryStore::new());
        let state = json!({
            "DockerId": "A",
            "Status": "Running",
            "WallDuration": 0,
            "SuspendDuration": 0,
            "CreationTime": "2017-12-01T00:00:00",
            "LastSeen": "2017-12-01T00:00:00"
        });
        store.put(COLLECTION, "2017-12-A", &state).await.unwrap();
        store.put(COLLECTION, "2017-12-A-copy", &state).await.unwrap();

        let result = tracker(store.clone()).replay(&StaticLog(fixture_lines())).await;
        assert!(matches!(result, Err(AccountingError::Ambiguous { .. })));
        assert_eq!(store.get(COLLECTION, Checkpoint::DOCUMENT_ID).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_log_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        let source = crate::lifecycle::FileEventLog::new("/nonexistent/agent.log");

        let result = tracker(store).replay(&source).await;
        assert!(matches!(result, Err(AccountingError::Source(SourceError::Io { .. }))));
    }
}
