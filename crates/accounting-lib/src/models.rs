//! Core data models for the accounting engine
//!
//! Every persisted document keeps the field names used by the downstream
//! accounting pipeline (`DockerId`, `WallDuration`, `@timestamp`, ...), so the
//! serde attributes here are part of the storage contract.

use chrono::{DateTime, Datelike, Days, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Textual form of every persisted timestamp
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Textual form of a measurement day, also used in collection names
pub const DAY_FORMAT: &str = "%Y.%m.%d";

/// Fixed-format (de)serialization for timestamps.
///
/// Use with `#[serde(with = "timestamp")]`. Sub-second precision is dropped on
/// write so that a re-read document compares equal to what produced it.
pub mod timestamp {
    use super::TIMESTAMP_FORMAT;
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.format(TIMESTAMP_FORMAT).to_string()
    }

    /// Parse a stored timestamp, tolerating fractional seconds and RFC 3339
    /// values written by older collectors.
    pub fn parse(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f"))
            .map(|naive| naive.and_utc())
            .or_else(|_| DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&Utc)))
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            ts: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match ts {
                Some(ts) => serializer.serialize_str(&super::format(ts)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            let raw: Option<String> = Option::deserialize(deserializer)?;
            raw.map(|raw| super::parse(&raw).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

/// Whether a container is consuming resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerStatus {
    Running,
    Stopped,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerStatus::Running => f.write_str("Running"),
            ContainerStatus::Stopped => f.write_str("Stopped"),
        }
    }
}

/// Duration accounting for one container, rebuilt from the agent log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LifecycleState {
    pub docker_id: String,
    pub status: ContainerStatus,
    /// Seconds spent Running
    pub wall_duration: u64,
    /// Seconds spent Stopped while the container was still known to exist
    pub suspend_duration: u64,
    #[serde(with = "timestamp")]
    pub creation_time: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub last_seen: DateTime<Utc>,
}

impl LifecycleState {
    /// State for a container that has never been seen before
    pub fn first_sighting(
        docker_id: impl Into<String>,
        status: ContainerStatus,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            docker_id: docker_id.into(),
            status,
            wall_duration: 0,
            suspend_duration: 0,
            creation_time: at,
            last_seen: at,
        }
    }

    /// Seconds between creation and the last applied event
    pub fn tracked_seconds(&self) -> i64 {
        (self.last_seen - self.creation_time).num_seconds()
    }

    /// Monthly document id: `<year>-<month>-<DockerId>`
    pub fn document_id(&self) -> String {
        lifecycle_document_id(self.last_seen, &self.docker_id)
    }
}

/// Monthly lifecycle document id for a container at a point in time.
///
/// The month is not zero padded.
pub fn lifecycle_document_id(at: DateTime<Utc>, docker_id: &str) -> String {
    format!("{}-{}-{}", at.year(), at.month(), docker_id)
}

/// One poll of cumulative counters for a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageSample {
    pub docker_id: String,
    pub timestamp: DateTime<Utc>,
    /// Cumulative CPU time in seconds
    pub cpu_duration: u64,
    /// Cumulative bytes received
    pub network_inbound: u64,
    /// Cumulative bytes sent
    pub network_outbound: u64,
    /// Snapshot of bytes on disk, not cumulative
    pub storage_used: u64,
    pub name: Option<String>,
    pub image_name: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
}

impl UsageSample {
    /// Sample with counters only
    pub fn new(docker_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            docker_id: docker_id.into(),
            timestamp,
            cpu_duration: 0,
            network_inbound: 0,
            network_outbound: 0,
            storage_used: 0,
            name: None,
            image_name: None,
            creation_time: None,
        }
    }

    pub fn counters(&self) -> UsageCounters {
        UsageCounters {
            cpu_duration: self.cpu_duration,
            network_inbound: self.network_inbound,
            network_outbound: self.network_outbound,
            storage_used: self.storage_used,
        }
    }
}

/// Counter values carried by a sample or a persisted record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageCounters {
    pub cpu_duration: u64,
    pub network_inbound: u64,
    pub network_outbound: u64,
    pub storage_used: u64,
}

/// Calendar day under which a record is filed, in site-local time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MeasurementDay(NaiveDate);

impl MeasurementDay {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn from_timestamp(ts: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self(ts.with_timezone(&offset).date_naive())
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// `YYYY.MM` label of this day's month
    pub fn month_label(&self) -> String {
        self.0.format("%Y.%m").to_string()
    }

    /// `YYYY.MM` label of the month before this day's month
    pub fn previous_month_label(&self) -> String {
        let first = self.0.with_day(1).unwrap_or(self.0);
        first
            .checked_sub_days(Days::new(1))
            .unwrap_or(first)
            .format("%Y.%m")
            .to_string()
    }
}

impl fmt::Display for MeasurementDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(DAY_FORMAT))
    }
}

/// Final accounting record, one per container instance per day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AccountingRecord {
    pub site: Option<String>,
    pub docker_id: String,
    pub measurement_day: String,
    pub instance: u32,
    pub name: Option<String>,
    pub image_name: Option<String>,
    #[serde(rename = "@timestamp", with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub cpu_duration: u64,
    pub network_inbound: u64,
    pub network_outbound: u64,
    pub storage_used: u64,
    pub status: Option<ContainerStatus>,
    pub wall_duration: Option<u64>,
    pub suspend_duration: Option<u64>,
    #[serde(default, with = "timestamp::option")]
    pub creation_time: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp::option")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl AccountingRecord {
    /// `<Site>-<DockerId>-<MeasurementDay>-<Instance>`, Site omitted when unset
    pub fn record_id(&self) -> String {
        record_id(
            self.site.as_deref(),
            &self.docker_id,
            &self.measurement_day,
            self.instance,
        )
    }

    /// Daily collection the record is filed under
    pub fn collection(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.measurement_day)
    }

    pub fn counters(&self) -> UsageCounters {
        UsageCounters {
            cpu_duration: self.cpu_duration,
            network_inbound: self.network_inbound,
            network_outbound: self.network_outbound,
            storage_used: self.storage_used,
        }
    }
}

pub fn record_id(site: Option<&str>, docker_id: &str, day: &str, instance: u32) -> String {
    match site {
        Some(site) => format!("{}-{}-{}-{}", site, docker_id, day, instance),
        None => format!("{}-{}-{}", docker_id, day, instance),
    }
}

/// Boundary below which agent log events are known to be applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    /// Reserved singleton id inside the lifecycle collection
    pub const DOCUMENT_ID: &'static str = "1";

    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self { timestamp }
    }

    /// Checkpoint of a first run: every event qualifies
    pub fn initial() -> Self {
        Self {
            timestamp: DateTime::<Utc>::MIN_UTC,
        }
    }

    pub fn is_initial(&self) -> bool {
        self.timestamp == DateTime::<Utc>::MIN_UTC
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    #[test]
    fn test_lifecycle_state_serializes_with_storage_names() {
        let state = LifecycleState::first_sighting("abc", ContainerStatus::Running, at(2018, 1, 1, 0, 0, 0));
        let json = serde_json::to_value(&state).unwrap();

        assert_eq!(json["DockerId"], "abc");
        assert_eq!(json["Status"], "Running");
        assert_eq!(json["WallDuration"], 0);
        assert_eq!(json["CreationTime"], "2018-01-01T00:00:00");
        assert_eq!(json["LastSeen"], "2018-01-01T00:00:00");

        let back: LifecycleState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_lifecycle_document_id_uses_unpadded_month() {
        let state = LifecycleState::first_sighting("abc", ContainerStatus::Stopped, at(2018, 3, 9, 0, 0, 0));
        assert_eq!(state.document_id(), "2018-3-abc");
    }

    #[test]
    fn test_timestamp_parse_tolerates_fractional_and_rfc3339() {
        let expected = at(2018, 12, 31, 1, 0, 0);
        assert_eq!(timestamp::parse("2018-12-31T01:00:00").unwrap(), expected);
        assert_eq!(timestamp::parse("2018-12-31T01:00:00.000").unwrap(), expected);
        assert_eq!(timestamp::parse("2018-12-31T01:00:00Z").unwrap(), expected);
        assert!(timestamp::parse("yesterday").is_err());
    }

    #[test]
    fn test_record_id_with_and_without_site() {
        assert_eq!(record_id(Some("RAL"), "abc", "2018.12.31", 2), "RAL-abc-2018.12.31-2");
        assert_eq!(record_id(None, "abc", "2018.12.31", 1), "abc-2018.12.31-1");
    }

    #[test]
    fn test_measurement_day_respects_site_offset() {
        let ts = at(2018, 12, 31, 23, 30, 0);
        let utc = MeasurementDay::from_timestamp(ts, FixedOffset::east_opt(0).unwrap());
        let ahead = MeasurementDay::from_timestamp(ts, FixedOffset::east_opt(3600).unwrap());

        assert_eq!(utc.to_string(), "2018.12.31");
        assert_eq!(ahead.to_string(), "2019.01.01");
    }

    #[test]
    fn test_measurement_day_month_labels() {
        let day = MeasurementDay::new(NaiveDate::from_ymd_opt(2019, 1, 15).unwrap());
        assert_eq!(day.month_label(), "2019.01");
        assert_eq!(day.previous_month_label(), "2018.12");
    }

    #[test]
    fn test_record_serializes_nulls_for_missing_fields() {
        let record = AccountingRecord {
            site: None,
            docker_id: "abc".to_string(),
            measurement_day: "2018.12.31".to_string(),
            instance: 1,
            name: None,
            image_name: None,
            timestamp: at(2018, 12, 31, 12, 0, 0),
            cpu_duration: 10,
            network_inbound: 20,
            network_outbound: 30,
            storage_used: 40,
            status: None,
            wall_duration: None,
            suspend_duration: None,
            creation_time: None,
            last_seen: None,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert!(json["ImageName"].is_null());
        assert_eq!(json["@timestamp"], "2018-12-31T12:00:00");

        let back: AccountingRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_initial_checkpoint_is_minimum() {
        let checkpoint = Checkpoint::initial();
        assert!(checkpoint.is_initial());
        assert!(checkpoint.timestamp < at(1970, 1, 1, 0, 0, 0));
    }
}
