//! Agent log line parsing
//!
//! Only container start/stop lines carry accounting information:
//!
//! ```text
//! time="2018-01-01T00:00:00Z" level=info msg="rancher id [1]: Container with docker id [abc] has been started"
//! ```

use crate::models::ContainerStatus;
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;

const LOG_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

static LOG_LINE: OnceLock<Regex> = OnceLock::new();

fn log_line_pattern() -> &'static Regex {
    LOG_LINE.get_or_init(|| {
        Regex::new(
            r#"^time="(?P<time>[^"]*)" level=(?P<level>\S+) msg="rancher id \[(?P<rancher_id>[^\]]*)\]: Container with docker id \[(?P<docker_id>[^\]]*)\] has been (?P<transition>[^"]*)"\s*$"#,
        )
        .expect("agent log pattern is valid")
    })
}

/// Transition reported by a lifecycle line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Started,
    Deactivated,
    Other(String),
}

impl Transition {
    fn from_raw(raw: &str) -> Self {
        match raw {
            "started" => Transition::Started,
            "deactivated" => Transition::Deactivated,
            other => Transition::Other(other.to_string()),
        }
    }

    /// Resource-consumption state the transition moves to, if any
    pub fn status(&self) -> Option<ContainerStatus> {
        match self {
            Transition::Started => Some(ContainerStatus::Running),
            Transition::Deactivated => Some(ContainerStatus::Stopped),
            Transition::Other(_) => None,
        }
    }
}

/// A parsed lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub docker_id: String,
    pub transition: Transition,
}

impl LogEvent {
    pub fn new(timestamp: DateTime<Utc>, docker_id: impl Into<String>, transition: Transition) -> Self {
        Self {
            timestamp,
            docker_id: docker_id.into(),
            transition,
        }
    }
}

/// Parse one line, `None` when it is not a well-formed lifecycle line
pub fn parse_line(line: &str) -> Option<LogEvent> {
    let captures = log_line_pattern().captures(line)?;

    let docker_id = captures.name("docker_id")?.as_str();
    if docker_id.is_empty() {
        return None;
    }

    let timestamp = NaiveDateTime::parse_from_str(captures.name("time")?.as_str(), LOG_TIME_FORMAT)
        .ok()?
        .and_utc();

    Some(LogEvent {
        timestamp,
        docker_id: docker_id.to_string(),
        transition: Transition::from_raw(captures.name("transition")?.as_str()),
    })
}

/// Events extracted from a whole log
#[derive(Debug, Default)]
pub struct ParsedLog {
    pub events: Vec<LogEvent>,
    /// Non-blank lines that did not match the lifecycle pattern
    pub skipped: usize,
}

/// Parse every line, skipping the ones that are not lifecycle events
pub fn parse_lines<S: AsRef<str>>(lines: &[S]) -> ParsedLog {
    let mut parsed = ParsedLog::default();
    for line in lines {
        let line = line.as_ref();
        match parse_line(line) {
            Some(event) => parsed.events.push(event),
            None if line.trim().is_empty() => {}
            None => parsed.skipped += 1,
        }
    }
    parsed
}
