//! Container lifecycle tracking
//!
//! Rebuilds Running/Stopped durations per container from the agent's
//! append-only log. Each pass replays only the events newer than the stored
//! checkpoint, so repeated passes over the same log change nothing.

mod parser;
mod replay;
mod source;
mod tracker;

pub use parser::{parse_line, parse_lines, LogEvent, ParsedLog, Transition};
pub use replay::{qualifying_events, replay, ReplayOutcome};
pub use source::{EventLogSource, FileEventLog};
pub use tracker::{LifecycleTracker, ReplayReport};

#[cfg(test)]
mod tests;
