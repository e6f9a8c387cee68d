//! Container accounting library
//!
//! This crate provides the core functionality for:
//! - Lifecycle replay of the container agent log into Running/Stopped durations
//! - Usage sampling with instance splitting on counter resets
//! - Record assembly, idempotent persistence and batch delivery
//! - Observability (Prometheus metrics, structured logging)

pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod observability;
pub mod records;
pub mod store;
pub mod usage;

pub use engine::{AccountingEngine, AccountingEngineBuilder, CycleReport, EngineConfig, PollReport};
pub use error::{AccountingError, Result, SourceError, StoreError};
pub use models::*;
pub use observability::{AccountingMetrics, StructuredLogger};
