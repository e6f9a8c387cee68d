//! Error types shared by the accounting engine and its adapters

use thiserror::Error;

/// Failures talking to the document store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store is momentarily unable to serve the request (index not yet
    /// queryable, overloaded node, dropped connection). Worth retrying.
    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode store response: {0}")]
    Decode(String),

    #[error("invalid store request: {0}")]
    InvalidRequest(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Failures reading samples or agent log lines
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("monitoring request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("monitoring source returned HTTP {0}")]
    Status(u16),

    #[error("failed to decode monitoring response: {0}")]
    Decode(String),

    #[error("failed to read event log {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures that abort an accounting pass
#[derive(Debug, Error)]
pub enum AccountingError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Source(#[from] SourceError),

    /// A lookup expected to yield one document yielded several. Points at an
    /// upstream data-integrity problem, so the pass stops instead of guessing.
    #[error("ambiguous lookup in {collection} for {key}: {matches} documents share the newest sort key")]
    Ambiguous {
        collection: String,
        key: String,
        matches: usize,
    },

    #[error("failed to (de)serialize {what}: {source}")]
    Serialization {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker task failed: {0}")]
    Task(String),
}

impl AccountingError {
    pub fn serialization(what: impl Into<String>, source: serde_json::Error) -> Self {
        AccountingError::Serialization {
            what: what.into(),
            source,
        }
    }
}

pub type Result<T, E = AccountingError> = std::result::Result<T, E>;
