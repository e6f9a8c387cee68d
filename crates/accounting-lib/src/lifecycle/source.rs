//! Sources of agent log lines

use crate::error::SourceError;
use async_trait::async_trait;
use std::path::PathBuf;

/// Append-only log of container lifecycle lines
#[async_trait]
pub trait EventLogSource: Send + Sync {
    /// Every line of the log, oldest first
    async fn read_lines(&self) -> Result<Vec<String>, SourceError>;

    /// Human-readable location, for logs
    fn describe(&self) -> String;
}

/// Agent log read from a local file
#[derive(Debug, Clone)]
pub struct FileEventLog {
    path: PathBuf,
}

impl FileEventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl EventLogSource for FileEventLog {
    async fn read_lines(&self) -> Result<Vec<String>, SourceError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| SourceError::Io {
                path: self.path.display().to_string(),
                source,
            })?;
        Ok(content.lines().map(str::to_owned).collect())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
