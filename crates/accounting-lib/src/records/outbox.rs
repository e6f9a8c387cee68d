//! Downstream delivery of record batches

use crate::error::{AccountingError, Result};
use crate::models::AccountingRecord;
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Accepts a batch of records as one message, at-least-once
#[async_trait]
pub trait RecordPublisher: Send + Sync {
    async fn publish(&self, records: &[AccountingRecord]) -> Result<()>;

    /// Human-readable destination, for logs
    fn describe(&self) -> String;
}

/// Writes each batch as one JSON file in a spool directory.
///
/// File names start with the publication time, so a consumer that reads
/// them in lexical order sees batches in the order they were produced.
pub struct DirectoryOutbox {
    directory: PathBuf,
    sequence: AtomicU64,
}

impl DirectoryOutbox {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn next_file_name(&self) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        format!(
            "batch-{}-{:06}.json",
            Utc::now().format("%Y%m%dT%H%M%S%.9f"),
            sequence
        )
    }
}

fn io_error(path: &Path, source: std::io::Error) -> AccountingError {
    AccountingError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl RecordPublisher for DirectoryOutbox {
    async fn publish(&self, records: &[AccountingRecord]) -> Result<()> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| io_error(&self.directory, e))?;

        let payload = serde_json::to_vec(records)
            .map_err(|e| AccountingError::serialization("record batch", e))?;

        let path = self.directory.join(self.next_file_name());
        let temp_path = path.with_extension("tmp");

        // Write atomically using temp file
        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| io_error(&temp_path, e))?;
        file.write_all(&payload)
            .await
            .map_err(|e| io_error(&temp_path, e))?;
        file.sync_all().await.map_err(|e| io_error(&temp_path, e))?;
        drop(file);

        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(|e| io_error(&path, e))?;

        debug!(path = %path.display(), records = records.len(), "Record batch spooled");
        Ok(())
    }

    fn describe(&self) -> String {
        self.directory.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn record(docker_id: &str) -> AccountingRecord {
        AccountingRecord {
            site: None,
            docker_id: docker_id.to_string(),
            measurement_day: "2018.12.31".to_string(),
            instance: 1,
            name: None,
            image_name: None,
            timestamp: Utc.with_ymd_and_hms(2018, 12, 31, 12, 0, 0).unwrap(),
            cpu_duration: 1,
            network_inbound: 2,
            network_outbound: 3,
            storage_used: 4,
            status: None,
            wall_duration: None,
            suspend_duration: None,
            creation_time: None,
            last_seen: None,
        }
    }

    async fn spooled_files(dir: &Path) -> Vec<PathBuf> {
        let mut entries = tokio::fs::read_dir(dir).await.unwrap();
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            files.push(entry.path());
        }
        files.sort();
        files
    }

    #[tokio::test]
    async fn test_batch_written_as_single_file() {
        let temp_dir = TempDir::new().unwrap();
        let outbox = DirectoryOutbox::new(temp_dir.path().join("outbox"));

        outbox.publish(&[record("a"), record("b")]).await.unwrap();

        let files = spooled_files(outbox.directory()).await;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].extension().unwrap(), "json");

        let content = tokio::fs::read(&files[0]).await.unwrap();
        let batch: Vec<AccountingRecord> = serde_json::from_slice(&content).unwrap();
        assert_eq!(batch, vec![record("a"), record("b")]);
    }

    #[tokio::test]
    async fn test_batches_sort_in_publication_order() {
        let temp_dir = TempDir::new().unwrap();
        let outbox = DirectoryOutbox::new(temp_dir.path());

        for id in ["first", "second", "third"] {
            outbox.publish(&[record(id)]).await.unwrap();
        }

        let files = spooled_files(temp_dir.path()).await;
        let mut order = Vec::new();
        for file in files {
            let batch: Vec<AccountingRecord> =
                serde_json::from_slice(&tokio::fs::read(&file).await.unwrap()).unwrap();
            order.push(batch[0].docker_id.clone());
        }
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_unusable_directory_reports_io_error() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("outbox");
        tokio::fs::write(&blocker, b"not a directory").await.unwrap();

        let outbox = DirectoryOutbox::new(&blocker);
        let err = outbox.publish(&[record("a")]).await.unwrap_err();
        assert!(matches!(err, AccountingError::Io { .. }));
    }
}
