//! Idempotent record persistence

use crate::error::{AccountingError, Result};
use crate::models::AccountingRecord;
use crate::store::DocumentStore;
use std::sync::Arc;
use tracing::debug;

/// Upserts records into their daily collection
pub struct RecordWriter {
    store: Arc<dyn DocumentStore>,
    prefix: String,
}

impl RecordWriter {
    pub fn new(store: Arc<dyn DocumentStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Write `record` under its full identity, returning the document id.
    ///
    /// Writing the same record again overwrites it in place.
    pub async fn upsert(&self, record: &AccountingRecord) -> Result<String> {
        let collection = record.collection(&self.prefix);
        let id = record.record_id();
        let document = serde_json::to_value(record)
            .map_err(|e| AccountingError::serialization(format!("record {}", id), e))?;

        self.store.put(&collection, &id, &document).await?;
        debug!(collection = %collection, id = %id, instance = record.instance, "Record written");
        Ok(id)
    }
}
