//! In-process document store
//!
//! Backs dry runs and tests. Collections are created on first write, and
//! query results are deterministic: collections are scanned in name order,
//! documents in id order, and sorting is stable.

use super::{async_trait, compare_values, pattern_matches, DocumentStore, Query, SortOrder, StoredDocument};
use crate::error::StoreError;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;

/// Document store held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: DashMap<String, BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in a collection
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .get(collection)
            .map(|docs| docs.len())
            .unwrap_or(0)
    }

    /// Names of every collection, sorted
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.iter().map(|c| c.key().clone()).collect();
        names.sort();
        names
    }

    /// Serialized form of a stored document, for byte-level comparisons
    pub fn raw(&self, collection: &str, id: &str) -> Option<String> {
        self.collections
            .get(collection)
            .and_then(|docs| docs.get(id).map(|doc| doc.to_string()))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id).cloned()))
    }

    async fn put(&self, collection: &str, id: &str, document: &Value) -> Result<(), StoreError> {
        if collection.is_empty() || id.is_empty() {
            return Err(StoreError::InvalidRequest(
                "collection and id must be non-empty".to_string(),
            ));
        }

        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), document.clone());
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Vec<StoredDocument>, StoreError> {
        let mut names: Vec<String> = self
            .collections
            .iter()
            .filter(|c| pattern_matches(&query.collection_pattern, c.key()))
            .map(|c| c.key().clone())
            .collect();
        names.sort();

        let mut hits = Vec::new();
        for name in names {
            let Some(docs) = self.collections.get(&name) else {
                continue;
            };
            for (id, source) in docs.iter() {
                let matched = query
                    .filters
                    .iter()
                    .all(|(field, value)| source.get(field) == Some(value));
                if matched {
                    hits.push(StoredDocument {
                        collection: name.clone(),
                        id: id.clone(),
                        source: source.clone(),
                    });
                }
            }
        }

        if let Some((field, order)) = &query.sort {
            hits.sort_by(|a, b| {
                let ord = compare_values(a.source.get(field), b.source.get(field));
                match order {
                    SortOrder::Ascending => ord,
                    SortOrder::Descending => ord.reverse(),
                }
            });
        }

        hits.truncate(query.limit);
        Ok(hits)
    }

    async fn exists(&self, collection: &str) -> Result<bool, StoreError> {
        Ok(self.collections.contains_key(collection))
    }
}
