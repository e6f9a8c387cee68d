//! Document store adapters
//!
//! The engine persists lifecycle state, the log checkpoint and accounting
//! records as JSON documents in named collections. Collections are
//! time-bucketed (monthly lifecycle documents, daily record indices), so
//! lookups go through pattern queries rather than single-key reads.

mod elastic;
mod memory;
mod retry;

pub use elastic::{ElasticConfig, ElasticStore};
pub use memory::MemoryStore;
pub use retry::{wait_for_collection, RetryPolicy, RetryingStore};

use crate::error::{AccountingError, StoreError};
use serde_json::Value;
use std::cmp::Ordering;

pub use async_trait::async_trait;

/// Sort direction for range queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Ascending => "asc",
            SortOrder::Descending => "desc",
        }
    }
}

/// Filtered, sorted scan across every collection matching a pattern
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Collection name, `*` matches any run of characters
    pub collection_pattern: String,
    /// Exact-match filters, all of which must hold
    pub filters: Vec<(String, Value)>,
    pub sort: Option<(String, SortOrder)>,
    pub limit: usize,
}

impl Query {
    pub fn new(collection_pattern: impl Into<String>) -> Self {
        Self {
            collection_pattern: collection_pattern.into(),
            filters: Vec::new(),
            sort: None,
            limit: 10,
        }
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort = Some((field.into(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// A document returned by a query, with the location it was read from
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub collection: String,
    pub id: String,
    pub source: Value,
}

/// Key-value document store used for all durable engine state
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document by id, `None` when it does not exist
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError>;

    /// Create or overwrite a document
    async fn put(&self, collection: &str, id: &str, document: &Value) -> Result<(), StoreError>;

    /// Run a filtered, sorted query across matching collections
    async fn query(&self, query: &Query) -> Result<Vec<StoredDocument>, StoreError>;

    /// Whether a collection exists and can be queried
    async fn exists(&self, collection: &str) -> Result<bool, StoreError>;
}

/// Newest document of a sorted lookup whose sort key must be unique.
///
/// Fetches the top two hits; when both carry the same sort value but are
/// different documents the lookup is ambiguous and the pass must stop.
pub async fn find_newest(
    store: &dyn DocumentStore,
    query: &Query,
) -> Result<Option<StoredDocument>, AccountingError> {
    let query = query.clone().limit(query.limit.max(2));
    let hits = store.query(&query).await?;

    if let (Some((field, _)), [first, second, ..]) = (&query.sort, hits.as_slice()) {
        let newest = first.source.get(field);
        let same_key = newest == second.source.get(field);
        let same_doc = first.collection == second.collection && first.id == second.id;
        if same_key && !same_doc {
            return Err(AccountingError::Ambiguous {
                collection: query.collection_pattern.clone(),
                key: describe_filters(&query),
                matches: hits.iter().filter(|h| h.source.get(field) == newest).count(),
            });
        }
    }

    Ok(hits.into_iter().next())
}

fn describe_filters(query: &Query) -> String {
    query
        .filters
        .iter()
        .map(|(field, value)| match value {
            Value::String(s) => format!("{}={}", field, s),
            other => format!("{}={}", field, other),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Match a collection name against a pattern where `*` is a wildcard
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or_default();
    let Some(mut rest) = name.strip_prefix(first) else {
        return false;
    };

    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        // No wildcard at all
        return rest.is_empty();
    };

    for part in middle {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }

    rest.len() >= last.len() && rest.ends_with(last)
}

/// Ordering of JSON values used for sorting documents.
///
/// Missing values sort before everything else; numbers compare numerically
/// and strings lexically, which is correct for the fixed timestamp format.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => match (x.as_u64(), y.as_u64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .unwrap_or_default()
                .partial_cmp(&y.as_f64().unwrap_or_default())
                .unwrap_or(Ordering::Equal),
        },
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}
