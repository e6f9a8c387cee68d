//! Elasticsearch-compatible REST adapter
//!
//! Writes use `refresh=true` so a document is searchable as soon as the call
//! returns; the replay pass reads back state it wrote moments earlier.

use super::{async_trait, DocumentStore, Query, StoredDocument};
use crate::error::StoreError;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Error types Elasticsearch reports while an index is still being created
const TRANSIENT_ERROR_TYPES: &[&str] = &[
    "index_not_found_exception",
    "no_shard_available_action_exception",
    "unavailable_shards_exception",
    "cluster_block_exception",
];

/// Connection settings for the document store
#[derive(Debug, Clone)]
pub struct ElasticConfig {
    /// Base URL, e.g. `http://localhost:9200`
    pub url: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Document store backed by an Elasticsearch cluster
pub struct ElasticStore {
    client: Client,
    base_url: Url,
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    #[serde(default)]
    found: bool,
    #[serde(rename = "_source")]
    source: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_index")]
    index: String,
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source")]
    source: Value,
}

impl ElasticStore {
    /// Create a new store client
    pub fn new(config: &ElasticConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StoreError::InvalidRequest(format!("failed to create HTTP client: {}", e)))?;

        let base_url = Url::parse(&config.url)
            .map_err(|e| StoreError::InvalidRequest(format!("invalid store URL {}: {}", config.url, e)))?;

        Ok(Self { client, base_url })
    }

    /// Build an endpoint URL from raw path segments, percent-encoding each
    fn endpoint(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::InvalidRequest(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, StoreError> {
        request.send().await.map_err(|e| {
            // Connection resets, timeouts and DNS hiccups are all worth a retry
            StoreError::Transient(format!("request failed: {}", e))
        })
    }

    async fn error_from(response: Response) -> StoreError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        classify_failure(status, body)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        debug!(method = %method, url = %url, "Store request");
        self.client.request(method, url)
    }
}

/// Decide whether a failed response is worth retrying
fn classify_failure(status: StatusCode, body: String) -> StoreError {
    let transient_status = matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    );

    if transient_status || TRANSIENT_ERROR_TYPES.iter().any(|t| body.contains(t)) {
        StoreError::Transient(format!("HTTP {}: {}", status.as_u16(), body))
    } else {
        StoreError::Status {
            status: status.as_u16(),
            body,
        }
    }
}

/// Translate a [`Query`] into a search request body
fn search_body(query: &Query) -> Value {
    let filters: Vec<Value> = query
        .filters
        .iter()
        .map(|(field, value)| match value {
            // Dynamically mapped strings are analyzed text, match on the keyword sub-field
            Value::String(_) => json!({ "term": { format!("{}.keyword", field): value } }),
            _ => json!({ "term": { field.as_str(): value } }),
        })
        .collect();

    let mut body = Map::new();
    body.insert("size".to_string(), json!(query.limit));
    body.insert(
        "query".to_string(),
        json!({ "bool": { "filter": filters } }),
    );
    if let Some((field, order)) = &query.sort {
        body.insert(
            "sort".to_string(),
            json!([{ field.as_str(): { "order": order.as_str() } }]),
        );
    }
    Value::Object(body)
}

#[async_trait]
impl DocumentStore for ElasticStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let url = self.endpoint(&[collection, "_doc", id])?;
        let response = self.send(self.request(Method::GET, url)).await?;

        if response.status() == StatusCode::NOT_FOUND {
            // Either the document or the whole index is missing
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let body: GetResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(if body.found { body.source } else { None })
    }

    async fn put(&self, collection: &str, id: &str, document: &Value) -> Result<(), StoreError> {
        let mut url = self.endpoint(&[collection, "_doc", id])?;
        url.query_pairs_mut().append_pair("refresh", "true");

        let response = self
            .send(self.request(Method::PUT, url).json(document))
            .await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Vec<StoredDocument>, StoreError> {
        let mut url = self.endpoint(&[query.collection_pattern.as_str(), "_search"])?;
        url.query_pairs_mut()
            .append_pair("ignore_unavailable", "true")
            .append_pair("allow_no_indices", "true");

        let response = self
            .send(self.request(Method::POST, url).json(&search_body(query)))
            .await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(body
            .hits
            .hits
            .into_iter()
            .map(|hit| StoredDocument {
                collection: hit.index,
                id: hit.id,
                source: hit.source,
            })
            .collect())
    }

    async fn exists(&self, collection: &str) -> Result<bool, StoreError> {
        let url = self.endpoint(&[collection])?;
        let response = self.send(self.request(Method::HEAD, url)).await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            _ => Err(Self::error_from(response).await),
        }
    }
}
