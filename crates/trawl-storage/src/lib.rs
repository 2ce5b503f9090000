//! Document store contract, Elasticsearch store, and shared HTTP fetch utilities.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CACHE_CONTROL, PRAGMA};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, debug_span, trace, Instrument};

pub const CRATE_NAME: &str = "trawl-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .default_headers(headers)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// GET `url` and return the body; any non-2xx status is an error.
    pub async fn fetch_text(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = debug_span!("http_fetch", url);
        async move {
            let started = Instant::now();
            debug!("calling {url}");
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.text().await?;
            trace!(elapsed_ms = started.elapsed().as_millis() as u64, "<- {body}");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document store unavailable: {context}")]
    Unavailable {
        context: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("document store rejected {method} {path}: http status {status}: {detail}")]
    Rejected {
        method: &'static str,
        path: String,
        status: u16,
        detail: String,
    },
    #[error("malformed document at {path}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// JSON document store keyed by collection and document id.
///
/// `get_raw`/`put_raw` address store-relative paths and are only used for
/// collection setup (mappings, metadata checks).
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn exists(&self, collection: &str, id: &str) -> Result<bool, StoreError>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<JsonValue>, StoreError>;

    async fn put(&self, collection: &str, id: &str, document: &JsonValue) -> Result<(), StoreError>;

    async fn get_raw(&self, path: &str) -> Result<String, StoreError>;

    async fn put_raw(&self, path: &str, body: &JsonValue) -> Result<(), StoreError>;
}

/// Elasticsearch over its REST API. Collections are indices, documents live at
/// `/{index}/_doc/{id}`.
#[derive(Debug, Clone)]
pub struct ElasticStore {
    base_url: String,
    http: HttpFetcher,
}

impl ElasticStore {
    pub fn new(base_url: impl Into<String>, config: &HttpClientConfig) -> anyhow::Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = HttpFetcher::new(config).context("building elasticsearch client")?;
        Ok(Self { base_url, http })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn doc_path(collection: &str, id: &str) -> String {
        format!("/{collection}/_doc/{id}")
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn put_json(&self, path: &str, body: &JsonValue) -> Result<(), StoreError> {
        let url = self.url_for(path);
        let resp = self
            .http
            .client()
            .put(&url)
            .json(body)
            .send()
            .await
            .map_err(|source| StoreError::Unavailable {
                context: format!("PUT {path}"),
                source,
            })?;

        let status = resp.status();
        if status == StatusCode::OK || status == StatusCode::CREATED {
            return Ok(());
        }
        let detail = resp.text().await.unwrap_or_default();
        Err(StoreError::Rejected {
            method: "PUT",
            path: path.to_string(),
            status: status.as_u16(),
            detail,
        })
    }

    async fn get_response(&self, path: &str) -> Result<reqwest::Response, StoreError> {
        self.http
            .client()
            .get(self.url_for(path))
            .send()
            .await
            .map_err(|source| StoreError::Unavailable {
                context: format!("GET {path}"),
                source,
            })
    }
}

#[async_trait]
impl DocumentStore for ElasticStore {
    async fn exists(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let path = Self::doc_path(collection, id);
        let resp = self
            .http
            .client()
            .head(self.url_for(&path))
            .send()
            .await
            .map_err(|source| StoreError::Unavailable {
                context: format!("HEAD {path}"),
                source,
            })?;
        Ok(resp.status() == StatusCode::OK)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<JsonValue>, StoreError> {
        let path = Self::doc_path(collection, id);
        let resp = self.get_response(&path).await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = resp.text().await.map_err(|source| StoreError::Unavailable {
            context: format!("reading GET {path}"),
            source,
        })?;
        if status != StatusCode::OK {
            return Err(StoreError::Rejected {
                method: "GET",
                path,
                status: status.as_u16(),
                detail: body,
            });
        }

        let mut envelope: JsonValue =
            serde_json::from_str(&body).map_err(|source| StoreError::Malformed {
                path: path.clone(),
                source,
            })?;
        Ok(envelope.get_mut("_source").map(JsonValue::take))
    }

    async fn put(&self, collection: &str, id: &str, document: &JsonValue) -> Result<(), StoreError> {
        self.put_json(&Self::doc_path(collection, id), document).await
    }

    async fn get_raw(&self, path: &str) -> Result<String, StoreError> {
        let resp = self.get_response(path).await?;
        let status = resp.status();
        let body = resp.text().await.map_err(|source| StoreError::Unavailable {
            context: format!("reading GET {path}"),
            source,
        })?;
        if status != StatusCode::OK {
            return Err(StoreError::Rejected {
                method: "GET",
                path: path.to_string(),
                status: status.as_u16(),
                detail: body,
            });
        }
        Ok(body)
    }

    async fn put_raw(&self, path: &str, body: &JsonValue) -> Result<(), StoreError> {
        self.put_json(path, body).await
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    documents: BTreeMap<(String, String), JsonValue>,
    raw: BTreeMap<String, JsonValue>,
    writes: usize,
}

/// In-process store for dry runs and tests. A body put at `/{index}` is also
/// readable at `/{index}/_mapping`, mirroring index creation.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    state: Mutex<MemoryState>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn document(&self, collection: &str, id: &str) -> Option<JsonValue> {
        let state = self.state.lock().await;
        state
            .documents
            .get(&(collection.to_string(), id.to_string()))
            .cloned()
    }

    pub async fn count(&self, collection: &str) -> usize {
        let state = self.state.lock().await;
        state
            .documents
            .keys()
            .filter(|(c, _)| c == collection)
            .count()
    }

    /// Number of successful document puts since creation.
    pub async fn writes(&self) -> usize {
        self.state.lock().await.writes
    }

    pub async fn raw_paths(&self) -> Vec<String> {
        self.state.lock().await.raw.keys().cloned().collect()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn exists(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        Ok(self.document(collection, id).await.is_some())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<JsonValue>, StoreError> {
        Ok(self.document(collection, id).await)
    }

    async fn put(&self, collection: &str, id: &str, document: &JsonValue) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .documents
            .insert((collection.to_string(), id.to_string()), document.clone());
        state.writes += 1;
        Ok(())
    }

    async fn get_raw(&self, path: &str) -> Result<String, StoreError> {
        let state = self.state.lock().await;
        let found = state
            .raw
            .get(path)
            .or_else(|| path.strip_suffix("/_mapping").and_then(|p| state.raw.get(p)));
        match found {
            Some(body) => Ok(body.to_string()),
            None => Err(StoreError::Rejected {
                method: "GET",
                path: path.to_string(),
                status: StatusCode::NOT_FOUND.as_u16(),
                detail: String::new(),
            }),
        }
    }

    async fn put_raw(&self, path: &str, body: &JsonValue) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.raw.insert(path.to_string(), body.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn elastic_paths_are_joined_without_double_slashes() {
        let store = ElasticStore::new("http://localhost:9200/", &HttpClientConfig::default())
            .expect("store");
        assert_eq!(store.base_url(), "http://localhost:9200");
        assert_eq!(
            store.url_for(&ElasticStore::doc_path("metadataindex", "angry-purple-tiger")),
            "http://localhost:9200/metadataindex/_doc/angry-purple-tiger"
        );
        assert_eq!(
            store.url_for("/angry-purple-tiger/_mapping"),
            "http://localhost:9200/angry-purple-tiger/_mapping"
        );
    }

    #[tokio::test]
    async fn memory_store_tracks_documents_and_writes() {
        let store = MemoryDocumentStore::new();
        assert!(!store.exists("hotspot", "h1").await.expect("exists"));

        store.put("hotspot", "h1", &json!({ "a": 1 })).await.expect("put");
        store.put("hotspot", "h1", &json!({ "a": 2 })).await.expect("put");
        store.put("other", "h1", &json!({})).await.expect("put");

        assert!(store.exists("hotspot", "h1").await.expect("exists"));
        assert_eq!(store.get("hotspot", "h1").await.expect("get"), Some(json!({ "a": 2 })));
        assert_eq!(store.get("hotspot", "missing").await.expect("get"), None);
        assert_eq!(store.count("hotspot").await, 1);
        assert_eq!(store.writes().await, 3);
    }

    #[tokio::test]
    async fn memory_store_serves_index_bodies_as_mappings() {
        let store = MemoryDocumentStore::new();
        assert!(store.get_raw("/hotspot/_mapping").await.is_err());

        store
            .put_raw("/hotspot", &json!({ "mappings": {} }))
            .await
            .expect("put_raw");

        let body = store.get_raw("/hotspot/_mapping").await.expect("mapping");
        assert!(body.contains("mappings"));
        assert_eq!(store.raw_paths().await, vec!["/hotspot".to_string()]);
    }
}
