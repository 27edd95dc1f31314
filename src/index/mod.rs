use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("request to index service failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("index service returned an unexpected result: {0}")]
    UnexpectedResult(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertResult {
    Created,
    Updated,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub url: String,
    pub snippet: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScanPage {
    pub total: u64,
    pub urls: Vec<String>,
}

/// Contract fixed by spec §2: a document index supporting upsert-by-id,
/// multi-field match queries with snippet highlighting, and paginated
/// scans. The Indexer component only exercises `upsert`; `search`/`scan`
/// round out the adapter's fidelity to the fixed external contract (the
/// HTTP routes that would expose them to users are the named out-of-scope
/// query endpoints, not something this repo serves).
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn ensure_index(&self) -> Result<(), IndexError>;
    async fn upsert(&self, url: &str, content: &str) -> Result<UpsertResult, IndexError>;
    async fn search(&self, query: &str, size: u32) -> Result<Vec<SearchHit>, IndexError>;
    async fn scan(&self, page: u32, size: u32) -> Result<ScanPage, IndexError>;
}

/// Elasticsearch client built directly on `reqwest`'s JSON support, since
/// no example in this retrieval pack pulls in a dedicated Elasticsearch
/// crate — the teacher already depends on `reqwest` for HTTP, so this
/// keeps the same client for the same concern (HTTP + JSON in, JSON out).
pub struct EsIndexClient {
    http: reqwest::Client,
    base_url: String,
    index_name: String,
}

impl EsIndexClient {
    /// `host`/`port` are kept as distinct fields per the indexer's wire
    /// contract decision in SPEC_FULL.md §6 (the port is always included).
    pub fn new(host: &str, port: u16, index_name: &str, username: Option<&str>, password: Option<&str>) -> Self {
        let base_url = match (username, password) {
            (Some(u), Some(p)) => format!("http://{u}:{p}@{host}:{port}"),
            _ => format!("http://{host}:{port}"),
        };

        Self {
            http: reqwest::Client::new(),
            base_url,
            index_name: index_name.to_string(),
        }
    }

    fn doc_url(&self, url: &str) -> String {
        format!(
            "{}/{}/_doc/{}",
            self.base_url,
            self.index_name,
            urlencoding_minimal(url)
        )
    }
}

/// Minimal percent-encoding for document ids used as URL path segments.
/// Elasticsearch ids are opaque bytes; we only need to make raw URLs with
/// `/`, `:`, `?` safe to embed in a request path.
fn urlencoding_minimal(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char);
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[derive(Deserialize)]
struct EsIndexResponse {
    result: String,
}

#[async_trait]
impl SearchIndex for EsIndexClient {
    /// Create the index with `url: keyword` / `content: text (standard
    /// analyzer)` if it doesn't already exist (spec §4.3 "Index mapping
    /// contract"). Idempotent: a 400 "resource_already_exists_exception"
    /// is treated as success.
    async fn ensure_index(&self) -> Result<(), IndexError> {
        let url = format!("{}/{}", self.base_url, self.index_name);
        let mapping = json!({
            "mappings": {
                "properties": {
                    "url": { "type": "keyword" },
                    "content": { "type": "text", "analyzer": "standard" }
                }
            }
        });

        let resp = self.http.put(&url).json(&mapping).send().await?;
        if resp.status().is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        if body.contains("resource_already_exists_exception") {
            return Ok(());
        }
        Err(IndexError::UnexpectedResult(body))
    }

    async fn upsert(&self, url: &str, content: &str) -> Result<UpsertResult, IndexError> {
        let doc = json!({ "url": url, "content": content });
        let resp = self
            .http
            .put(self.doc_url(url))
            .json(&doc)
            .send()
            .await?
            .error_for_status()?;

        let parsed: EsIndexResponse = resp.json().await?;
        match parsed.result.as_str() {
            "created" => Ok(UpsertResult::Created),
            "updated" => Ok(UpsertResult::Updated),
            other => Err(IndexError::UnexpectedResult(other.to_string())),
        }
    }

    async fn search(&self, query: &str, size: u32) -> Result<Vec<SearchHit>, IndexError> {
        let url = format!("{}/{}/_search", self.base_url, self.index_name);
        let body = json!({
            "query": {
                "multi_match": { "query": query, "fields": ["content", "url"] }
            },
            "highlight": { "fields": { "content": {} } },
            "size": size
        });

        let resp: serde_json::Value = self.http.post(&url).json(&body).send().await?.json().await?;
        let hits = resp["hits"]["hits"].as_array().cloned().unwrap_or_default();
        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                let url = hit["_source"]["url"].as_str()?.to_string();
                let snippet = hit["highlight"]["content"]
                    .as_array()
                    .map(|frags| {
                        frags
                            .iter()
                            .filter_map(|f| f.as_str())
                            .collect::<Vec<_>>()
                            .join("...")
                    });
                Some(SearchHit { url, snippet })
            })
            .collect())
    }

    async fn scan(&self, page: u32, size: u32) -> Result<ScanPage, IndexError> {
        let url = format!("{}/{}/_search", self.base_url, self.index_name);
        let from = page.saturating_sub(1).saturating_mul(size);
        let body = json!({
            "query": { "match_all": {} },
            "from": from,
            "size": size,
            "sort": [{ "url.keyword": { "order": "asc" } }]
        });

        let resp: serde_json::Value = self.http.post(&url).json(&body).send().await?.json().await?;
        let total = resp["hits"]["total"]["value"].as_u64().unwrap_or(0);
        let urls = resp["hits"]["hits"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|hit| hit["_source"]["url"].as_str().map(str::to_string))
            .collect();

        Ok(ScanPage { total, urls })
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod testutil {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    /// In-memory fake search index: upsert is by URL, exactly like the
    /// real contract, so re-delivering the same `index-task` is observably
    /// idempotent (spec §8 "Indexer writes are idempotent by URL").
    #[derive(Default)]
    pub struct InMemoryIndex {
        docs: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl SearchIndex for InMemoryIndex {
        async fn ensure_index(&self) -> Result<(), IndexError> {
            Ok(())
        }

        async fn upsert(&self, url: &str, content: &str) -> Result<UpsertResult, IndexError> {
            let mut docs = self.docs.lock().await;
            let result = if docs.contains_key(url) {
                UpsertResult::Updated
            } else {
                UpsertResult::Created
            };
            docs.insert(url.to_string(), content.to_string());
            Ok(result)
        }

        async fn search(&self, query: &str, size: u32) -> Result<Vec<SearchHit>, IndexError> {
            let docs = self.docs.lock().await;
            Ok(docs
                .iter()
                .filter(|(url, content)| url.contains(query) || content.contains(query))
                .take(size as usize)
                .map(|(url, _)| SearchHit { url: url.clone(), snippet: None })
                .collect())
        }

        async fn scan(&self, page: u32, size: u32) -> Result<ScanPage, IndexError> {
            let docs = self.docs.lock().await;
            let mut urls: Vec<String> = docs.keys().cloned().collect();
            urls.sort();
            let total = urls.len() as u64;
            let start = (page.saturating_sub(1) as usize) * size as usize;
            let page_urls = urls.into_iter().skip(start).take(size as usize).collect();
            Ok(ScanPage { total, urls: page_urls })
        }
    }

    impl InMemoryIndex {
        pub async fn get(&self, url: &str) -> Option<String> {
            self.docs.lock().await.get(url).cloned()
        }

        pub async fn len(&self) -> usize {
            self.docs.lock().await.len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::InMemoryIndex;
    use super::*;

    #[tokio::test]
    async fn upsert_by_url_is_idempotent() {
        let index = InMemoryIndex::default();
        let first = index.upsert("https://a.test/", "hello").await.unwrap();
        assert_eq!(first, UpsertResult::Created);

        let second = index.upsert("https://a.test/", "hello again").await.unwrap();
        assert_eq!(second, UpsertResult::Updated);

        assert_eq!(index.len().await, 1);
        assert_eq!(index.get("https://a.test/").await.as_deref(), Some("hello again"));
    }

    #[test]
    fn minimal_encoding_escapes_reserved_bytes() {
        assert_eq!(urlencoding_minimal("https://a.test/p?q=1"), "https%3A%2F%2Fa.test%2Fp%3Fq%3D1");
    }
}
