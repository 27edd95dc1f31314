pub mod fetcher;
pub mod parser;
pub mod robots;
pub mod seen;

pub use fetcher::RateLimitedFetcher;
pub use parser::Parser;
pub use robots::RobotsChecker;
pub use seen::SeenSet;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use url::Url;
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::bus::{publish_json, Bus};
use crate::config::CrawlerConfig;
use crate::models::{CrawlTask, EventKind, IndexTask, JobSubmissionEnvelope, LinkBatchPayload, ProgressEvent};

/// What the caller should do with the original `crawl-task` delivery once
/// `CrawlEngine::process_task` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Ack,
    Nack,
}

/// Ties together the fetcher, robots cache, seen-set, blob store, and bus
/// to implement the per-task procedure of spec §4.2.
pub struct CrawlEngine {
    fetcher: RateLimitedFetcher,
    robots_cache: RwLock<HashMap<String, Arc<RobotsChecker>>>,
    seen: Mutex<SeenSet>,
    blob: Arc<dyn BlobStore>,
    bus: Arc<dyn Bus>,
    config: CrawlerConfig,
}

impl CrawlEngine {
    pub fn new(blob: Arc<dyn BlobStore>, bus: Arc<dyn Bus>, config: CrawlerConfig) -> Self {
        let fetcher = RateLimitedFetcher::new(1, config.fetch_timeout.as_secs(), &config.user_agent);
        Self {
            fetcher,
            robots_cache: RwLock::new(HashMap::new()),
            seen: Mutex::new(SeenSet::new()),
            blob,
            bus,
            config,
        }
    }

    async fn robots_for_host(&self, host: &str) -> Arc<RobotsChecker> {
        {
            let cache = self.robots_cache.read().await;
            if let Some(checker) = cache.get(host) {
                return checker.clone();
            }
        }

        let checker = Arc::new(RobotsChecker::fetch(host).await);
        let mut cache = self.robots_cache.write().await;
        cache.entry(host.to_string()).or_insert_with(|| checker.clone());
        checker
    }

    async fn emit_progress(&self, event: ProgressEvent) {
        if let Err(err) = publish_json(self.bus.as_ref(), &self.config.progress_event_topic, &event).await {
            tracing::warn!(error = %err, "failed to publish progress event");
        }
    }

    /// Run the full per-`crawl-task` procedure. Never panics on remote
    /// failure; every error path is mapped to an ack/nack decision per the
    /// error table in spec §7.
    pub async fn process_task(&self, task: &CrawlTask) -> TaskOutcome {
        // Step 1: validate.
        let Ok(parsed_url) = Url::parse(&task.url) else {
            tracing::warn!(url = %task.url, "malformed url, dropping");
            return TaskOutcome::Ack;
        };
        if parsed_url.scheme() != "http" && parsed_url.scheme() != "https" {
            tracing::warn!(url = %task.url, "unsupported scheme, dropping");
            return TaskOutcome::Ack;
        }

        // Step 2: normalise + seen-set check.
        let Some(normalized) = seen::normalize_url(&task.url) else {
            return TaskOutcome::Ack;
        };
        {
            let mut seen = self.seen.lock().await;
            if !seen.insert(normalized.clone()) {
                return TaskOutcome::Ack;
            }
        }

        // Step 3: politeness delay.
        tokio::time::sleep(self.config.politeness_delay).await;

        // Step 4: robots check.
        let Some(host) = parsed_url.host_str().map(str::to_lowercase) else {
            return TaskOutcome::Ack;
        };
        let robots = self.robots_for_host(&host).await;
        if !robots.is_allowed(&task.url, &self.config.user_agent) {
            self.emit_progress(ProgressEvent::new(
                "crawler",
                EventKind::UrlSkipped,
                Some(task.task_id.clone()),
                Some(task.url.clone()),
                json_map(&[("reason", json!("robots_txt"))]),
            ))
            .await;
            return TaskOutcome::Ack;
        }

        // Step 5: fetch.
        let fetch_result = match self.fetcher.fetch(&task.url).await {
            Ok(result) => result,
            Err(fetcher::FetchError::RequestFailed(e)) if e.is_timeout() => {
                tracing::warn!(url = %task.url, "fetch timed out, nacking for redelivery");
                return TaskOutcome::Nack;
            }
            Err(e) => {
                tracing::warn!(url = %task.url, error = %e, "fetch failed permanently");
                return TaskOutcome::Ack;
            }
        };

        if !(200..300).contains(&fetch_result.status_code) {
            tracing::warn!(url = %task.url, status = fetch_result.status_code, "non-2xx response, dropping");
            return TaskOutcome::Ack;
        }

        // Step 6: content-type gate.
        let content_type = fetch_result
            .headers
            .get("content-type")
            .cloned()
            .unwrap_or_default();
        if !content_type.to_lowercase().contains("html") {
            return TaskOutcome::Ack;
        }

        // Step 7: persist raw + processed artifacts.
        let content_id = Uuid::new_v4().to_string();
        let raw_key = format!("raw_html/{content_id}.html");
        if let Err(err) = self.blob.put_text(&raw_key, &fetch_result.body, "text/html").await {
            tracing::warn!(error = %err, "failed to write raw html");
            return TaskOutcome::Nack;
        }

        let parsed_page = Parser::parse(&fetch_result.body, &fetch_result.final_url);
        let processed_key = format!("processed_text/{content_id}.txt");
        if let Err(err) = self.blob.put_text(&processed_key, &parsed_page.text, "text/plain").await {
            tracing::warn!(error = %err, "failed to write processed text");
            return TaskOutcome::Nack;
        }

        // Step 8: publish index-task.
        let index_task = IndexTask {
            source_task_id: task.task_id.clone(),
            content_id: content_id.clone(),
            original_url: task.url.clone(),
            final_url: fetch_result.final_url.clone(),
            gcs_processed_path: format!("gs://{}/{}", self.config.blob.bucket, processed_key),
            crawled_timestamp: Utc::now(),
        };
        if let Err(err) = publish_json(self.bus.as_ref(), &self.config.index_task_topic, &index_task).await {
            tracing::warn!(error = %err, "failed to publish index-task");
            return TaskOutcome::Nack;
        }

        // Step 9: progress event.
        self.emit_progress(ProgressEvent::new(
            "crawler",
            EventKind::UrlCrawled,
            Some(task.task_id.clone()),
            Some(task.url.clone()),
            serde_json::Map::new(),
        ))
        .await;

        // Step 10: discover + forward new URLs.
        if task.depth < task.depth_limit {
            let next_depth = task.depth + 1;
            let mut discovered = Vec::new();
            let mut seen = self.seen.lock().await;
            for link in &parsed_page.links {
                let Ok(link_url) = Url::parse(link) else { continue };
                if link_url.scheme() != "http" && link_url.scheme() != "https" {
                    continue;
                }
                let Some(link_host) = link_url.host_str() else { continue };
                if let Some(restriction) = &task.domain_restriction {
                    if !link_host.contains(restriction.as_str()) {
                        continue;
                    }
                }
                let Some(normalized_link) = seen::normalize_url(link) else { continue };
                if seen.insert(normalized_link.clone()) {
                    discovered.push(normalized_link);
                }
            }
            drop(seen);

            if !discovered.is_empty() {
                let count = discovered.len();
                if let Err(err) = self.publish_link_batch(task, discovered, next_depth).await {
                    tracing::warn!(error = %err, "failed to hand off link batch to master");
                    return TaskOutcome::Nack;
                }
                self.emit_progress(ProgressEvent::new(
                    "crawler",
                    EventKind::NewUrlsFound,
                    Some(task.task_id.clone()),
                    None,
                    json_map(&[("count", json!(count))]),
                ))
                .await;
            }
        }

        // Step 11: ack.
        TaskOutcome::Ack
    }

    /// Persist a link batch to the blob store and announce it to Master on
    /// `job-submission`, reusing the originating task id verbatim (spec §3,
    /// §9 "Cross-process identity preservation").
    async fn publish_link_batch(
        &self,
        task: &CrawlTask,
        urls: Vec<String>,
        next_depth: u32,
    ) -> Result<(), LinkBatchError> {
        let batch_id = Uuid::new_v4();
        let batch_ts = Utc::now().format("%Y%m%dT%H%M%S");
        let batch_key = format!("new_tasks/{batch_id}_{batch_ts}.json");

        let payload = LinkBatchPayload {
            urls: urls.clone(),
            depth: next_depth,
            domain_restriction: task.domain_restriction.clone(),
            depth_limit: task.depth_limit,
        };
        let body = serde_json::to_string(&payload).unwrap_or_default();
        self.blob.put_text(&batch_key, &body, "application/json").await?;

        let envelope = JobSubmissionEnvelope {
            task_id: task.task_id.clone(),
            gcs_path: format!("gs://{}/{batch_key}", self.config.blob.bucket),
            is_continuation: true,
            url_count: Some(urls.len()),
        };
        publish_json(self.bus.as_ref(), &self.config.job_submission_topic, &envelope).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
enum LinkBatchError {
    #[error("blob write failed: {0}")]
    Blob(#[from] crate::blob::BlobError),
    #[error("bus publish failed: {0}")]
    Bus(#[from] crate::bus::BusError),
}

fn json_map(pairs: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}
