use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::blob::{relative_key, BlobStore};
use crate::bus::{publish_json, Bus};
use crate::config::MasterConfig;
use crate::models::{CrawlTask, EventKind, JobSubmissionEnvelope, ProgressEvent};

const SEED_PACING_DELAY: Duration = Duration::from_millis(50);
const CONTINUATION_PACING_DELAY: Duration = Duration::from_millis(10);

/// What the caller should do with the `job-submission` delivery once
/// `MasterEngine::handle_envelope` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeOutcome {
    Ack,
    Nack,
}

#[derive(Deserialize)]
struct SeedJobBody {
    seed_urls: Vec<String>,
    depth: u32,
    #[serde(default)]
    domain_restriction: Option<String>,
}

#[derive(Deserialize)]
struct LinkBatchBody {
    urls: Vec<String>,
    depth: u32,
    #[serde(default)]
    domain_restriction: Option<String>,
    depth_limit: u32,
}

enum JobPayload {
    Seed(SeedJobBody),
    LinkBatch(LinkBatchBody),
}

/// Expands `job-submission` envelopes into per-URL `crawl-task` messages,
/// preserving task-id identity across continuations (spec §4.1, §9).
pub struct MasterEngine {
    blob: Arc<dyn BlobStore>,
    bus: Arc<dyn Bus>,
    config: MasterConfig,
}

impl MasterEngine {
    pub fn new(blob: Arc<dyn BlobStore>, bus: Arc<dyn Bus>, config: MasterConfig) -> Self {
        Self { blob, bus, config }
    }

    /// Parse `gcs_path` into a bucket-relative key and try both payload
    /// shapes, preferring the one the envelope's `is_continuation` flag
    /// suggests but falling back to the other on shape mismatch (spec §4.1
    /// "Master also infers by payload shape").
    fn parse_payload(envelope: &JobSubmissionEnvelope, body: &str) -> Option<JobPayload> {
        let value: serde_json::Value = serde_json::from_str(body).ok()?;

        let try_seed = || serde_json::from_value::<SeedJobBody>(value.clone()).ok().map(JobPayload::Seed);
        let try_batch = || serde_json::from_value::<LinkBatchBody>(value.clone()).ok().map(JobPayload::LinkBatch);

        if envelope.is_continuation {
            try_batch().or_else(try_seed)
        } else {
            try_seed().or_else(try_batch)
        }
    }

    pub async fn handle_envelope(&self, envelope: &JobSubmissionEnvelope) -> EnvelopeOutcome {
        let Some(key) = relative_key(&self.config.blob.bucket, &envelope.gcs_path) else {
            tracing::warn!(gcs_path = %envelope.gcs_path, "malformed blob path, dropping");
            return EnvelopeOutcome::Ack;
        };

        let body = match self.blob.get_text(key).await {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read job blob, nacking");
                return EnvelopeOutcome::Nack;
            }
        };

        let Some(payload) = Self::parse_payload(envelope, &body) else {
            tracing::warn!(task_id = %envelope.task_id, "malformed job payload, dropping");
            return EnvelopeOutcome::Ack;
        };

        let (urls, depth, depth_limit, domain_restriction, is_continuation) = match payload {
            JobPayload::Seed(seed) => {
                if seed.seed_urls.is_empty() {
                    tracing::warn!(task_id = %envelope.task_id, "empty seed url list, dropping");
                    return EnvelopeOutcome::Ack;
                }
                (seed.seed_urls, 0u32, seed.depth, seed.domain_restriction, false)
            }
            JobPayload::LinkBatch(batch) => {
                if batch.urls.is_empty() {
                    tracing::warn!(task_id = %envelope.task_id, "empty link batch, dropping");
                    return EnvelopeOutcome::Ack;
                }
                (batch.urls, batch.depth, batch.depth_limit, batch.domain_restriction, true)
            }
        };

        let url_count = urls.len();
        let pacing = if is_continuation { CONTINUATION_PACING_DELAY } else { SEED_PACING_DELAY };

        for url in &urls {
            let task = CrawlTask {
                task_id: envelope.task_id.clone(),
                url: url.clone(),
                depth,
                depth_limit,
                domain_restriction: domain_restriction.clone(),
                source_job_id: envelope.task_id.clone(),
                is_continuation,
            };
            if let Err(err) = publish_json(self.bus.as_ref(), &self.config.crawl_task_topic, &task).await {
                tracing::warn!(error = %err, "failed to publish crawl-task, nacking envelope");
                return EnvelopeOutcome::Nack;
            }
            tokio::time::sleep(pacing).await;
        }

        let progress_event = if is_continuation {
            ProgressEvent::new(
                "master",
                EventKind::TaskContinuation,
                Some(envelope.task_id.clone()),
                None,
                json_map(&[("job_id", json!(envelope.task_id)), ("url_count", json!(url_count))]),
            )
        } else {
            ProgressEvent::new(
                "master",
                EventKind::JobReceived,
                Some(envelope.task_id.clone()),
                None,
                json_map(&[("job_id", json!(envelope.task_id)), ("seed_urls", json!(urls))]),
            )
        };
        if let Err(err) = publish_json(self.bus.as_ref(), &self.config.progress_event_topic, &progress_event).await {
            tracing::warn!(error = %err, "failed to publish progress event");
        }

        EnvelopeOutcome::Ack
    }
}

fn json_map(pairs: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::testutil::InMemoryBlobStore;
    use crate::bus::testutil::InMemoryBus;
    use crate::config::{BlobSettings, BusSettings};

    fn test_config() -> MasterConfig {
        MasterConfig {
            project_id: "test".into(),
            job_submission_topic: "job-submission".into(),
            job_submission_group: "master".into(),
            crawl_task_topic: "crawl-task".into(),
            progress_event_topic: "progress-event".into(),
            health_event_topic: "health-event".into(),
            blob: BlobSettings {
                endpoint: "http://localhost:0".into(),
                access_key: "k".into(),
                secret_key: "s".into(),
                bucket: "test-bucket".into(),
            },
            bus: BusSettings { url: "redis://localhost:0".into(), visibility_timeout: Duration::from_secs(60) },
            default_depth_limit: 3,
            host_id: "master-test".into(),
            max_concurrent_jobs: 5,
        }
    }

    #[tokio::test]
    async fn seed_job_emits_crawl_tasks_at_depth_zero_and_job_received() {
        let blob = Arc::new(InMemoryBlobStore::default());
        let bus = Arc::new(InMemoryBus::default());
        blob.put_text(
            "crawl_tasks/job-1.json",
            r#"{"seed_urls": ["http://a.test/"], "depth": 2, "domain_restriction": null}"#,
            "application/json",
        )
        .await
        .unwrap();

        let engine = MasterEngine::new(blob.clone(), bus.clone(), test_config());
        let envelope = JobSubmissionEnvelope {
            task_id: "job-1".into(),
            gcs_path: "gs://test-bucket/crawl_tasks/job-1.json".into(),
            is_continuation: false,
            url_count: None,
        };

        let outcome = engine.handle_envelope(&envelope).await;
        assert_eq!(outcome, EnvelopeOutcome::Ack);

        let tasks: Vec<CrawlTask> = bus.decode_all("crawl-task").await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_id, "job-1");
        assert_eq!(tasks[0].depth, 0);
        assert_eq!(tasks[0].depth_limit, 2);
        assert!(!tasks[0].is_continuation);

        let events: Vec<ProgressEvent> = bus.decode_all("progress-event").await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), Some(EventKind::JobReceived));
    }

    #[tokio::test]
    async fn link_batch_reuses_task_id_and_starts_at_given_depth() {
        let blob = Arc::new(InMemoryBlobStore::default());
        let bus = Arc::new(InMemoryBus::default());
        blob.put_text(
            "new_tasks/batch-1.json",
            r#"{"urls": ["http://a.test/p1"], "depth": 1, "domain_restriction": null, "depth_limit": 3}"#,
            "application/json",
        )
        .await
        .unwrap();

        let engine = MasterEngine::new(blob.clone(), bus.clone(), test_config());
        let envelope = JobSubmissionEnvelope {
            task_id: "job-1".into(),
            gcs_path: "gs://test-bucket/new_tasks/batch-1.json".into(),
            is_continuation: true,
            url_count: Some(1),
        };

        let outcome = engine.handle_envelope(&envelope).await;
        assert_eq!(outcome, EnvelopeOutcome::Ack);

        let tasks: Vec<CrawlTask> = bus.decode_all("crawl-task").await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_id, "job-1", "continuation must reuse the originating task id");
        assert_eq!(tasks[0].depth, 1);
        assert!(tasks[0].is_continuation);

        let events: Vec<ProgressEvent> = bus.decode_all("progress-event").await;
        assert_eq!(events[0].kind(), Some(EventKind::TaskContinuation));
    }

    #[tokio::test]
    async fn empty_seed_list_is_acked_and_dropped() {
        let blob = Arc::new(InMemoryBlobStore::default());
        let bus = Arc::new(InMemoryBus::default());
        blob.put_text("crawl_tasks/job-2.json", r#"{"seed_urls": [], "depth": 0}"#, "application/json")
            .await
            .unwrap();

        let engine = MasterEngine::new(blob.clone(), bus.clone(), test_config());
        let envelope = JobSubmissionEnvelope {
            task_id: "job-2".into(),
            gcs_path: "gs://test-bucket/crawl_tasks/job-2.json".into(),
            is_continuation: false,
            url_count: None,
        };

        assert_eq!(engine.handle_envelope(&envelope).await, EnvelopeOutcome::Ack);
        assert_eq!(bus.len("crawl-task").await, 0);
    }

    #[tokio::test]
    async fn blob_read_failure_nacks() {
        let blob = Arc::new(InMemoryBlobStore::default());
        let bus = Arc::new(InMemoryBus::default());
        let engine = MasterEngine::new(blob.clone(), bus.clone(), test_config());
        let envelope = JobSubmissionEnvelope {
            task_id: "job-3".into(),
            gcs_path: "gs://test-bucket/crawl_tasks/missing.json".into(),
            is_continuation: false,
            url_count: None,
        };

        assert_eq!(engine.handle_envelope(&envelope).await, EnvelopeOutcome::Nack);
    }

    #[tokio::test]
    async fn malformed_blob_path_is_acked_and_dropped() {
        let blob = Arc::new(InMemoryBlobStore::default());
        let bus = Arc::new(InMemoryBus::default());
        let engine = MasterEngine::new(blob.clone(), bus.clone(), test_config());
        let envelope = JobSubmissionEnvelope {
            task_id: "job-4".into(),
            gcs_path: "not-a-gcs-path".into(),
            is_continuation: false,
            url_count: None,
        };

        assert_eq!(engine.handle_envelope(&envelope).await, EnvelopeOutcome::Ack);
    }
}
