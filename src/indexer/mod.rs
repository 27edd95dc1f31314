use std::sync::Arc;

use serde_json::json;

use crate::blob::{relative_key, BlobStore};
use crate::bus::{publish_json, Bus};
use crate::config::IndexerConfig;
use crate::index::{SearchIndex, UpsertResult};
use crate::models::{EventKind, IndexTask, ProgressEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Ack,
    Nack,
}

/// Upserts extracted text into the full-text index, one document per URL
/// (spec §4.3).
pub struct IndexerEngine {
    blob: Arc<dyn BlobStore>,
    bus: Arc<dyn Bus>,
    index: Arc<dyn SearchIndex>,
    config: IndexerConfig,
}

impl IndexerEngine {
    pub fn new(blob: Arc<dyn BlobStore>, bus: Arc<dyn Bus>, index: Arc<dyn SearchIndex>, config: IndexerConfig) -> Self {
        Self { blob, bus, index, config }
    }

    pub async fn process_task(&self, task: &IndexTask) -> IndexOutcome {
        let effective_url = if task.final_url.is_empty() { &task.original_url } else { &task.final_url };

        let Some(key) = relative_key(&self.config.blob.bucket, &task.gcs_processed_path) else {
            tracing::warn!(path = %task.gcs_processed_path, "processed-text path outside configured bucket, dropping");
            return IndexOutcome::Ack;
        };

        let content = match self.blob.get_text(key).await {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read processed text, nacking");
                return IndexOutcome::Nack;
            }
        };

        let result = match self.index.upsert(effective_url, &content).await {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(error = %err, "index upsert failed, nacking");
                return IndexOutcome::Nack;
            }
        };

        match result {
            UpsertResult::Created | UpsertResult::Updated => {}
        }

        let event = ProgressEvent::new(
            "indexer",
            EventKind::UrlIndexed,
            Some(task.source_task_id.clone()),
            Some(effective_url.clone()),
            json_map(&[("content_id", json!(task.content_id))]),
        );
        if let Err(err) = publish_json(self.bus.as_ref(), &self.config.progress_event_topic, &event).await {
            tracing::warn!(error = %err, "failed to publish progress event");
        }

        IndexOutcome::Ack
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
    use crate::config::{BlobSettings, BusSettings, IndexSettings};
    use crate::index::testutil::InMemoryIndex;
    use chrono::Utc;
    use std::time::Duration;

    fn test_config() -> IndexerConfig {
        IndexerConfig {
            project_id: "test".into(),
            index_task_topic: "index-task".into(),
            index_task_group: "indexer".into(),
            progress_event_topic: "progress-event".into(),
            health_event_topic: "health-event".into(),
            blob: BlobSettings {
                endpoint: "http://localhost:0".into(),
                access_key: "k".into(),
                secret_key: "s".into(),
                bucket: "test-bucket".into(),
            },
            bus: BusSettings { url: "redis://localhost:0".into(), visibility_timeout: Duration::from_secs(60) },
            index: IndexSettings {
                host: "localhost".into(),
                port: 9200,
                index_name: "pages".into(),
                username: None,
                password: None,
            },
            host_id: "indexer-test".into(),
            max_concurrent_upserts: 10,
        }
    }

    #[tokio::test]
    async fn successful_upsert_acks_and_emits_url_indexed() {
        let blob = Arc::new(InMemoryBlobStore::default());
        let bus = Arc::new(InMemoryBus::default());
        let index = Arc::new(InMemoryIndex::default());
        blob.put_text("processed_text/c1.txt", "hello world", "text/plain").await.unwrap();

        let engine = IndexerEngine::new(blob.clone(), bus.clone(), index.clone(), test_config());
        let task = IndexTask {
            source_task_id: "job-1".into(),
            content_id: "c1".into(),
            original_url: "http://a.test/".into(),
            final_url: "http://a.test/".into(),
            gcs_processed_path: "gs://test-bucket/processed_text/c1.txt".into(),
            crawled_timestamp: Utc::now(),
        };

        let outcome = engine.process_task(&task).await;
        assert_eq!(outcome, IndexOutcome::Ack);
        assert_eq!(index.get("http://a.test/").await.as_deref(), Some("hello world"));

        let events: Vec<ProgressEvent> = bus.decode_all("progress-event").await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), Some(EventKind::UrlIndexed));
    }

    #[tokio::test]
    async fn blob_read_failure_nacks() {
        let blob = Arc::new(InMemoryBlobStore::default());
        let bus = Arc::new(InMemoryBus::default());
        let index = Arc::new(InMemoryIndex::default());
        let engine = IndexerEngine::new(blob.clone(), bus.clone(), index.clone(), test_config());

        let task = IndexTask {
            source_task_id: "job-1".into(),
            content_id: "c1".into(),
            original_url: "http://a.test/".into(),
            final_url: "http://a.test/".into(),
            gcs_processed_path: "gs://test-bucket/processed_text/missing.txt".into(),
            crawled_timestamp: Utc::now(),
        };

        assert_eq!(engine.process_task(&task).await, IndexOutcome::Nack);
    }

    #[tokio::test]
    async fn path_outside_bucket_is_acked_and_dropped() {
        let blob = Arc::new(InMemoryBlobStore::default());
        let bus = Arc::new(InMemoryBus::default());
        let index = Arc::new(InMemoryIndex::default());
        let engine = IndexerEngine::new(blob.clone(), bus.clone(), index.clone(), test_config());

        let task = IndexTask {
            source_task_id: "job-1".into(),
            content_id: "c1".into(),
            original_url: "http://a.test/".into(),
            final_url: "http://a.test/".into(),
            gcs_processed_path: "gs://other-bucket/processed_text/c1.txt".into(),
            crawled_timestamp: Utc::now(),
        };

        assert_eq!(engine.process_task(&task).await, IndexOutcome::Ack);
    }

    #[tokio::test]
    async fn redelivery_is_idempotent_by_url() {
        let blob = Arc::new(InMemoryBlobStore::default());
        let bus = Arc::new(InMemoryBus::default());
        let index = Arc::new(InMemoryIndex::default());
        blob.put_text("processed_text/c1.txt", "hello world", "text/plain").await.unwrap();

        let engine = IndexerEngine::new(blob.clone(), bus.clone(), index.clone(), test_config());
        let task = IndexTask {
            source_task_id: "job-1".into(),
            content_id: "c1".into(),
            original_url: "http://a.test/".into(),
            final_url: "http://a.test/".into(),
            gcs_processed_path: "gs://test-bucket/processed_text/c1.txt".into(),
            crawled_timestamp: Utc::now(),
        };

        engine.process_task(&task).await;
        engine.process_task(&task).await;
        assert_eq!(index.len().await, 1);
    }
}
