use async_trait::async_trait;
use aws_config::Region;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("blob store error: {0}")]
    Backend(String),
    #[error("object body was not valid UTF-8: {0}")]
    InvalidUtf8(String),
}

/// Configuration needed to reach an S3/R2-compatible object store.
#[derive(Debug, Clone)]
pub struct BlobConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
}

/// Contract fixed by spec §2: append-only object storage keyed by path,
/// used for raw HTML, extracted text, and job payloads that exceed inline
/// message size. Abstracted behind a trait so components can be tested
/// against an in-memory fake instead of a live bucket.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put_text(&self, key: &str, body: &str, content_type: &str) -> Result<(), BlobError>;
    async fn get_text(&self, key: &str) -> Result<String, BlobError>;
}

/// S3/R2-compatible object store client, generalized from the teacher's
/// fixed-key `StorageClient` to arbitrary path-keyed reads and writes.
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
}

impl S3BlobStore {
    pub fn new(config: BlobConfig) -> Self {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "crawlhub-blob",
        );

        let s3_config = S3ConfigBuilder::new()
            .endpoint_url(&config.endpoint)
            .region(Region::new("auto"))
            .credentials_provider(credentials)
            .force_path_style(true)
            .behavior_version_latest()
            .build();

        Self {
            client: S3Client::from_conf(s3_config),
            bucket: config.bucket,
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put_text(&self, key: &str, body: &str, content_type: &str) -> Result<(), BlobError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body.as_bytes().to_vec()))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| BlobError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get_text(&self, key: &str) -> Result<String, BlobError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("NoSuchKey") || msg.contains("NotFound") {
                    BlobError::NotFound(key.to_string())
                } else {
                    BlobError::Backend(msg)
                }
            })?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| BlobError::Backend(e.to_string()))?
            .into_bytes();

        String::from_utf8(bytes.to_vec()).map_err(|e| BlobError::InvalidUtf8(e.to_string()))
    }
}

/// Derive the bucket-relative key from a `gs://bucket/key`-style path, and
/// validate it is scoped to the configured bucket (spec §4.3 "validate the
/// processed-text blob path is within the configured blob-store bucket").
pub fn relative_key<'a>(bucket: &str, path: &'a str) -> Option<&'a str> {
    let prefix = format!("gs://{bucket}/");
    path.strip_prefix(&prefix)
}

#[cfg(any(test, feature = "test-util"))]
pub mod testutil {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory fake used by component unit tests.
    #[derive(Default)]
    pub struct InMemoryBlobStore {
        objects: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl BlobStore for InMemoryBlobStore {
        async fn put_text(&self, key: &str, body: &str, _content_type: &str) -> Result<(), BlobError> {
            self.objects.lock().unwrap().insert(key.to_string(), body.to_string());
            Ok(())
        }

        async fn get_text(&self, key: &str) -> Result<String, BlobError> {
            self.objects
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| BlobError::NotFound(key.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::InMemoryBlobStore;
    use super::*;

    #[tokio::test]
    async fn round_trips_text() {
        let store = InMemoryBlobStore::default();
        store.put_text("raw_html/abc.html", "<html></html>", "text/html").await.unwrap();
        let got = store.get_text("raw_html/abc.html").await.unwrap();
        assert_eq!(got, "<html></html>");
    }

    #[tokio::test]
    async fn missing_key_errors() {
        let store = InMemoryBlobStore::default();
        assert!(matches!(store.get_text("nope").await, Err(BlobError::NotFound(_))));
    }

    #[test]
    fn relative_key_strips_bucket_prefix() {
        assert_eq!(
            relative_key("my-bucket", "gs://my-bucket/processed_text/x.txt"),
            Some("processed_text/x.txt")
        );
        assert_eq!(relative_key("my-bucket", "gs://other-bucket/x.txt"), None);
    }
}
