use std::env;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, &'static str),
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn optional(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_u64(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidValue(key, "must be a valid u64"))
}

fn parse_u32(key: &'static str, default: u32) -> Result<u32, ConfigError> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse::<u32>()
        .map_err(|_| ConfigError::InvalidValue(key, "must be a valid u32"))
}

fn parse_usize(key: &'static str, default: usize) -> Result<usize, ConfigError> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidValue(key, "must be a valid usize"))
}

fn parse_u16(key: &'static str, default: u16) -> Result<u16, ConfigError> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse::<u16>()
        .map_err(|_| ConfigError::InvalidValue(key, "must be a valid u16"))
}

/// Blob-store connection settings, shared by every component that touches
/// the object store (spec §6 "blob bucket").
#[derive(Debug, Clone)]
pub struct BlobSettings {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
}

impl BlobSettings {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            endpoint: required("BLOB_ENDPOINT")?,
            access_key: required("BLOB_ACCESS_KEY")?,
            secret_key: required("BLOB_SECRET_KEY")?,
            bucket: required("BLOB_BUCKET")?,
        })
    }
}

/// Message-bus connection settings.
#[derive(Debug, Clone)]
pub struct BusSettings {
    pub url: String,
    pub visibility_timeout: Duration,
}

impl BusSettings {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            url: required("BUS_URL")?,
            visibility_timeout: Duration::from_secs(parse_u64("BUS_VISIBILITY_TIMEOUT_SECS", 60)?),
        })
    }
}

/// Full-text index connection settings.
#[derive(Debug, Clone)]
pub struct IndexSettings {
    pub host: String,
    pub port: u16,
    pub index_name: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl IndexSettings {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: required("ES_HOST")?,
            port: parse_u16("ES_PORT", 9200)?,
            index_name: required("ES_INDEX_NAME")?,
            username: env::var("ES_USERNAME").ok(),
            password: env::var("ES_PASSWORD").ok(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub project_id: String,
    pub job_submission_topic: String,
    pub job_submission_group: String,
    pub crawl_task_topic: String,
    pub progress_event_topic: String,
    pub health_event_topic: String,
    pub blob: BlobSettings,
    pub bus: BusSettings,
    pub default_depth_limit: u32,
    pub host_id: String,
    pub max_concurrent_jobs: usize,
}

impl MasterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            project_id: required("PROJECT_ID")?,
            job_submission_topic: optional("JOB_SUBMISSION_TOPIC", "job-submission"),
            job_submission_group: optional("JOB_SUBMISSION_GROUP", "master"),
            crawl_task_topic: optional("CRAWL_TASK_TOPIC", "crawl-task"),
            progress_event_topic: optional("PROGRESS_EVENT_TOPIC", "progress-event"),
            health_event_topic: optional("HEALTH_EVENT_TOPIC", "health-event"),
            blob: BlobSettings::from_env()?,
            bus: BusSettings::from_env()?,
            default_depth_limit: parse_u32("DEFAULT_DEPTH_LIMIT", 3)?,
            host_id: optional("HOST_ID", "master-0"),
            max_concurrent_jobs: parse_usize("MAX_CONCURRENT_JOBS", 5)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub project_id: String,
    pub crawl_task_topic: String,
    pub crawl_task_group: String,
    pub job_submission_topic: String,
    pub index_task_topic: String,
    pub progress_event_topic: String,
    pub health_event_topic: String,
    pub blob: BlobSettings,
    pub bus: BusSettings,
    pub default_depth_limit: u32,
    pub host_id: String,
    pub user_agent: String,
    pub max_concurrent_fetches: usize,
    pub fetch_timeout: Duration,
    pub politeness_delay: Duration,
}

impl CrawlerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            project_id: required("PROJECT_ID")?,
            crawl_task_topic: optional("CRAWL_TASK_TOPIC", "crawl-task"),
            crawl_task_group: optional("CRAWL_TASK_GROUP", "crawler"),
            job_submission_topic: optional("JOB_SUBMISSION_TOPIC", "job-submission"),
            index_task_topic: optional("INDEX_TASK_TOPIC", "index-task"),
            progress_event_topic: optional("PROGRESS_EVENT_TOPIC", "progress-event"),
            health_event_topic: optional("HEALTH_EVENT_TOPIC", "health-event"),
            blob: BlobSettings::from_env()?,
            bus: BusSettings::from_env()?,
            default_depth_limit: parse_u32("DEFAULT_DEPTH_LIMIT", 3)?,
            host_id: optional("HOST_ID", "crawler-0"),
            user_agent: optional("CRAWLER_USER_AGENT", "crawlhub-bot/0.1"),
            max_concurrent_fetches: parse_usize("MAX_CONCURRENT_FETCHES", 10)?,
            fetch_timeout: Duration::from_secs(parse_u64("FETCH_TIMEOUT_SECS", 10)?),
            politeness_delay: Duration::from_millis(parse_u64("POLITENESS_DELAY_MS", 1000)?),
        })
    }
}

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub project_id: String,
    pub index_task_topic: String,
    pub index_task_group: String,
    pub progress_event_topic: String,
    pub health_event_topic: String,
    pub blob: BlobSettings,
    pub bus: BusSettings,
    pub index: IndexSettings,
    pub host_id: String,
    pub max_concurrent_upserts: usize,
}

impl IndexerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            project_id: required("PROJECT_ID")?,
            index_task_topic: optional("INDEX_TASK_TOPIC", "index-task"),
            index_task_group: optional("INDEX_TASK_GROUP", "indexer"),
            progress_event_topic: optional("PROGRESS_EVENT_TOPIC", "progress-event"),
            health_event_topic: optional("HEALTH_EVENT_TOPIC", "health-event"),
            blob: BlobSettings::from_env()?,
            bus: BusSettings::from_env()?,
            index: IndexSettings::from_env()?,
            host_id: optional("HOST_ID", "indexer-0"),
            max_concurrent_upserts: parse_usize("MAX_CONCURRENT_UPSERTS", 10)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub project_id: String,
    pub progress_event_topic: String,
    pub progress_event_group: String,
    pub health_event_topic: String,
    pub health_event_group: String,
    pub bus: BusSettings,
    pub port: u16,
    pub max_active_tasks: usize,
    pub stall_submitted_secs: u64,
    pub stall_in_progress_secs: u64,
    pub stall_warning_secs: u64,
    pub health_stale_secs: u64,
    pub sweep_interval_secs: u64,
}

impl AggregatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            project_id: required("PROJECT_ID")?,
            progress_event_topic: optional("PROGRESS_EVENT_TOPIC", "progress-event"),
            progress_event_group: optional("PROGRESS_EVENT_GROUP", "aggregator"),
            health_event_topic: optional("HEALTH_EVENT_TOPIC", "health-event"),
            health_event_group: optional("HEALTH_EVENT_GROUP", "aggregator"),
            bus: BusSettings::from_env()?,
            port: parse_u16("PORT", 8080)?,
            max_active_tasks: parse_usize("MAX_ACTIVE_TASKS", 20)?,
            stall_submitted_secs: parse_u64("STALL_SUBMITTED_SECS", 120)?,
            stall_in_progress_secs: parse_u64("STALL_IN_PROGRESS_SECS", 600)?,
            stall_warning_secs: parse_u64("STALL_WARNING_SECS", 180)?,
            health_stale_secs: parse_u64("HEALTH_STALE_SECS", 120)?,
            sweep_interval_secs: parse_u64("SWEEP_INTERVAL_SECS", 30)?,
        })
    }
}
