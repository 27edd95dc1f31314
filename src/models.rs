use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A user submission: seed URLs, a depth bound, and an optional domain
/// restriction. Persisted as a blob at `crawl_tasks/{job_id}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub seed_urls: Vec<String>,
    pub depth: u32,
    #[serde(default)]
    pub domain_restriction: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Crawler-emitted collection of newly discovered URLs belonging to an
/// existing task. Persisted as a blob at `new_tasks/{batch_id}_{ts}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkBatchPayload {
    pub urls: Vec<String>,
    pub depth: u32,
    #[serde(default)]
    pub domain_restriction: Option<String>,
    pub depth_limit: u32,
}

/// Envelope published on `job-submission`, referencing a blob whose
/// contents discriminate a seed job from a link batch (see §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmissionEnvelope {
    pub task_id: String,
    pub gcs_path: String,
    #[serde(default)]
    pub is_continuation: bool,
    #[serde(default)]
    pub url_count: Option<usize>,
}

/// A single URL to fetch, delivered inline on `crawl-task`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlTask {
    pub task_id: String,
    pub url: String,
    pub depth: u32,
    pub depth_limit: u32,
    #[serde(default)]
    pub domain_restriction: Option<String>,
    pub source_job_id: String,
    #[serde(default)]
    pub is_continuation: bool,
}

/// Request to index a single page, delivered inline on `index-task`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexTask {
    pub source_task_id: String,
    pub content_id: String,
    pub original_url: String,
    pub final_url: String,
    pub gcs_processed_path: String,
    pub crawled_timestamp: DateTime<Utc>,
}

/// Canonical progress-event kinds. `Crawled`/`Indexed` also accept the
/// aliases `"crawled"`/`"indexed"` observed from older crawler revisions
/// (see spec §9 "Event aliases") via `EventKind::parse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JobReceived,
    TaskContinuation,
    UrlScheduled,
    TaskStarted,
    UrlCrawled,
    UrlSkipped,
    NewUrlsFound,
    UrlIndexed,
    DepthComplete,
    TaskCompleted,
    TaskFailed,
}

impl EventKind {
    /// Parse an event name, normalising the known aliases to their
    /// canonical form.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "job_received" => Some(Self::JobReceived),
            "task_continuation" => Some(Self::TaskContinuation),
            "url_scheduled" => Some(Self::UrlScheduled),
            "task_started" => Some(Self::TaskStarted),
            "url_crawled" | "crawled" => Some(Self::UrlCrawled),
            "url_skipped" => Some(Self::UrlSkipped),
            "new_urls_found" => Some(Self::NewUrlsFound),
            "url_indexed" | "indexed" => Some(Self::UrlIndexed),
            "depth_complete" => Some(Self::DepthComplete),
            "task_completed" => Some(Self::TaskCompleted),
            "task_failed" => Some(Self::TaskFailed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobReceived => "job_received",
            Self::TaskContinuation => "task_continuation",
            Self::UrlScheduled => "url_scheduled",
            Self::TaskStarted => "task_started",
            Self::UrlCrawled => "url_crawled",
            Self::UrlSkipped => "url_skipped",
            Self::NewUrlsFound => "new_urls_found",
            Self::UrlIndexed => "url_indexed",
            Self::DepthComplete => "depth_complete",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
        }
    }
}

/// A progress event published by any worker: `{node_type, event, task_id?,
/// url?, timestamp, ...extras}`. `extras` carries the rest of the envelope
/// (seed_urls, depth, count, reason, error, ...) as a loose JSON object so
/// the aggregator can pull out whichever fields a given event kind needs
/// without a combinatorial struct explosion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub node_type: String,
    pub event: String,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub extras: serde_json::Map<String, serde_json::Value>,
}

impl ProgressEvent {
    /// Build a progress event with the given extras, stamped `now`.
    pub fn new(
        node_type: &str,
        event: EventKind,
        task_id: Option<String>,
        url: Option<String>,
        extras: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            node_type: node_type.to_string(),
            event: event.as_str().to_string(),
            task_id,
            url,
            timestamp: Utc::now(),
            extras,
        }
    }

    pub fn kind(&self) -> Option<EventKind> {
        EventKind::parse(&self.event)
    }

    pub fn extra_str(&self, key: &str) -> Option<String> {
        self.extras.get(key).and_then(|v| v.as_str()).map(str::to_string)
    }

    pub fn extra_u64(&self, key: &str) -> Option<u64> {
        self.extras.get(key).and_then(|v| v.as_u64())
    }

    pub fn extra_str_vec(&self, key: &str) -> Option<Vec<String>> {
        self.extras.get(key).and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
    }
}

/// `{node_type, hostname, status, timestamp}`, emitted every 30s by each
/// worker on a dedicated heartbeat topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEvent {
    pub node_type: String,
    pub hostname: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Submitted,
    InProgress,
    Completed,
    Failed,
}

/// A task's bounded timeline/URL-list: retains the first 10 entries and the
/// most recent 40, dropping the middle once the cap is exceeded (spec
/// §4.4 "Bounded memory").
#[derive(Debug, Clone, Default)]
pub struct BoundedLog<T> {
    items: VecDeque<T>,
}

const BOUNDED_LOG_CAP: usize = 100;
const BOUNDED_LOG_HEAD: usize = 10;
const BOUNDED_LOG_TAIL: usize = 40;

impl<T: Clone> BoundedLog<T> {
    pub fn new() -> Self {
        Self { items: VecDeque::new() }
    }

    pub fn push(&mut self, item: T) {
        self.items.push_back(item);
        if self.items.len() > BOUNDED_LOG_CAP {
            let head: Vec<T> = self.items.iter().take(BOUNDED_LOG_HEAD).cloned().collect();
            let tail_start = self.items.len() - BOUNDED_LOG_TAIL;
            let tail: Vec<T> = self.items.iter().skip(tail_start).cloned().collect();
            self.items = head.into_iter().chain(tail).collect();
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

/// Per-task continuation record: `{timestamp, url_count}`.
#[derive(Debug, Clone, Serialize)]
pub struct ContinuationRecord {
    pub timestamp: DateTime<Utc>,
    pub url_count: u64,
}

/// A single entry in a task's progress timeline, as exposed by the read API.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub event: String,
    pub timestamp: DateTime<Utc>,
    pub url: Option<String>,
}

/// Aggregator-owned per-task state (spec §3 "Task State").
#[derive(Debug, Clone)]
pub struct TaskState {
    pub task_id: String,
    pub status: TaskStatus,
    pub crawled_urls: u64,
    pub indexed_urls: u64,
    pub continuations: u64,
    pub continuation_details: BoundedLog<ContinuationRecord>,
    pub current_depth: u32,
    pub total_depth: u32,
    pub deepest_completed_depth: Option<u32>,
    pub seed_urls: Vec<String>,
    pub domain_restriction: Option<String>,
    pub crawled_urls_list: BoundedLog<String>,
    pub indexed_urls_list: BoundedLog<String>,
    pub timeline: BoundedLog<TimelineEntry>,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub error_details: Option<serde_json::Value>,
    pub warning: Option<String>,
    pub auto_completed: bool,
}

impl TaskState {
    pub fn new(task_id: String, status: TaskStatus, timestamp: DateTime<Utc>) -> Self {
        Self {
            task_id,
            status,
            crawled_urls: 0,
            indexed_urls: 0,
            continuations: 0,
            continuation_details: BoundedLog::new(),
            current_depth: 0,
            total_depth: 0,
            deepest_completed_depth: None,
            seed_urls: Vec::new(),
            domain_restriction: None,
            crawled_urls_list: BoundedLog::new(),
            indexed_urls_list: BoundedLog::new(),
            timeline: BoundedLog::new(),
            start_time: timestamp,
            last_update: timestamp,
            end_time: None,
            error: None,
            error_details: None,
            warning: None,
            auto_completed: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Clamp `indexed_urls` to `crawled_urls` if an out-of-order event would
    /// otherwise violate the invariant (spec §3 "Invariants").
    pub fn clamp_indexed(&mut self) -> bool {
        if self.indexed_urls > self.crawled_urls {
            self.indexed_urls = self.crawled_urls;
            true
        } else {
            false
        }
    }
}
