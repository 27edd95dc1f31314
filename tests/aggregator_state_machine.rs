use chrono::Utc;
use crawlhub::aggregator::Aggregator;
use crawlhub::config::{AggregatorConfig, BusSettings};
use crawlhub::models::{EventKind, HealthEvent, ProgressEvent, TaskStatus};
use serde_json::json;
use std::time::Duration;

fn config() -> AggregatorConfig {
    AggregatorConfig {
        project_id: "test".into(),
        progress_event_topic: "progress-event".into(),
        progress_event_group: "aggregator".into(),
        health_event_topic: "health-event".into(),
        health_event_group: "aggregator".into(),
        bus: BusSettings { url: "redis://localhost:0".into(), visibility_timeout: Duration::from_secs(60) },
        port: 8080,
        max_active_tasks: 2,
        stall_submitted_secs: 120,
        stall_in_progress_secs: 600,
        stall_warning_secs: 180,
        health_stale_secs: 120,
        sweep_interval_secs: 30,
    }
}

fn progress(node_type: &str, event: EventKind, task_id: &str, url: Option<&str>) -> ProgressEvent {
    ProgressEvent::new(
        node_type,
        event,
        Some(task_id.to_string()),
        url.map(str::to_string),
        serde_json::Map::new(),
    )
}

/// Two job-submissions for the same seed URL set are coalesced into one
/// task rather than tracked as two separate in-flight crawls.
#[tokio::test]
async fn duplicate_seed_submissions_coalesce_into_one_task() {
    let aggregator = Aggregator::new(&config(), Utc::now());

    let mut first = progress("master", EventKind::JobReceived, "job-a", None);
    first.extras = json!({ "job_id": "job-a", "seed_urls": ["http://example.test/"] }).as_object().unwrap().clone();
    aggregator.handle_progress_event(first).await;

    let mut retry = progress("master", EventKind::JobReceived, "job-b", None);
    retry.extras = json!({ "job_id": "job-b", "seed_urls": ["http://example.test/"] }).as_object().unwrap().clone();
    aggregator.handle_progress_event(retry).await;

    let tasks = aggregator.list_tasks().await;
    assert_eq!(tasks.len(), 1, "retried submission for the same seed url must not open a second task");
}

/// A task that hasn't reported a heartbeat within the submitted-stall
/// window transitions out of the submitted state once swept.
#[tokio::test]
async fn stale_submitted_task_is_flagged_by_sweep() {
    let mut cfg = config();
    cfg.stall_submitted_secs = 0;
    let start = Utc::now() - chrono::Duration::seconds(5);
    let aggregator = Aggregator::new(&cfg, start);

    let mut submitted = progress("master", EventKind::JobReceived, "job-stall", None);
    submitted.extras = json!({ "job_id": "job-stall", "seed_urls": ["http://stalled.test/"] }).as_object().unwrap().clone();
    aggregator.handle_progress_event(submitted).await;

    aggregator.sweep_stalls(Utc::now()).await;

    let task = aggregator.get_task("job-stall").await.expect("task must still be tracked after sweep");
    assert_eq!(task.status, TaskStatus::Failed, "a submitted task idle past its stall window must be marked stalled/failed");
}

/// Once the active-task ceiling is reached, the oldest non-terminal task
/// is auto-completed to make room rather than rejecting new submissions.
#[tokio::test]
async fn active_task_ceiling_auto_completes_oldest_task() {
    let mut cfg = config();
    cfg.max_active_tasks = 1;
    let aggregator = Aggregator::new(&cfg, Utc::now());

    let mut oldest = progress("master", EventKind::JobReceived, "job-old", None);
    oldest.extras = json!({ "job_id": "job-old", "seed_urls": ["http://old.test/"] }).as_object().unwrap().clone();
    aggregator.handle_progress_event(oldest).await;

    let mut newest = progress("master", EventKind::JobReceived, "job-new", None);
    newest.extras = json!({ "job_id": "job-new", "seed_urls": ["http://new.test/"] }).as_object().unwrap().clone();
    aggregator.handle_progress_event(newest).await;

    let old_task = aggregator.get_task("job-old").await.expect("oldest task stays tracked");
    assert_eq!(old_task.status, TaskStatus::Completed, "ceiling breach must auto-complete the oldest active task");
    let new_task = aggregator.get_task("job-new").await.expect("newest task must be admitted");
    assert_ne!(new_task.status, TaskStatus::Completed);
}

/// `indexed_urls` never exceeds `crawled_urls` even if an `UrlIndexed`
/// event for a URL arrives before its matching `UrlCrawled` event.
#[tokio::test]
async fn indexed_count_is_clamped_to_crawled_count() {
    let aggregator = Aggregator::new(&config(), Utc::now());

    let mut submitted = progress("master", EventKind::JobReceived, "job-clamp", None);
    submitted.extras = json!({ "job_id": "job-clamp", "seed_urls": ["http://clamp.test/"] }).as_object().unwrap().clone();
    aggregator.handle_progress_event(submitted).await;

    let indexed = progress("indexer", EventKind::UrlIndexed, "job-clamp", Some("http://clamp.test/"));
    aggregator.handle_progress_event(indexed).await;

    let task = aggregator.get_task("job-clamp").await.unwrap();
    assert!(task.indexed_urls <= task.crawled_urls, "indexed count must never outrun crawled count");
}

/// Component health is tracked independently of task progress: a missing
/// heartbeat past the staleness window marks the component unhealthy.
#[tokio::test]
async fn health_sweep_flags_stale_component() {
    let mut cfg = config();
    cfg.health_stale_secs = 0;
    let start = Utc::now() - chrono::Duration::seconds(5);
    let aggregator = Aggregator::new(&cfg, start);

    aggregator
        .handle_health_event(HealthEvent {
            node_type: "crawler".into(),
            hostname: "crawler-1".into(),
            status: "online".into(),
            timestamp: start,
        })
        .await;

    aggregator.sweep_health(Utc::now()).await;

    let statuses = aggregator.component_statuses().await;
    let crawler_status = statuses.get("crawler").expect("crawler heartbeat must be tracked");
    assert_ne!(crawler_status, "online", "a heartbeat older than the staleness window must no longer read online");
}
