pub mod server;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::config::AggregatorConfig;
use crate::models::{
    ContinuationRecord, EventKind, HealthEvent, ProgressEvent, TaskState, TaskStatus, TimelineEntry,
};

/// Summary counters recomputed by iterating the task map (spec §4.4
/// "Summary counters").
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Summary {
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub total_crawled: u64,
    pub total_indexed: u64,
}

struct Inner {
    startup_time: DateTime<Utc>,
    max_active_tasks: usize,
    stall_submitted: Duration,
    stall_in_progress: Duration,
    stall_warning: Duration,
    health_stale: Duration,
    tasks: HashMap<String, TaskState>,
    seed_key_map: HashMap<Vec<String>, String>,
    component_heartbeat: HashMap<String, DateTime<Utc>>,
    component_status: HashMap<String, String>,
}

/// Consolidates the progress/health event streams into live per-task and
/// per-component state (spec §4.4). A single mutex guards both the task
/// map and the seed-key map, per the shared-mutable-state guidance in §9.
pub struct Aggregator {
    inner: Mutex<Inner>,
}

fn canonical_seed_key(seed_urls: &[String]) -> Vec<String> {
    let mut sorted = seed_urls.to_vec();
    sorted.sort();
    sorted
}

impl Aggregator {
    pub fn new(config: &AggregatorConfig, startup_time: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                startup_time,
                max_active_tasks: config.max_active_tasks,
                stall_submitted: Duration::from_secs(config.stall_submitted_secs),
                stall_in_progress: Duration::from_secs(config.stall_in_progress_secs),
                stall_warning: Duration::from_secs(config.stall_warning_secs),
                health_stale: Duration::from_secs(config.health_stale_secs),
                tasks: HashMap::new(),
                seed_key_map: HashMap::new(),
                component_heartbeat: HashMap::new(),
                component_status: HashMap::new(),
            }),
        }
    }

    /// Apply one progress event. Events older than `startup_time` are
    /// discarded silently (spec §4.4 "Startup filter").
    pub async fn handle_progress_event(&self, event: ProgressEvent) {
        let mut inner = self.inner.lock().await;
        if event.timestamp < inner.startup_time {
            return;
        }

        let Some(kind) = event.kind() else {
            tracing::warn!(event = %event.event, "unrecognised progress event kind, ignoring");
            return;
        };

        let task_id = inner.resolve_task_id(&event, kind);
        let Some(task_id) = task_id else {
            return;
        };

        let is_new = !inner.tasks.contains_key(&task_id);
        if is_new {
            let initial_status = if kind == EventKind::JobReceived { TaskStatus::Submitted } else { TaskStatus::InProgress };
            inner.tasks.insert(task_id.clone(), TaskState::new(task_id.clone(), initial_status, event.timestamp));
        }

        inner.apply_event(&task_id, kind, &event);
        inner.enforce_max_active_tasks();
    }

    /// Apply one health event, tracking component liveness.
    pub async fn handle_health_event(&self, event: HealthEvent) {
        let mut inner = self.inner.lock().await;
        if event.timestamp < inner.startup_time {
            return;
        }
        inner.component_heartbeat.insert(event.node_type.clone(), event.timestamp);
        inner.component_status.insert(event.node_type.clone(), event.status.clone());
    }

    /// Periodic stall sweep (spec §4.4 "Stall detection").
    pub async fn sweep_stalls(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().await;
        inner.sweep_stalls(now);
    }

    /// Periodic health-staleness sweep (spec §4.4 "Health staleness").
    pub async fn sweep_health(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().await;
        let stale_components: Vec<String> = inner
            .component_heartbeat
            .iter()
            .filter(|(_, last)| now.signed_duration_since(**last).to_std().unwrap_or_default() > inner.health_stale)
            .map(|(node, _)| node.clone())
            .collect();
        for node in stale_components {
            inner.component_status.insert(node, "offline".to_string());
        }
    }

    pub async fn summary(&self) -> Summary {
        let mut inner = self.inner.lock().await;
        inner.recompute_summary()
    }

    pub async fn get_task(&self, task_id: &str) -> Option<TaskSnapshot> {
        let inner = self.inner.lock().await;
        inner.tasks.get(task_id).map(TaskSnapshot::from)
    }

    pub async fn list_tasks(&self) -> Vec<TaskSnapshot> {
        let inner = self.inner.lock().await;
        inner.tasks.values().map(TaskSnapshot::from).collect()
    }

    pub async fn component_statuses(&self) -> HashMap<String, String> {
        let inner = self.inner.lock().await;
        inner.component_status.clone()
    }
}

impl Inner {
    fn resolve_task_id(&mut self, event: &ProgressEvent, kind: EventKind) -> Option<String> {
        if kind == EventKind::JobReceived {
            if let Some(seed_urls) = event.extra_str_vec("seed_urls") {
                let key = canonical_seed_key(&seed_urls);
                if let Some(existing) = self.seed_key_map.get(&key) {
                    return Some(existing.clone());
                }
                if let Some(task_id) = event.task_id.clone().or_else(|| event.extra_str("job_id")) {
                    self.seed_key_map.insert(key, task_id.clone());
                    return Some(task_id);
                }
            }
        }

        event.task_id.clone().or_else(|| event.extra_str("job_id"))
    }

    fn apply_event(&mut self, task_id: &str, kind: EventKind, event: &ProgressEvent) {
        let was_terminal = self.tasks.get(task_id).map(|t| t.is_terminal()).unwrap_or(false);

        if let Some(task) = self.tasks.get_mut(task_id) {
            if !was_terminal {
                task.last_update = event.timestamp;
            }

            match kind {
                EventKind::JobReceived => {
                    if let Some(seeds) = event.extra_str_vec("seed_urls") {
                        task.seed_urls = seeds;
                    }
                }
                EventKind::TaskStarted => {
                    if !was_terminal {
                        task.status = TaskStatus::InProgress;
                    }
                    if let Some(depth) = event.extra_u64("total_depth") {
                        task.total_depth = depth as u32;
                    }
                    if let Some(seeds) = event.extra_str_vec("seed_urls") {
                        task.seed_urls = seeds;
                    }
                    task.domain_restriction = event.extra_str("domain_restriction");
                }
                EventKind::TaskContinuation => {
                    task.continuations += 1;
                    let url_count = event.extra_u64("url_count").unwrap_or(0);
                    task.continuation_details.push(ContinuationRecord { timestamp: event.timestamp, url_count });
                }
                EventKind::UrlCrawled => {
                    task.crawled_urls += 1;
                    if let Some(url) = &event.url {
                        if !task.crawled_urls_list.iter().any(|u| u == url) {
                            task.crawled_urls_list.push(url.clone());
                        }
                    }
                    if let Some(depth) = event.extra_u64("depth") {
                        task.current_depth = task.current_depth.max(depth as u32);
                    }
                    if !was_terminal && task.status == TaskStatus::Submitted {
                        task.status = TaskStatus::InProgress;
                    }
                }
                EventKind::UrlIndexed => {
                    task.indexed_urls += 1;
                    if let Some(url) = &event.url {
                        if !task.indexed_urls_list.iter().any(|u| u == url) {
                            task.indexed_urls_list.push(url.clone());
                        }
                    }
                    if !was_terminal && task.status == TaskStatus::Submitted {
                        task.status = TaskStatus::InProgress;
                    }
                    if task.clamp_indexed() {
                        task.warning = Some("indexed_urls_clamped_to_crawled_urls".to_string());
                    }
                }
                EventKind::DepthComplete => {
                    if let Some(depth) = event.extra_u64("depth") {
                        let depth = depth as u32;
                        task.deepest_completed_depth = Some(task.deepest_completed_depth.map_or(depth, |d| d.max(depth)));
                    }
                }
                EventKind::TaskCompleted => {
                    task.status = TaskStatus::Completed;
                    task.end_time = Some(event.timestamp);
                }
                EventKind::TaskFailed => {
                    task.status = TaskStatus::Failed;
                    task.end_time = Some(event.timestamp);
                    task.error = event.extra_str("error").or_else(|| event.extra_str("reason"));
                }
                EventKind::UrlScheduled | EventKind::NewUrlsFound | EventKind::UrlSkipped => {}
            }

            task.timeline.push(TimelineEntry { event: event.event.clone(), timestamp: event.timestamp, url: event.url.clone() });
        }
    }

    /// When the number of non-terminal tasks exceeds the cap, auto-complete
    /// the oldest (by `last_update`) until back under it (spec §4.4).
    fn enforce_max_active_tasks(&mut self) {
        loop {
            let active_count = self.tasks.values().filter(|t| !t.is_terminal()).count();
            if active_count <= self.max_active_tasks {
                return;
            }

            let oldest = self
                .tasks
                .values_mut()
                .filter(|t| !t.is_terminal())
                .min_by_key(|t| t.last_update)
                .map(|t| t.task_id.clone());

            let Some(oldest_id) = oldest else { return };
            if let Some(task) = self.tasks.get_mut(&oldest_id) {
                task.status = TaskStatus::Completed;
                task.auto_completed = true;
                task.end_time = Some(task.last_update);
            }
        }
    }

    fn sweep_stalls(&mut self, now: DateTime<Utc>) {
        for task in self.tasks.values_mut() {
            if task.is_terminal() {
                continue;
            }
            let idle = now.signed_duration_since(task.last_update).to_std().unwrap_or_default();

            match task.status {
                TaskStatus::Submitted if idle > self.stall_submitted => {
                    task.status = TaskStatus::Failed;
                    task.end_time = Some(now);
                    task.error = Some("stalled: no progress after submission".to_string());
                }
                TaskStatus::InProgress if idle > self.stall_in_progress => {
                    task.status = TaskStatus::Failed;
                    task.end_time = Some(now);
                    task.error = Some("stalled: no progress while in progress".to_string());
                }
                TaskStatus::InProgress if idle > self.stall_warning => {
                    task.warning = Some("slow_progress".to_string());
                }
                _ => {}
            }
        }
    }

    fn recompute_summary(&mut self) -> Summary {
        let mut summary = Summary::default();
        for task in self.tasks.values_mut() {
            task.clamp_indexed();
            match task.status {
                TaskStatus::Submitted | TaskStatus::InProgress => summary.active += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => summary.failed += 1,
            }
            summary.total_crawled += task.crawled_urls;
            summary.total_indexed += task.indexed_urls;
        }
        summary
    }
}

/// Read-only, serialisable view of a `TaskState`, as exposed by the HTTP API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub status: TaskStatus,
    pub crawled_urls: u64,
    pub indexed_urls: u64,
    pub continuations: u64,
    pub current_depth: u32,
    pub total_depth: u32,
    pub deepest_completed_depth: Option<u32>,
    pub seed_urls: Vec<String>,
    pub domain_restriction: Option<String>,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub warning: Option<String>,
    pub auto_completed: bool,
}

impl From<&TaskState> for TaskSnapshot {
    fn from(t: &TaskState) -> Self {
        Self {
            task_id: t.task_id.clone(),
            status: t.status,
            crawled_urls: t.crawled_urls,
            indexed_urls: t.indexed_urls,
            continuations: t.continuations,
            current_depth: t.current_depth,
            total_depth: t.total_depth,
            deepest_completed_depth: t.deepest_completed_depth,
            seed_urls: t.seed_urls.clone(),
            domain_restriction: t.domain_restriction.clone(),
            start_time: t.start_time,
            last_update: t.last_update,
            end_time: t.end_time,
            error: t.error.clone(),
            warning: t.warning.clone(),
            auto_completed: t.auto_completed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> AggregatorConfig {
        AggregatorConfig {
            project_id: "test".into(),
            progress_event_topic: "progress-event".into(),
            progress_event_group: "aggregator".into(),
            health_event_topic: "health-event".into(),
            health_event_group: "aggregator".into(),
            bus: crate::config::BusSettings { url: "redis://localhost:0".into(), visibility_timeout: Duration::from_secs(60) },
            port: 8080,
            max_active_tasks: 2,
            stall_submitted_secs: 120,
            stall_in_progress_secs: 600,
            stall_warning_secs: 180,
            health_stale_secs: 120,
            sweep_interval_secs: 30,
        }
    }

    fn job_received(task_id: &str, seed_urls: Vec<&str>, ts: DateTime<Utc>) -> ProgressEvent {
        let extras = json!({
            "job_id": task_id,
            "seed_urls": seed_urls,
        });
        ProgressEvent {
            node_type: "master".into(),
            event: "job_received".into(),
            task_id: Some(task_id.to_string()),
            url: None,
            timestamp: ts,
            extras: extras.as_object().unwrap().clone(),
        }
    }

    fn url_crawled(task_id: &str, url: &str, ts: DateTime<Utc>) -> ProgressEvent {
        ProgressEvent {
            node_type: "crawler".into(),
            event: "url_crawled".into(),
            task_id: Some(task_id.to_string()),
            url: Some(url.to_string()),
            timestamp: ts,
            extras: serde_json::Map::new(),
        }
    }

    fn url_indexed(task_id: &str, url: &str, ts: DateTime<Utc>) -> ProgressEvent {
        ProgressEvent {
            node_type: "indexer".into(),
            event: "url_indexed".into(),
            task_id: Some(task_id.to_string()),
            url: Some(url.to_string()),
            timestamp: ts,
            extras: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn duplicate_seed_submission_coalesces_into_one_task() {
        let start = Utc::now() - chrono::Duration::seconds(10);
        let agg = Aggregator::new(&config(), start);
        let ts = Utc::now();

        agg.handle_progress_event(job_received("job-1", vec!["http://a.test/"], ts)).await;
        agg.handle_progress_event(job_received("job-2", vec!["http://a.test/"], ts)).await;

        assert_eq!(agg.list_tasks().await.len(), 1);
    }

    #[tokio::test]
    async fn crawled_then_indexed_is_commutative_with_clamp() {
        let start = Utc::now() - chrono::Duration::seconds(10);
        let agg = Aggregator::new(&config(), start);
        let ts = Utc::now();

        // Indexed event arrives before crawled (out of order).
        agg.handle_progress_event(url_indexed("job-1", "http://a.test/", ts)).await;
        agg.handle_progress_event(url_crawled("job-1", "http://a.test/", ts)).await;

        let task = agg.get_task("job-1").await.unwrap();
        assert!(task.indexed_urls <= task.crawled_urls);
    }

    #[tokio::test]
    async fn events_before_startup_time_are_discarded() {
        let start = Utc::now();
        let agg = Aggregator::new(&config(), start);
        let before = start - chrono::Duration::seconds(5);

        agg.handle_progress_event(url_crawled("job-1", "http://a.test/", before)).await;
        assert!(agg.get_task("job-1").await.is_none());
    }

    #[tokio::test]
    async fn completed_task_does_not_un_terminate() {
        let start = Utc::now() - chrono::Duration::seconds(10);
        let agg = Aggregator::new(&config(), start);
        let ts = Utc::now();

        agg.handle_progress_event(job_received("job-1", vec!["http://a.test/"], ts)).await;
        let completed = ProgressEvent {
            node_type: "master".into(),
            event: "task_completed".into(),
            task_id: Some("job-1".into()),
            url: None,
            timestamp: ts,
            extras: serde_json::Map::new(),
        };
        agg.handle_progress_event(completed).await;
        agg.handle_progress_event(url_crawled("job-1", "http://a.test/", ts + chrono::Duration::seconds(1))).await;

        let task = agg.get_task("job-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn max_active_tasks_auto_completes_oldest() {
        let start = Utc::now() - chrono::Duration::seconds(100);
        let agg = Aggregator::new(&config(), start);

        agg.handle_progress_event(job_received("job-1", vec!["http://a.test/"], start + chrono::Duration::seconds(1))).await;
        agg.handle_progress_event(job_received("job-2", vec!["http://b.test/"], start + chrono::Duration::seconds(2))).await;
        agg.handle_progress_event(job_received("job-3", vec!["http://c.test/"], start + chrono::Duration::seconds(3))).await;

        let oldest = agg.get_task("job-1").await.unwrap();
        assert!(oldest.auto_completed);
        assert_eq!(oldest.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn stall_sweep_fails_submitted_task_after_threshold() {
        let start = Utc::now() - chrono::Duration::seconds(200);
        let agg = Aggregator::new(&config(), start);
        agg.handle_progress_event(job_received("job-1", vec!["http://a.test/"], start + chrono::Duration::seconds(1))).await;

        agg.sweep_stalls(start + chrono::Duration::seconds(200)).await;

        let task = agg.get_task("job-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.is_some());
    }
}
