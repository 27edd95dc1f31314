use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::{Aggregator, TaskSnapshot};
use crate::models::TaskStatus;

/// Read-only HTTP surface for dashboards and operators (spec §4.4 "Read
/// API"). Job submission and search stay out of this process: they are
/// collaborators named out of scope.
pub fn build_router(aggregator: Arc<Aggregator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/progress", get(progress))
        .route("/tasks", get(list_tasks))
        .route("/tasks/{id}", get(get_task))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(aggregator)
}

async fn health(State(aggregator): State<Arc<Aggregator>>) -> impl IntoResponse {
    let components = aggregator.component_statuses().await;
    Json(json!({ "status": "ok", "components": components }))
}

/// Full in-memory state dump: every task, the summary counters, and
/// per-component health, mirroring `original_source`'s `/progress` route.
async fn progress(State(aggregator): State<Arc<Aggregator>>) -> impl IntoResponse {
    let tasks = aggregator.list_tasks().await;
    let summary = aggregator.summary().await;
    let health = aggregator.component_statuses().await;
    Json(json!({ "tasks": tasks, "summary": summary, "health": health }))
}

#[derive(Debug, Deserialize)]
struct TaskListQuery {
    status: Option<String>,
    #[serde(default = "default_page")]
    page: usize,
    #[serde(default = "default_size")]
    size: usize,
}

fn default_page() -> usize {
    1
}

fn default_size() -> usize {
    50
}

fn parse_status(raw: &str) -> Option<TaskStatus> {
    match raw {
        "submitted" => Some(TaskStatus::Submitted),
        "in_progress" => Some(TaskStatus::InProgress),
        "completed" => Some(TaskStatus::Completed),
        "failed" => Some(TaskStatus::Failed),
        _ => None,
    }
}

/// Status-filtered, `last_update`-descending, paginated task list with a
/// summary block, mirroring `original_source`'s `/tasks` route.
async fn list_tasks(State(aggregator): State<Arc<Aggregator>>, Query(query): Query<TaskListQuery>) -> impl IntoResponse {
    let mut tasks = aggregator.list_tasks().await;
    if let Some(status) = query.status.as_deref().and_then(parse_status) {
        tasks.retain(|t| t.status == status);
    }
    tasks.sort_by(|a, b| b.last_update.cmp(&a.last_update));

    let total = tasks.len();
    let page = query.page.max(1);
    let size = query.size.max(1);
    let start = (page - 1) * size;
    let page_tasks: Vec<TaskSnapshot> = tasks.into_iter().skip(start).take(size).collect();

    let summary = aggregator.summary().await;
    Json(json!({ "tasks": page_tasks, "total": total, "page": page, "size": size, "summary": summary }))
}

async fn get_task(State(aggregator): State<Arc<Aggregator>>, Path(id): Path<String>) -> impl IntoResponse {
    match aggregator.get_task(&id).await {
        Some(task) => Json(task).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({ "error": "task not found" }))).into_response(),
    }
}
