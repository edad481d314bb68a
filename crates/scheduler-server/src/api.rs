//! The Control HTTP API. A thin, mostly
//! transactional surface over `scheduler_core::Engine`: every handler either
//! reads engine state or makes one call into it; the next tick observes any
//! mutation.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use scheduler_core::catalog::{Job, ResourceGroupSpec};
use scheduler_core::{Catalog, Mode};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{ApiError, ApiResult};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<scheduler_core::Engine>,
}

/// Build the router exposing the scheduler's control surface.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/scheduler/start", post(start_scheduler))
        .route("/api/scheduler/stop", post(stop_scheduler))
        .route("/api/scheduler/mode", post(set_mode))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/:id", get(get_task).put(update_task).delete(delete_task))
        .route("/api/tasks/:id/run", post(run_task))
        .route("/api/tasks/:id/cancel", post(cancel_task))
        .route("/api/tasks/:id/logs", get(task_logs))
        .route("/api/logs", get(global_logs))
        .route("/api/resource-groups", get(resource_groups))
        .route("/api/test-notification", post(test_notification))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.status())
}

async fn start_scheduler(State(state): State<AppState>) -> impl IntoResponse {
    state.engine.start().await;
    Json(json!({ "running": true }))
}

async fn stop_scheduler(State(state): State<AppState>) -> impl IntoResponse {
    state.engine.stop().await;
    Json(json!({ "running": false }))
}

#[derive(Debug, Deserialize)]
struct SetModeRequest {
    mode: String,
}

async fn set_mode(State(state): State<AppState>, Json(body): Json<SetModeRequest>) -> ApiResult<impl IntoResponse> {
    let mode = Mode::from_str(&body.mode).map_err(ApiError::InvalidSpec)?;
    state.engine.set_mode(mode).await;
    Ok(Json(json!({ "mode": mode })))
}

async fn list_tasks(State(state): State<AppState>) -> impl IntoResponse {
    let catalog = state.engine.catalog();
    let jobs: Vec<&Job> = catalog.jobs().collect();
    Json(jobs)
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    let catalog = state.engine.catalog();
    let job = catalog.job(&id).cloned().ok_or_else(|| ApiError::UnknownJob(id.clone()))?;
    let history = state.engine.terminal_history(&id);
    let live = state.engine.live_run_for_job(&id);
    Ok(Json(json!({ "job": job, "history": history, "live_run": live })))
}

async fn create_task(State(state): State<AppState>, Json(job): Json<Job>) -> ApiResult<impl IntoResponse> {
    let catalog = state.engine.catalog();
    if catalog.job(&job.id).is_some() {
        return Err(ApiError::InvalidSpec(format!("job {:?} already exists", job.id)));
    }
    mutate_catalog(&state, &catalog, |jobs, _| jobs.push(job.clone()))?;
    Ok(Json(job))
}

async fn update_task(State(state): State<AppState>, Path(id): Path<String>, Json(mut job): Json<Job>) -> ApiResult<impl IntoResponse> {
    job.id = id.clone();
    let catalog = state.engine.catalog();
    if catalog.job(&id).is_none() {
        return Err(ApiError::UnknownJob(id));
    }
    mutate_catalog(&state, &catalog, |jobs, _| {
        if let Some(slot) = jobs.iter_mut().find(|j| j.id == id) {
            *slot = job.clone();
        }
    })?;
    Ok(Json(job))
}

async fn delete_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    let catalog = state.engine.catalog();
    if catalog.job(&id).is_none() {
        return Err(ApiError::UnknownJob(id));
    }
    mutate_catalog(&state, &catalog, |jobs, _| jobs.retain(|j| j.id != id))?;
    Ok(Json(json!({ "deleted": id })))
}

async fn run_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    let run_id = state.engine.manual_run(&id)?;
    Ok(Json(json!({ "run_id": run_id })))
}

async fn cancel_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    state.engine.cancel_latest_for_job(&id)?;
    Ok(Json(json!({ "cancelled": id })))
}

#[derive(Debug, Deserialize)]
struct TailQuery {
    #[serde(default)]
    lines: Option<usize>,
}

async fn task_logs(State(state): State<AppState>, Path(id): Path<String>, Query(query): Query<TailQuery>) -> ApiResult<impl IntoResponse> {
    let run = state
        .engine
        .latest_run_for_job(&id)
        .ok_or_else(|| ApiError::UnknownJob(id.clone()))?;
    let lines = run.last_lines.to_vec();
    let tail = tail(&lines, query.lines);
    Ok(Json(json!({ "run_id": run.run_id, "lines": tail })))
}

async fn global_logs(State(state): State<AppState>, Query(query): Query<TailQuery>) -> impl IntoResponse {
    let events = state.engine.recent_events();
    Json(json!({ "lines": tail(&events, query.lines) }))
}

async fn resource_groups(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.resource_group_summaries())
}

#[derive(Debug, Deserialize)]
struct TestNotificationRequest {
    #[serde(default = "default_template")]
    payload_template_id: String,
}

fn default_template() -> String {
    "test".to_string()
}

async fn test_notification(State(state): State<AppState>, Json(body): Json<TestNotificationRequest>) -> impl IntoResponse {
    info!(payload_template_id = %body.payload_template_id, "synthetic test notification dispatched");
    state.engine.test_notification(body.payload_template_id.clone()).await;
    Json(json!({ "dispatched": true, "payload_template_id": body.payload_template_id }))
}

fn tail(lines: &[String], limit: Option<usize>) -> Vec<String> {
    let limit = limit.unwrap_or(200);
    let start = lines.len().saturating_sub(limit);
    lines[start..].to_vec()
}

/// Clone the current catalog's jobs/groups out to plain `Vec`s, let `f` edit
/// them, then validate and publish the result through the engine in one step.
fn mutate_catalog(state: &AppState, catalog: &Catalog, f: impl FnOnce(&mut Vec<Job>, &mut Vec<ResourceGroupSpec>)) -> ApiResult<()> {
    let mut jobs: Vec<Job> = catalog.jobs().cloned().collect();
    let mut groups: Vec<ResourceGroupSpec> = catalog.resource_groups().cloned().collect();
    f(&mut jobs, &mut groups);
    state.engine.publish_catalog(jobs, groups).map_err(ApiError::from)
}
