//! Operations REST API
//!
//! Read-only views of the scheduler and node queues, plus the two operator actions
//! the CLI also offers: run a job now, and force-release a stuck lock.

use crate::{
    cron::{CronScheduler, JobSelector, ReleaseOutcome},
    error::{ErrorKind, SyncError},
    node::NodeService,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;

/// Shared state for the ops endpoints
#[derive(Clone)]
pub struct OpsState {
    pub cron: Arc<CronScheduler>,
    pub nodes: Arc<NodeService>,
}

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn api_error(e: SyncError) -> (StatusCode, Json<Value>) {
    let status = match e.kind() {
        ErrorKind::Config => StatusCode::NOT_FOUND,
        ErrorKind::Integrity => StatusCode::CONFLICT,
        ErrorKind::Node | ErrorKind::Sync | ErrorKind::Persistence => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    tracing::error!("❌ Ops request failed: {}", e);
    (status, Json(json!({ "error": e.to_string(), "kind": e.code() })))
}

/// Create ops API routes
///
/// Routes:
/// - GET /api/cron - job schedule, lock and overdue state
/// - POST /api/cron/{job}/run - run one job now, under its lock
/// - POST /api/cron/{job}/release - force-release a stale lock
/// - GET /api/nodes/{id}/pending - pending updates and actions of a node
pub fn create_ops_routes() -> Router<OpsState> {
    Router::new()
        .route("/api/cron", get(list_jobs))
        .route("/api/cron/{job}/run", post(run_job))
        .route("/api/cron/{job}/release", post(release_job))
        .route("/api/nodes/{id}/pending", get(pending_for_node))
}

/// GET /api/cron
async fn list_jobs(State(state): State<OpsState>) -> ApiResult {
    let jobs = state.cron.status().await.map_err(api_error)?;
    Ok(Json(json!({ "jobs": jobs })))
}

/// POST /api/cron/{job}/run
async fn run_job(State(state): State<OpsState>, Path(job): Path<String>) -> ApiResult {
    tracing::info!("🎯 Manual run requested for job {}", job);
    let report = state
        .cron
        .tick(Utc::now(), &JobSelector::Named(job))
        .await
        .map_err(api_error)?;
    Ok(Json(json!(report)))
}

/// POST /api/cron/{job}/release
async fn release_job(State(state): State<OpsState>, Path(job): Path<String>) -> ApiResult {
    let outcome = state
        .cron
        .admin_release_lock(&job, Utc::now())
        .await
        .map_err(api_error)?;

    match outcome {
        ReleaseOutcome::Refused { .. } | ReleaseOutcome::Failed => {
            Err((StatusCode::CONFLICT, Json(json!({ "job": job, "result": outcome }))))
        }
        ReleaseOutcome::NotLocked | ReleaseOutcome::Released => {
            Ok(Json(json!({ "job": job, "result": outcome })))
        }
    }
}

/// GET /api/nodes/{id}/pending
async fn pending_for_node(State(state): State<OpsState>, Path(node_id): Path<i64>) -> ApiResult {
    let updates = state
        .nodes
        .get_pending_updates(node_id)
        .await
        .map_err(api_error)?;
    let actions = state
        .nodes
        .get_pending_actions(node_id)
        .await
        .map_err(api_error)?;

    Ok(Json(json!({
        "node_id": node_id,
        "update_count": updates.len(),
        "action_count": actions.len(),
        "updates": updates,
        "actions": actions,
    })))
}
