use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::worker::rest::error::{ApiError, ApiResult};
use crate::worker::WorkerState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub user_id: String,
    pub thread_id: String,
    #[serde(default)]
    pub timeout_minutes: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ThreadQuery {
    pub thread_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CleanupRequest {
    pub session_id: String,
}

/// POST /create_session: 201 on a fresh session, 409 when the thread
/// already has one (same body shape, `status: "existing"`).
pub async fn create_session(
    State(state): State<Arc<WorkerState>>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.thread_id.trim().is_empty() {
        return Err(ApiError::BadRequest("thread_id required".to_string()));
    }

    let ttl = request
        .timeout_minutes
        .map(|minutes| Duration::from_secs(minutes * 60))
        .unwrap_or_else(|| state.config.session_timeout());

    let handle = state
        .sessions
        .get_or_create(&request.user_id, &request.thread_id, ttl)
        .await?;

    let expires_at = handle.record.created_at
        + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
    let (status, label) = if handle.reused {
        (StatusCode::CONFLICT, "existing")
    } else {
        (StatusCode::CREATED, "created")
    };

    let body = Json(json!({
        "session_id": handle.record.session_id,
        "thread_id": handle.record.thread_id,
        "status": label,
        "workspace_dir": state.config.container.workspace_dir,
        "user": state.config.container.sandbox_user,
        "expires_at": expires_at.to_rfc3339(),
    }));

    Ok((status, body))
}

/// GET /get_session?thread_id=: resolve a live session for a thread.
pub async fn get_session(
    State(state): State<Arc<WorkerState>>,
    Query(query): Query<ThreadQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let record = state
        .sessions
        .get_by_thread(&query.thread_id)
        .await?
        .ok_or(ApiError::SessionNotFound)?;

    Ok(Json(json!({
        "session_id": record.session_id,
        "thread_id": record.thread_id,
        "status": "active",
        "created_at": record.created_at.to_rfc3339(),
        "last_activity": record.last_activity.to_rfc3339(),
        "workspace_dir": state.config.container.workspace_dir,
    })))
}

/// POST /cleanup: idempotent session teardown.
pub async fn cleanup(
    State(state): State<Arc<WorkerState>>,
    Json(request): Json<CleanupRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state.sessions.destroy(&request.session_id).await;

    Ok(Json(json!({
        "status": "cleaned_up",
        "session_id": request.session_id,
    })))
}

/// GET /status/{session_id}
pub async fn session_status(
    State(state): State<Arc<WorkerState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let record = state
        .sessions
        .get(&session_id)
        .await?
        .ok_or(ApiError::SessionNotFound)?;

    Ok(Json(json!({
        "status": "active",
        "worker": record.worker_id,
        "created_at": record.created_at.to_rfc3339(),
        "last_activity": record.last_activity.to_rfc3339(),
    })))
}
