use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::coordinator::{
    CoordinatorState, CLEANUP_TIMEOUT, CREATE_SESSION_TIMEOUT, EXECUTE_TIMEOUT, FILE_TIMEOUT,
    GET_SESSION_TIMEOUT,
};
use crate::worker::rest::error::{ApiError, ApiResult};
use crate::worker::rest::middleware::request_logging;

pub fn create_router(state: Arc<CoordinatorState>) -> Router {
    let upload_limit = 256 * 1024 * 1024;

    Router::new()
        .route("/health", get(health))
        .route("/create_session", post(create_session))
        .route("/get_session", get(get_session))
        .route("/execute", post(execute))
        .route("/upload_file", post(upload_file))
        .route("/download_file", post(download_file))
        .route("/list_files", get(list_files))
        .route("/cleanup", post(cleanup))
        .route("/status/{session_id}", get(session_status))
        .layer(axum::extract::DefaultBodyLimit::max(upload_limit))
        .layer(middleware::from_fn(request_logging))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ThreadQuery {
    thread_id: String,
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    session_id: String,
}

/// Relay a worker response verbatim: status, body, and the headers that
/// matter for JSON and file downloads.
async fn passthrough(response: reqwest::Response) -> ApiResult<Response> {
    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut headers = axum::http::HeaderMap::new();
    for name in [header::CONTENT_TYPE, header::CONTENT_DISPOSITION] {
        let value = response
            .headers()
            .get(name.as_str())
            .and_then(|v| v.to_str().ok())
            .and_then(|v| axum::http::HeaderValue::from_str(v).ok());
        if let Some(value) = value {
            headers.insert(name, value);
        }
    }

    let body = response.bytes().await.map_err(forward_error)?;
    Ok((status, headers, body.to_vec()).into_response())
}

fn forward_error(e: reqwest::Error) -> ApiError {
    ApiError::Execution(format!("Worker communication failed: {e}"))
}

/// Transport failures on session-bound routes read as "no worker has this
/// session": the owning node is gone, and the client's recovery is to
/// recreate, which keys off SESSION_NOT_FOUND.
fn session_forward_error(e: reqwest::Error) -> ApiError {
    if e.is_connect() {
        ApiError::SessionNotFound
    } else {
        forward_error(e)
    }
}

async fn resolve_worker(state: &CoordinatorState, session_id: &str) -> ApiResult<String> {
    state
        .worker_for_session(session_id)
        .await?
        .ok_or(ApiError::SessionNotFound)
}

/// GET /health: coordinator view of the fleet.
async fn health(State(state): State<Arc<CoordinatorState>>) -> Json<serde_json::Value> {
    let healthy = state.healthy_workers().await;

    let workers: Vec<serde_json::Value> = state
        .config
        .workers
        .iter()
        .map(|worker| {
            let status = if healthy.contains(worker) {
                "healthy"
            } else {
                "unhealthy"
            };
            json!({ "url": worker, "status": status })
        })
        .collect();

    Json(json!({
        "status": "healthy",
        "workers_total": state.config.workers.len(),
        "workers_healthy": healthy.len(),
        "workers": workers,
    }))
}

/// POST /create_session: place a new session on a healthy worker and record
/// the affinity so every later call lands on the same node.
async fn create_session(
    State(state): State<Arc<CoordinatorState>>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Response> {
    let worker = state.select_worker().await.ok_or(ApiError::NoWorkers)?;

    let response = state
        .client
        .post(format!("{worker}/create_session"))
        .timeout(CREATE_SESSION_TIMEOUT)
        .json(&body)
        .send()
        .await
        .map_err(forward_error)?;

    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut payload: serde_json::Value = response.json().await.map_err(forward_error)?;

    if status == StatusCode::OK || status == StatusCode::CREATED {
        if let Some(session_id) = payload.get("session_id").and_then(|v| v.as_str()) {
            let session_id = session_id.to_string();
            state.record_affinity(&session_id, &worker).await?;
            if let Some(thread_id) = body.get("thread_id").and_then(|v| v.as_str()) {
                state.record_thread_session(thread_id, &session_id).await?;
            }
            info!("Session {} placed on {}", session_id, worker);
        }

        if let Some(map) = payload.as_object_mut() {
            map.insert("worker".to_string(), json!(worker));
        }
    }

    Ok((status, Json(payload)).into_response())
}

/// GET /get_session?thread_id=: cached lookup first, then sequential
/// fan-out across the healthy fleet; the first hit backfills the cache.
async fn get_session(
    State(state): State<Arc<CoordinatorState>>,
    Query(query): Query<ThreadQuery>,
) -> ApiResult<Response> {
    if let Some(session_id) = state.session_for_thread(&query.thread_id).await? {
        if let Some(worker) = state.worker_for_session(&session_id).await? {
            let cached = state
                .client
                .get(format!("{worker}/get_session"))
                .timeout(GET_SESSION_TIMEOUT)
                .query(&[("thread_id", query.thread_id.as_str())])
                .send()
                .await;
            if let Ok(response) = cached {
                if response.status().is_success() {
                    return passthrough(response).await;
                }
            }
        }
    }

    // Cache miss: some worker may still hold this thread's session
    for worker in state.healthy_workers().await {
        let result = state
            .client
            .get(format!("{worker}/get_session"))
            .timeout(GET_SESSION_TIMEOUT)
            .query(&[("thread_id", query.thread_id.as_str())])
            .send()
            .await;

        let response = match result {
            Ok(response) if response.status().is_success() => response,
            Ok(_) => continue,
            Err(e) => {
                warn!("get_session probe to {} failed: {}", worker, e);
                continue;
            }
        };

        let payload: serde_json::Value = response.json().await.map_err(forward_error)?;
        if let Some(session_id) = payload.get("session_id").and_then(|v| v.as_str()) {
            state.record_affinity(session_id, &worker).await?;
            state
                .record_thread_session(&query.thread_id, session_id)
                .await?;
        }
        return Ok((StatusCode::OK, Json(payload)).into_response());
    }

    Err(ApiError::SessionNotFound)
}

/// POST /execute: forward to the session's worker.
async fn execute(
    State(state): State<Arc<CoordinatorState>>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Response> {
    forward_session_post(&state, body, "execute", EXECUTE_TIMEOUT).await
}

/// POST /download_file: forward; the body passes through as bytes.
async fn download_file(
    State(state): State<Arc<CoordinatorState>>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Response> {
    forward_session_post(&state, body, "download_file", FILE_TIMEOUT).await
}

async fn forward_session_post(
    state: &CoordinatorState,
    body: serde_json::Value,
    endpoint: &str,
    timeout: Duration,
) -> ApiResult<Response> {
    let session_id = body
        .get("session_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApiError::BadRequest("session_id required".to_string()))?;

    let worker = resolve_worker(state, session_id).await?;

    let response = state
        .client
        .post(format!("{worker}/{endpoint}"))
        .timeout(timeout)
        .json(&body)
        .send()
        .await
        .map_err(session_forward_error)?;

    passthrough(response).await
}

/// POST /upload_file: re-send the multipart form to the owning worker.
async fn upload_file(
    State(state): State<Arc<CoordinatorState>>,
    mut multipart: Multipart,
) -> ApiResult<Response> {
    let mut session_id: Option<String> = None;
    let mut filename: Option<String> = None;
    let mut data: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        match field.name() {
            Some("session_id") => {
                session_id = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::BadRequest(e.to_string()))?,
                );
            }
            Some("file") => {
                filename = field.file_name().map(|name| name.to_string());
                data = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| ApiError::BadRequest(e.to_string()))?
                        .to_vec(),
                );
            }
            _ => {}
        }
    }

    let session_id =
        session_id.ok_or_else(|| ApiError::BadRequest("session_id required".to_string()))?;
    let data = data.ok_or_else(|| ApiError::BadRequest("No file provided".to_string()))?;
    let filename = filename.unwrap_or_else(|| "upload.bin".to_string());

    let worker = resolve_worker(&state, &session_id).await?;

    let form = reqwest::multipart::Form::new()
        .text("session_id", session_id)
        .part(
            "file",
            reqwest::multipart::Part::bytes(data).file_name(filename),
        );

    let response = state
        .client
        .post(format!("{worker}/upload_file"))
        .timeout(FILE_TIMEOUT)
        .multipart(form)
        .send()
        .await
        .map_err(session_forward_error)?;

    passthrough(response).await
}

/// GET /list_files?session_id=
async fn list_files(
    State(state): State<Arc<CoordinatorState>>,
    Query(query): Query<SessionQuery>,
) -> ApiResult<Response> {
    let worker = resolve_worker(&state, &query.session_id).await?;

    let response = state
        .client
        .get(format!("{worker}/list_files"))
        .timeout(GET_SESSION_TIMEOUT)
        .query(&[("session_id", query.session_id.as_str())])
        .send()
        .await
        .map_err(session_forward_error)?;

    passthrough(response).await
}

/// POST /cleanup: forward, then drop the affinity entry.
async fn cleanup(
    State(state): State<Arc<CoordinatorState>>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Response> {
    let session_id = body
        .get("session_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApiError::BadRequest("session_id required".to_string()))?
        .to_string();

    let worker = resolve_worker(&state, &session_id).await?;

    let response = state
        .client
        .post(format!("{worker}/cleanup"))
        .timeout(CLEANUP_TIMEOUT)
        .json(&body)
        .send()
        .await
        .map_err(session_forward_error)?;

    if response.status().is_success() {
        state.forget_session(&session_id).await?;
    }

    passthrough(response).await
}

/// GET /status/{session_id}
async fn session_status(
    State(state): State<Arc<CoordinatorState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Response> {
    let worker = resolve_worker(&state, &session_id).await?;

    let response = state
        .client
        .get(format!("{worker}/status/{session_id}"))
        .timeout(GET_SESSION_TIMEOUT)
        .send()
        .await
        .map_err(session_forward_error)?;

    passthrough(response).await
}
