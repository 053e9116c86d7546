use std::sync::Arc;

use axum::extract::{Multipart, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::worker::rest::error::{ApiError, ApiResult};
use crate::worker::WorkerState;

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    pub session_id: String,
    pub filename: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub session_id: String,
}

/// POST /upload_file: multipart form with `session_id` and `file` fields.
pub async fn upload_file(
    State(state): State<Arc<WorkerState>>,
    mut multipart: Multipart,
) -> ApiResult<Json<serde_json::Value>> {
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
    let filename =
        filename.ok_or_else(|| ApiError::BadRequest("file field has no filename".to_string()))?;

    let record = state
        .sessions
        .get(&session_id)
        .await?
        .ok_or(ApiError::SessionExpired)?;

    let uploaded = state
        .files
        .upload(&record.container_id, &filename, &data)
        .await?;

    if let Err(e) = state.sessions.touch(&session_id).await {
        warn!("Failed to refresh session {}: {}", session_id, e);
    }

    Ok(Json(json!({
        "status": "uploaded",
        "filename": uploaded.filename,
        "path": uploaded.path,
        "size_bytes": uploaded.size_bytes,
    })))
}

/// POST /download_file: returns the raw bytes as an attachment.
pub async fn download_file(
    State(state): State<Arc<WorkerState>>,
    Json(request): Json<DownloadRequest>,
) -> ApiResult<impl IntoResponse> {
    let record = state
        .sessions
        .get(&request.session_id)
        .await?
        .ok_or(ApiError::SessionExpired)?;

    let bytes = state
        .files
        .download(&record.container_id, &request.filename)
        .await?;

    let disposition = format!("attachment; filename=\"{}\"", request.filename);
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    ))
}

/// GET /list_files?session_id=
pub async fn list_files(
    State(state): State<Arc<WorkerState>>,
    Query(query): Query<SessionQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let record = state
        .sessions
        .get(&query.session_id)
        .await?
        .ok_or(ApiError::SessionExpired)?;

    let listing = state.files.list(&record.container_id).await?;

    Ok(Json(json!({
        "session_id": record.session_id,
        "workspace_dir": state.config.container.workspace_dir,
        "files": listing.files,
        "total_files": listing.total_files,
        "total_size_bytes": listing.total_bytes,
    })))
}
