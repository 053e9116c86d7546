use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::worker::rest::error::{ApiError, ApiResult};
use crate::worker::validator::validate_command;
use crate::worker::WorkerState;

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub session_id: String,
    pub command: String,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u64,
}

/// POST /execute: validate, dispatch into the session's container, capture
/// demuxed output with timing.
pub async fn execute(
    State(state): State<Arc<WorkerState>>,
    Json(request): Json<ExecuteRequest>,
) -> ApiResult<Json<ExecuteResponse>> {
    // Validation happens before the session is touched, so a rejected
    // command leaves last_activity alone
    validate_command(&request.command)?;

    let record = state
        .sessions
        .get(&request.session_id)
        .await?
        .ok_or(ApiError::SessionExpired)?;

    let timeout_secs = request
        .timeout
        .unwrap_or(state.config.default_command_timeout);
    // Margin on top of the advisory command timeout
    let deadline = Duration::from_secs(timeout_secs + 5);

    let start = Instant::now();
    let output = tokio::time::timeout(
        deadline,
        state.runtime.exec(
            &record.container_id,
            vec![
                "bash".to_string(),
                "-c".to_string(),
                request.command.clone(),
            ],
            Some(&state.config.container.sandbox_user),
            Some(&state.config.container.workspace_dir),
        ),
    )
    .await
    .map_err(|_| ApiError::Execution(format!("command timed out after {timeout_secs}s")))?
    .map_err(|e| ApiError::Execution(e.to_string()))?;

    let execution_time_ms = start.elapsed().as_millis() as u64;

    if let Err(e) = state.sessions.touch(&request.session_id).await {
        warn!("Failed to refresh session {}: {}", request.session_id, e);
    }

    Ok(Json(ExecuteResponse {
        exit_code: output.exit_code,
        stdout: output.stdout,
        stderr: output.stderr,
        execution_time_ms,
    }))
}
