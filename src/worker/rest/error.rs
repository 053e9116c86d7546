use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::worker::files::FileError;
use crate::worker::sessions::SessionError;
use crate::worker::validator::CommandError;

/// Closed error taxonomy surfaced to clients. The `kind` string is the
/// contract: the SDK keys its retry behavior on it, not on the status code.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    InvalidCommand(CommandError),
    SessionExpired,
    SessionNotFound,
    Capacity,
    FileTooLarge(String),
    TooManyFiles(String),
    WorkspaceFull(String),
    NotFound(String),
    Execution(String),
    NoWorkers,
    Internal(anyhow::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    kind: &'static str,
}

impl ApiError {
    fn status_kind_message(self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::InvalidCommand(err) => (
                StatusCode::BAD_REQUEST,
                "INVALID_COMMAND",
                format!("{err} ({})", err.kind()),
            ),
            ApiError::SessionExpired => (
                StatusCode::NOT_FOUND,
                "SESSION_EXPIRED",
                "Invalid or expired session".to_string(),
            ),
            ApiError::SessionNotFound => (
                StatusCode::NOT_FOUND,
                "SESSION_NOT_FOUND",
                "Session not found".to_string(),
            ),
            ApiError::Capacity => (
                StatusCode::SERVICE_UNAVAILABLE,
                "CAPACITY",
                "Pool at max capacity, try again later".to_string(),
            ),
            ApiError::FileTooLarge(msg) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "FILE_TOO_LARGE", msg)
            }
            ApiError::TooManyFiles(msg) => {
                (StatusCode::INSUFFICIENT_STORAGE, "TOO_MANY_FILES", msg)
            }
            ApiError::WorkspaceFull(msg) => {
                (StatusCode::INSUFFICIENT_STORAGE, "WORKSPACE_FULL", msg)
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::Execution(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "EXECUTION_ERROR",
                msg,
            ),
            ApiError::NoWorkers => (
                StatusCode::SERVICE_UNAVAILABLE,
                "NO_WORKERS",
                "No healthy workers available".to_string(),
            ),
            ApiError::Internal(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "EXECUTION_ERROR",
                format!("Internal error: {e}"),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, kind, error) = self.status_kind_message();
        (status, Json(ErrorResponse { error, kind })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

impl From<CommandError> for ApiError {
    fn from(e: CommandError) -> Self {
        ApiError::InvalidCommand(e)
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Capacity => ApiError::Capacity,
            SessionError::Expired => ApiError::SessionExpired,
            SessionError::Internal(e) => ApiError::Internal(e),
        }
    }
}

impl From<FileError> for ApiError {
    fn from(e: FileError) -> Self {
        match e {
            FileError::InvalidFilename(_) => ApiError::BadRequest(e.to_string()),
            FileError::TooLarge(_) => ApiError::FileTooLarge(e.to_string()),
            FileError::TooManyFiles(_) => ApiError::TooManyFiles(e.to_string()),
            FileError::WorkspaceFull(_) => ApiError::WorkspaceFull(e.to_string()),
            FileError::NotFound => ApiError::NotFound("File not found".to_string()),
            FileError::Internal(e) => ApiError::Internal(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_the_taxonomy() {
        let cases = [
            (ApiError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (
                ApiError::InvalidCommand(CommandError::Empty),
                StatusCode::BAD_REQUEST,
            ),
            (ApiError::SessionExpired, StatusCode::NOT_FOUND),
            (ApiError::SessionNotFound, StatusCode::NOT_FOUND),
            (ApiError::Capacity, StatusCode::SERVICE_UNAVAILABLE),
            (
                ApiError::FileTooLarge("x".into()),
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (
                ApiError::TooManyFiles("x".into()),
                StatusCode::INSUFFICIENT_STORAGE,
            ),
            (
                ApiError::WorkspaceFull("x".into()),
                StatusCode::INSUFFICIENT_STORAGE,
            ),
            (ApiError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                ApiError::Execution("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (ApiError::NoWorkers, StatusCode::SERVICE_UNAVAILABLE),
        ];

        for (error, expected) in cases {
            let (status, _, _) = error.status_kind_message();
            assert_eq!(status, expected);
        }
    }

    #[test]
    fn expired_and_not_found_kinds_stay_distinct() {
        let (_, expired_kind, _) = ApiError::SessionExpired.status_kind_message();
        let (_, missing_kind, _) = ApiError::SessionNotFound.status_kind_message();
        assert_eq!(expired_kind, "SESSION_EXPIRED");
        assert_eq!(missing_kind, "SESSION_NOT_FOUND");
    }

    #[test]
    fn validator_rejection_names_the_pattern() {
        let error = ApiError::InvalidCommand(CommandError::ForbiddenPattern(
            r"(?i)\bcurl\b".to_string(),
        ));
        let (_, kind, message) = error.status_kind_message();
        assert_eq!(kind, "INVALID_COMMAND");
        assert!(message.contains("curl"));
    }
}
