use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{middleware, Router};
use tower_http::trace::TraceLayer;

use crate::worker::rest::{handlers, middleware::request_logging};
use crate::worker::WorkerState;

pub fn create_router(state: Arc<WorkerState>) -> Router {
    // Uploads are bounded by the workspace quota, not axum's 2 MB default
    let upload_limit = state.config.limits.max_file_size() as usize + 1024 * 1024;

    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/create_session", post(handlers::sessions::create_session))
        .route("/get_session", get(handlers::sessions::get_session))
        .route("/execute", post(handlers::execute::execute))
        .route("/upload_file", post(handlers::files::upload_file))
        .route("/download_file", post(handlers::files::download_file))
        .route("/list_files", get(handlers::files::list_files))
        .route("/cleanup", post(handlers::sessions::cleanup))
        .route(
            "/status/{session_id}",
            get(handlers::sessions::session_status),
        )
        .layer(DefaultBodyLimit::max(upload_limit))
        .layer(middleware::from_fn(request_logging))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
