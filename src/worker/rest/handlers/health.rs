use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::json;

use crate::worker::WorkerState;

pub async fn health(State(state): State<Arc<WorkerState>>) -> Json<serde_json::Value> {
    let pool = state.pool.stats();

    // Session counts are only knowable with the in-process index; Redis
    // expires entries on its own
    let active_sessions = match state.sessions.active_sessions() {
        Some(count) => json!(count),
        None => json!("N/A (redis)"),
    };

    Json(json!({
        "status": "healthy",
        "worker_id": state.config.worker_id,
        "pool": pool,
        "active_sessions": active_sessions,
        "config": {
            "pool_size": state.config.pool.target_size,
            "max_pool_size": state.config.pool.max_size,
            "aggressive_cleanup": state.config.pool.aggressive_cleanup,
        },
    }))
}
