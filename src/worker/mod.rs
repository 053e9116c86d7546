pub mod files;
pub mod pool;
pub mod rest;
pub mod runtime;
pub mod sessions;
pub mod validator;

use std::sync::Arc;

use crate::shared::config::WorkerConfig;

/// Everything the worker's request handlers need.
pub struct WorkerState {
    pub config: WorkerConfig,
    pub runtime: Arc<dyn runtime::ContainerRuntime>,
    pub pool: Arc<pool::ContainerPool>,
    pub sessions: Arc<sessions::SessionManager>,
    pub files: files::WorkspaceFiles,
}
