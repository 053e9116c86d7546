pub mod rest;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::seq::SliceRandom;
use tracing::info;

use crate::shared::config::CoordinatorConfig;
use crate::shared::store::SessionStore;

/// Per-call forwarding timeouts. Health checks stay short so routing
/// decisions never hang on a dead worker.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);
pub const GET_SESSION_TIMEOUT: Duration = Duration::from_secs(5);
pub const CREATE_SESSION_TIMEOUT: Duration = Duration::from_secs(10);
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);
pub const EXECUTE_TIMEOUT: Duration = Duration::from_secs(60);
pub const FILE_TIMEOUT: Duration = Duration::from_secs(60);

fn worker_key(session_id: &str) -> String {
    format!("session:{session_id}:worker")
}

fn thread_session_key(thread_id: &str) -> String {
    format!("thread:{thread_id}:session")
}

/// Uniform random choice among the healthy set.
fn choose_worker(healthy: &[String]) -> Option<String> {
    healthy.choose(&mut rand::thread_rng()).cloned()
}

/// Stateless router over a set of workers. All affinity lives in the shared
/// store, so any number of coordinator replicas can serve the same fleet.
pub struct CoordinatorState {
    pub config: CoordinatorConfig,
    pub client: reqwest::Client,
    store: Arc<dyn SessionStore>,
}

impl CoordinatorState {
    pub fn new(config: CoordinatorConfig, store: Arc<dyn SessionStore>) -> Self {
        info!("Coordinator managing {} workers", config.workers.len());
        for (i, worker) in config.workers.iter().enumerate() {
            info!("  Worker {}: {}", i + 1, worker);
        }

        Self {
            config,
            client: reqwest::Client::new(),
            store,
        }
    }

    /// Poll every configured worker's /health with a short timeout.
    pub async fn healthy_workers(&self) -> Vec<String> {
        let checks = self.config.workers.iter().map(|worker| {
            let client = self.client.clone();
            let worker = worker.clone();
            async move {
                let healthy = client
                    .get(format!("{worker}/health"))
                    .timeout(HEALTH_TIMEOUT)
                    .send()
                    .await
                    .map(|response| response.status().is_success())
                    .unwrap_or(false);
                healthy.then_some(worker)
            }
        });

        futures::future::join_all(checks)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Pick a worker for a brand-new session.
    pub async fn select_worker(&self) -> Option<String> {
        choose_worker(&self.healthy_workers().await)
    }

    pub async fn worker_for_session(&self, session_id: &str) -> Result<Option<String>> {
        self.store.get(&worker_key(session_id)).await
    }

    pub async fn session_for_thread(&self, thread_id: &str) -> Result<Option<String>> {
        self.store.get(&thread_session_key(thread_id)).await
    }

    pub async fn record_affinity(&self, session_id: &str, worker: &str) -> Result<()> {
        self.store
            .set_with_ttl(&worker_key(session_id), worker, self.config.session_timeout())
            .await
    }

    pub async fn record_thread_session(&self, thread_id: &str, session_id: &str) -> Result<()> {
        self.store
            .set_with_ttl(
                &thread_session_key(thread_id),
                session_id,
                self.config.session_timeout(),
            )
            .await
    }

    pub async fn forget_session(&self, session_id: &str) -> Result<()> {
        self.store.delete(&worker_key(session_id)).await
    }
}
