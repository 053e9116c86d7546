use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::shared::config::PoolOptions;
use crate::worker::runtime::ContainerRuntime;

/// Hybrid pre-warm / on-demand container pool.
///
/// Warm containers sit on a LIFO stack; leases are tracked in `allocated`.
/// A single mutex guards both collections and the in-flight creation count;
/// engine calls are always issued outside the critical section.
pub struct ContainerPool {
    runtime: Arc<dyn ContainerRuntime>,
    options: PoolOptions,
    sandbox_user: String,
    workspace_dir: String,
    state: Mutex<PoolState>,
    refill_pending: AtomicBool,
}

#[derive(Default)]
struct PoolState {
    available: Vec<String>,
    allocated: HashMap<String, Instant>,
    creating: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    pub available: usize,
    pub allocated: usize,
    pub total: usize,
    pub max: usize,
}

impl ContainerPool {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        options: PoolOptions,
        sandbox_user: String,
        workspace_dir: String,
    ) -> Self {
        Self {
            runtime,
            options,
            sandbox_user,
            workspace_dir,
            state: Mutex::new(PoolState::default()),
            refill_pending: AtomicBool::new(false),
        }
    }

    /// Pre-warm the pool up to its target size. Best-effort: individual
    /// create failures are logged and skipped, so the pool may come up
    /// smaller than configured.
    pub async fn initialize(&self) {
        info!(
            "Initializing container pool with {} containers",
            self.options.target_size
        );

        let mut ready = 0;
        for i in 0..self.options.target_size {
            match self.runtime.create_container().await {
                Ok(id) => {
                    self.state.lock().unwrap().available.push(id);
                    ready += 1;
                    info!("Container {}/{} ready", i + 1, self.options.target_size);
                }
                Err(e) => {
                    warn!("Failed to pre-warm container: {}", e);
                }
            }
        }

        info!("Pool initialized with {} containers", ready);
    }

    /// Lease a container. Pops a warm one when possible (scheduling a
    /// debounced refill), creates on demand when below the cap, and returns
    /// `None` once `max_size` is reached.
    pub async fn acquire(self: &Arc<Self>) -> anyhow::Result<Option<String>> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(id) = state.available.pop() {
                state.allocated.insert(id.clone(), Instant::now());
                drop(state);
                self.schedule_refill();
                return Ok(Some(id));
            }

            let in_use = state.allocated.len() + state.creating;
            if in_use >= self.options.max_size {
                warn!("Pool at max capacity ({})", self.options.max_size);
                return Ok(None);
            }
            state.creating += 1;
        }

        info!("Pool empty, creating container on demand");
        let created = self.runtime.create_container().await;

        let mut state = self.state.lock().unwrap();
        state.creating -= 1;
        match created {
            Ok(id) => {
                state.allocated.insert(id.clone(), Instant::now());
                Ok(Some(id))
            }
            Err(e) => {
                warn!("On-demand container creation failed: {}", e);
                Ok(None)
            }
        }
    }

    /// Return a leased container. The lease is dropped before anything that
    /// can fail, so an id never leaks from `allocated`. The workspace is
    /// wiped, then the placement rule decides between pooling and destroying.
    pub async fn release(&self, container_id: &str) {
        self.state.lock().unwrap().allocated.remove(container_id);

        let reset = format!(
            "rm -rf {dir}/* {dir}/.* 2>/dev/null || true",
            dir = self.workspace_dir
        );
        let reset_result = self
            .runtime
            .exec(
                container_id,
                vec!["sh".to_string(), "-c".to_string(), reset],
                Some(&self.sandbox_user),
                None,
            )
            .await;

        if let Err(e) = reset_result {
            warn!(
                "Workspace reset failed for {}, destroying container: {}",
                container_id, e
            );
            self.destroy(container_id).await;
            return;
        }

        let keep = {
            let mut state = self.state.lock().unwrap();
            let current = state.available.len();
            let total = current + state.allocated.len();
            let keep = keep_on_release(&self.options, current, total);
            if keep {
                state.available.push(container_id.to_string());
            }
            keep
        };

        if !keep {
            info!("Destroying surplus container {}", container_id);
            self.destroy(container_id).await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock().unwrap();
        PoolStats {
            available: state.available.len(),
            allocated: state.allocated.len(),
            total: state.available.len() + state.allocated.len(),
            max: self.options.max_size,
        }
    }

    /// Destroy every container the pool knows about. Used at shutdown.
    pub async fn cleanup_all(&self) {
        let ids: Vec<String> = {
            let mut state = self.state.lock().unwrap();
            let mut ids: Vec<String> = state.available.drain(..).collect();
            ids.extend(state.allocated.drain().map(|(id, _)| id));
            ids
        };

        info!("Cleaning up {} pooled containers", ids.len());
        for id in ids {
            self.destroy(&id).await;
        }
    }

    /// Debounced background refill back up to `min_size`.
    fn schedule_refill(self: &Arc<Self>) {
        if self.refill_pending.swap(true, Ordering::SeqCst) {
            return;
        }

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(pool.options.refill_delay).await;
            pool.refill_pending.store(false, Ordering::SeqCst);

            loop {
                {
                    let mut state = pool.state.lock().unwrap();
                    let total = state.available.len() + state.allocated.len() + state.creating;
                    if state.available.len() >= pool.options.min_size
                        || total >= pool.options.max_size
                    {
                        break;
                    }
                    state.creating += 1;
                }

                let created = pool.runtime.create_container().await;
                let mut state = pool.state.lock().unwrap();
                state.creating -= 1;
                match created {
                    Ok(id) => {
                        state.available.push(id);
                    }
                    Err(e) => {
                        warn!("Pool refill create failed: {}", e);
                        break;
                    }
                }
            }
        });
    }

    async fn destroy(&self, container_id: &str) {
        if let Err(e) = self.runtime.remove_container(container_id).await {
            warn!("Failed to destroy container {}: {}", container_id, e);
        }
    }
}

/// Placement rule for a returned container.
///
/// `current` is the warm count, `total` is warm + allocated. Aggressive mode
/// keeps only what refill targets require; plain mode pools anything under
/// the cap.
fn keep_on_release(options: &PoolOptions, current: usize, total: usize) -> bool {
    if options.aggressive_cleanup {
        if current < options.min_size {
            true
        } else {
            current < options.target_size && total < options.max_size
        }
    } else {
        current < options.max_size
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::worker::runtime::testing::MockRuntime;

    fn options(target: usize, min: usize, max: usize, aggressive: bool) -> PoolOptions {
        PoolOptions {
            target_size: target,
            min_size: min,
            max_size: max,
            aggressive_cleanup: aggressive,
            refill_delay: Duration::from_millis(5),
        }
    }

    fn pool_with(runtime: Arc<MockRuntime>, options: PoolOptions) -> Arc<ContainerPool> {
        Arc::new(ContainerPool::new(
            runtime,
            options,
            "sandboxuser".to_string(),
            "/workspace".to_string(),
        ))
    }

    #[tokio::test]
    async fn initialize_prewarms_to_target() {
        let runtime = Arc::new(MockRuntime::new());
        let pool = pool_with(runtime, options(3, 1, 10, true));

        pool.initialize().await;

        let stats = pool.stats();
        assert_eq!(stats.available, 3);
        assert_eq!(stats.allocated, 0);
        assert_eq!(stats.total, 3);
    }

    #[tokio::test]
    async fn initialize_tolerates_create_failures() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.fail_creates.store(true, Ordering::SeqCst);
        let pool = pool_with(Arc::clone(&runtime), options(3, 1, 10, true));

        pool.initialize().await;
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test]
    async fn acquire_prefers_warm_containers() {
        let runtime = Arc::new(MockRuntime::new());
        let pool = pool_with(runtime, options(2, 1, 10, true));
        pool.initialize().await;

        let id = pool.acquire().await.unwrap().unwrap();
        let stats = pool.stats();
        assert_eq!(stats.available, 1);
        assert_eq!(stats.allocated, 1);
        assert!(id.starts_with("mock-"));
    }

    #[tokio::test]
    async fn acquire_creates_on_demand_when_empty() {
        let runtime = Arc::new(MockRuntime::new());
        let pool = pool_with(runtime, options(0, 0, 5, true));

        let id = pool.acquire().await.unwrap();
        assert!(id.is_some());
        assert_eq!(pool.stats().allocated, 1);
    }

    #[tokio::test]
    async fn acquire_refuses_past_max_size() {
        let runtime = Arc::new(MockRuntime::new());
        let pool = pool_with(runtime, options(0, 0, 2, true));

        assert!(pool.acquire().await.unwrap().is_some());
        assert!(pool.acquire().await.unwrap().is_some());
        assert!(pool.acquire().await.unwrap().is_none());

        let stats = pool.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.max, 2);
    }

    #[tokio::test]
    async fn capacity_frees_up_after_release() {
        let runtime = Arc::new(MockRuntime::new());
        let pool = pool_with(runtime, options(0, 0, 1, false));

        let id = pool.acquire().await.unwrap().unwrap();
        assert!(pool.acquire().await.unwrap().is_none());

        pool.release(&id).await;
        assert!(pool.acquire().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn release_resets_workspace_before_pooling() {
        let runtime = Arc::new(MockRuntime::new());
        let pool = pool_with(Arc::clone(&runtime), options(1, 0, 5, false));

        let id = pool.acquire().await.unwrap().unwrap();
        pool.release(&id).await;

        let execs = runtime.exec_log();
        assert_eq!(execs.len(), 1);
        let (target, cmd) = &execs[0];
        assert_eq!(target, &id);
        assert!(cmd[2].contains("rm -rf /workspace/*"));

        // Back on the warm stack, not leaked
        let stats = pool.stats();
        assert_eq!(stats.available, 1);
        assert_eq!(stats.allocated, 0);
    }

    #[tokio::test]
    async fn aggressive_release_destroys_surplus() {
        let runtime = Arc::new(MockRuntime::new());
        // target 1 warm container; second release should destroy
        let pool = pool_with(Arc::clone(&runtime), options(1, 0, 10, true));

        let a = pool.acquire().await.unwrap().unwrap();
        let b = pool.acquire().await.unwrap().unwrap();

        pool.release(&a).await;
        assert_eq!(pool.stats().available, 1);

        pool.release(&b).await;
        assert_eq!(pool.stats().available, 1);
        assert_eq!(runtime.removed_ids(), vec![b]);
    }

    #[tokio::test]
    async fn plain_release_pools_up_to_max() {
        let runtime = Arc::new(MockRuntime::new());
        let pool = pool_with(Arc::clone(&runtime), options(0, 0, 2, false));

        let a = pool.acquire().await.unwrap().unwrap();
        let b = pool.acquire().await.unwrap().unwrap();
        pool.release(&a).await;
        pool.release(&b).await;

        assert_eq!(pool.stats().available, 2);
        assert!(runtime.removed_ids().is_empty());
    }

    #[tokio::test]
    async fn refill_restores_minimum_after_acquire() {
        let runtime = Arc::new(MockRuntime::new());
        let pool = pool_with(runtime, options(2, 2, 10, true));
        pool.initialize().await;

        let _a = pool.acquire().await.unwrap().unwrap();
        assert_eq!(pool.stats().available, 1);

        // Refill task fires after the 5ms debounce
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.stats().available, 2);
    }

    #[tokio::test]
    async fn cleanup_all_empties_both_collections() {
        let runtime = Arc::new(MockRuntime::new());
        let pool = pool_with(Arc::clone(&runtime), options(2, 0, 10, false));
        pool.initialize().await;
        let _leased = pool.acquire().await.unwrap().unwrap();

        pool.cleanup_all().await;

        let stats = pool.stats();
        assert_eq!(stats.total, 0);
        assert_eq!(runtime.removed_ids().len(), 2);
    }

    #[test]
    fn placement_rule_table() {
        let aggressive = options(5, 2, 10, true);
        // Urgent refill below min
        assert!(keep_on_release(&aggressive, 1, 8));
        // Below target with headroom
        assert!(keep_on_release(&aggressive, 3, 9));
        // At target: destroy
        assert!(!keep_on_release(&aggressive, 5, 6));
        // Below target but at max: destroy
        assert!(!keep_on_release(&aggressive, 4, 10));

        let plain = options(5, 2, 10, false);
        assert!(keep_on_release(&plain, 9, 10));
        assert!(!keep_on_release(&plain, 10, 10));
    }
}
