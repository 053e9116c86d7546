use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::shared::store::{MemoryStore, SessionStore};
use crate::worker::pool::ContainerPool;

/// One live thread↔container binding, stored as JSON in the session store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub thread_id: String,
    pub user_id: String,
    pub container_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub worker_id: String,
}

/// Result of `get_or_create`: the record plus whether it was reused.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub record: SessionRecord,
    pub reused: bool,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("container pool at capacity")]
    Capacity,
    #[error("session not found or expired")]
    Expired,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

fn session_key(session_id: &str) -> String {
    format!("session:{session_id}")
}

fn thread_key(thread_id: &str) -> String {
    format!("thread:{thread_id}")
}

/// Thread→session→container index. Containers are owned by the pool; records
/// here only carry the container id, and destruction always flows back
/// through `pool.release`.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    /// Present when running on the in-process store; enables the sweeper.
    memory: Option<Arc<MemoryStore>>,
    pool: Arc<ContainerPool>,
    worker_id: String,
    session_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        memory: Option<Arc<MemoryStore>>,
        pool: Arc<ContainerPool>,
        worker_id: String,
        session_timeout: Duration,
    ) -> Self {
        Self {
            store,
            memory,
            pool,
            worker_id,
            session_timeout,
        }
    }

    /// Resolve the session for `thread_id`, creating one when none exists.
    ///
    /// Concurrent callers racing on a fresh thread_id are serialized through
    /// the store's set-if-absent: exactly one caller publishes the mapping;
    /// losers return their container to the pool and adopt the winner's
    /// session on re-read.
    pub async fn get_or_create(
        &self,
        user_id: &str,
        thread_id: &str,
        ttl: Duration,
    ) -> Result<SessionHandle, SessionError> {
        for _attempt in 0..3 {
            if let Some(record) = self.lookup_thread(thread_id).await? {
                self.touch(&record.session_id).await.ok();
                return Ok(SessionHandle {
                    record,
                    reused: true,
                });
            }

            let container_id = self
                .pool
                .acquire()
                .await
                .map_err(SessionError::Internal)?
                .ok_or(SessionError::Capacity)?;

            let now = Utc::now();
            let record = SessionRecord {
                session_id: Uuid::new_v4().to_string(),
                thread_id: thread_id.to_string(),
                user_id: user_id.to_string(),
                container_id: container_id.clone(),
                created_at: now,
                last_activity: now,
                worker_id: self.worker_id.clone(),
            };

            let won = self
                .store
                .set_if_not_exists(&thread_key(thread_id), &record.session_id, ttl)
                .await
                .map_err(SessionError::Internal)?;

            if won {
                self.write_record_with_ttl(&record, ttl).await?;
                info!(
                    "Created session {} for thread {} (container {})",
                    record.session_id, thread_id, container_id
                );
                return Ok(SessionHandle {
                    record,
                    reused: false,
                });
            }

            // Lost the race: another caller owns this thread now
            info!(
                "Thread {} was mapped concurrently, returning container {}",
                thread_id, container_id
            );
            self.pool.release(&container_id).await;
        }

        Err(SessionError::Internal(anyhow!(
            "could not resolve session for thread {thread_id}"
        )))
    }

    /// Resolve a live session by thread id, repairing dangling mappings.
    pub async fn get_by_thread(&self, thread_id: &str) -> Result<Option<SessionRecord>> {
        self.lookup_thread(thread_id).await
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        match self.store.get(&session_key(session_id)).await? {
            Some(json) => {
                let record =
                    serde_json::from_str(&json).context("malformed session record in store")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Refresh `last_activity` and push the full TTL out on both keys.
    pub async fn touch(&self, session_id: &str) -> Result<()> {
        let Some(mut record) = self.get(session_id).await? else {
            return Ok(());
        };
        record.last_activity = Utc::now();
        self.write_record(&record).await?;
        self.store
            .set_with_ttl(
                &thread_key(&record.thread_id),
                &record.session_id,
                self.session_timeout,
            )
            .await?;
        Ok(())
    }

    /// Tear down a session and hand its container back to the pool.
    /// Idempotent; store or engine errors are logged, never propagated.
    pub async fn destroy(&self, session_id: &str) {
        let record = match self.get(session_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warn!("Failed to read session {} during destroy: {}", session_id, e);
                return;
            }
        };

        if let Err(e) = self.store.delete(&thread_key(&record.thread_id)).await {
            warn!("Failed to delete thread mapping for {}: {}", session_id, e);
        }
        if let Err(e) = self.store.delete(&session_key(session_id)).await {
            warn!("Failed to delete session {}: {}", session_id, e);
        }

        self.pool.release(&record.container_id).await;
        info!("Session {} destroyed", session_id);
    }

    /// Live session count. Unknown when the index lives in Redis, where the
    /// server expires entries on its own.
    pub fn active_sessions(&self) -> Option<usize> {
        self.memory
            .as_ref()
            .map(|memory| memory.entries_with_prefix("session:").len())
    }

    /// One sweep over the in-memory index: destroy sessions past their
    /// lifetime, and idle ones when aggressive cleanup is on. Redis mode has
    /// nothing to do here; TTLs expire server-side.
    pub async fn sweep(&self, session_timeout: Duration, idle_timeout: Option<Duration>) {
        let Some(memory) = &self.memory else {
            return;
        };

        let now = Utc::now();
        let max_age = chrono::Duration::from_std(session_timeout).unwrap_or(chrono::Duration::MAX);
        let max_idle = idle_timeout
            .map(|idle| chrono::Duration::from_std(idle).unwrap_or(chrono::Duration::MAX));

        for (key, json) in memory.entries_with_prefix("session:") {
            let Ok(record) = serde_json::from_str::<SessionRecord>(&json) else {
                warn!("Dropping unreadable session entry {}", key);
                let _ = self.store.delete(&key).await;
                continue;
            };

            if now - record.created_at > max_age {
                info!("Cleaning up expired session {}", record.session_id);
                self.destroy(&record.session_id).await;
            } else if let Some(max_idle) = max_idle {
                if now - record.last_activity > max_idle {
                    info!("Cleaning up idle session {}", record.session_id);
                    self.destroy(&record.session_id).await;
                }
            }
        }
    }

    async fn write_record(&self, record: &SessionRecord) -> Result<()> {
        self.write_record_with_ttl(record, self.session_timeout).await
    }

    async fn write_record_with_ttl(&self, record: &SessionRecord, ttl: Duration) -> Result<()> {
        let json = serde_json::to_string(record).context("serialize session record")?;
        self.store
            .set_with_ttl(&session_key(&record.session_id), &json, ttl)
            .await
    }

    async fn lookup_thread(&self, thread_id: &str) -> Result<Option<SessionRecord>> {
        let Some(session_id) = self.store.get(&thread_key(thread_id)).await? else {
            return Ok(None);
        };

        match self.get(&session_id).await? {
            Some(record) => Ok(Some(record)),
            None => {
                // Dangling mapping: the session expired underneath it
                self.store.delete(&thread_key(thread_id)).await?;
                Ok(None)
            }
        }
    }
}

/// Periodic expiry/idle sweep. Swallows everything; this task must never
/// take the worker down.
pub fn spawn_sweeper(
    sessions: Arc<SessionManager>,
    interval: Duration,
    session_timeout: Duration,
    idle_timeout: Option<Duration>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            sessions.sweep(session_timeout, idle_timeout).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::config::PoolOptions;
    use crate::worker::runtime::testing::MockRuntime;

    const TTL: Duration = Duration::from_secs(60);

    fn manager(max_size: usize) -> (Arc<SessionManager>, Arc<MockRuntime>) {
        let runtime = Arc::new(MockRuntime::new());
        let pool = Arc::new(ContainerPool::new(
            Arc::clone(&runtime) as Arc<dyn crate::worker::runtime::ContainerRuntime>,
            PoolOptions {
                target_size: 0,
                min_size: 0,
                max_size,
                aggressive_cleanup: false,
                refill_delay: Duration::from_millis(5),
            },
            "sandboxuser".to_string(),
            "/workspace".to_string(),
        ));
        let memory = Arc::new(MemoryStore::new());
        let manager = SessionManager::new(
            Arc::clone(&memory) as Arc<dyn SessionStore>,
            Some(memory),
            pool,
            "worker-1".to_string(),
            Duration::from_secs(60),
        );
        (Arc::new(manager), runtime)
    }

    #[tokio::test]
    async fn creates_then_reuses_by_thread() {
        let (sessions, _runtime) = manager(10);

        let first = sessions.get_or_create("u1", "t1", TTL).await.unwrap();
        assert!(!first.reused);
        assert_eq!(first.record.thread_id, "t1");
        assert_eq!(first.record.user_id, "u1");
        assert_eq!(first.record.worker_id, "worker-1");

        let second = sessions.get_or_create("u1", "t1", TTL).await.unwrap();
        assert!(second.reused);
        assert_eq!(second.record.session_id, first.record.session_id);
    }

    #[tokio::test]
    async fn distinct_threads_get_distinct_sessions() {
        let (sessions, _runtime) = manager(10);

        let a = sessions.get_or_create("u1", "t1", TTL).await.unwrap();
        let b = sessions.get_or_create("u1", "t2", TTL).await.unwrap();
        assert_ne!(a.record.session_id, b.record.session_id);
        assert_ne!(a.record.container_id, b.record.container_id);
    }

    #[tokio::test]
    async fn capacity_error_when_pool_exhausted() {
        let (sessions, _runtime) = manager(1);

        sessions.get_or_create("u1", "t1", TTL).await.unwrap();
        let err = sessions.get_or_create("u1", "t2", TTL).await.unwrap_err();
        assert!(matches!(err, SessionError::Capacity));
    }

    #[tokio::test]
    async fn destroy_returns_container_and_is_idempotent() {
        let (sessions, _runtime) = manager(1);

        let handle = sessions.get_or_create("u1", "t1", TTL).await.unwrap();
        let sid = handle.record.session_id.clone();

        sessions.destroy(&sid).await;
        assert!(sessions.get(&sid).await.unwrap().is_none());
        assert_eq!(sessions.active_sessions(), Some(0));

        // Second destroy is a no-op
        sessions.destroy(&sid).await;

        // The freed container makes room for a new session
        let next = sessions.get_or_create("u1", "t2", TTL).await.unwrap();
        assert!(!next.reused);
    }

    #[tokio::test]
    async fn touch_advances_last_activity() {
        let (sessions, _runtime) = manager(10);

        let handle = sessions.get_or_create("u1", "t1", TTL).await.unwrap();
        let sid = handle.record.session_id.clone();
        let before = handle.record.last_activity;

        tokio::time::sleep(Duration::from_millis(10)).await;
        sessions.touch(&sid).await.unwrap();

        let after = sessions.get(&sid).await.unwrap().unwrap().last_activity;
        assert!(after > before);
    }

    #[tokio::test]
    async fn sweep_expires_old_sessions() {
        let (sessions, _runtime) = manager(10);

        sessions.get_or_create("u1", "t1", TTL).await.unwrap();
        assert_eq!(sessions.active_sessions(), Some(1));

        // A zero lifetime makes everything instantly expired
        sessions.sweep(Duration::from_secs(0), None).await;
        assert_eq!(sessions.active_sessions(), Some(0));
    }

    #[tokio::test]
    async fn sweep_evicts_idle_sessions_only_when_asked() {
        let (sessions, _runtime) = manager(10);
        sessions.get_or_create("u1", "t1", TTL).await.unwrap();

        // Idle eviction off: a generous lifetime keeps the session
        sessions.sweep(Duration::from_secs(3600), None).await;
        assert_eq!(sessions.active_sessions(), Some(1));

        // Idle eviction on with a zero idle allowance removes it
        sessions
            .sweep(Duration::from_secs(3600), Some(Duration::from_secs(0)))
            .await;
        assert_eq!(sessions.active_sessions(), Some(0));
    }

    #[tokio::test]
    async fn dangling_thread_mapping_is_repaired() {
        let (sessions, _runtime) = manager(10);

        let handle = sessions.get_or_create("u1", "t1", TTL).await.unwrap();
        let store: Arc<dyn SessionStore> = Arc::clone(&sessions.store);

        // Simulate the session record expiring while the thread key survives
        store
            .delete(&session_key(&handle.record.session_id))
            .await
            .unwrap();

        let next = sessions.get_or_create("u1", "t1", TTL).await.unwrap();
        assert!(!next.reused);
        assert_ne!(next.record.session_id, handle.record.session_id);
    }
}
