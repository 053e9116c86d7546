use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::info;

/// Key/value capability backing the session index.
///
/// Two implementations exist: a process-local map for single-worker
/// deployments and a Redis adapter for distributed ones. They are
/// interchangeable by configuration only.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Atomic set-if-absent. Returns true when this caller wrote the key.
    async fn set_if_not_exists(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;
}

/// Mutex-guarded map with lazy TTL expiry. Entries past their deadline are
/// treated as absent and dropped on the next touch.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(entry: &(String, Option<Instant>)) -> Option<String> {
        match entry.1 {
            Some(deadline) if deadline <= Instant::now() => None,
            _ => Some(entry.0.clone()),
        }
    }

    /// Snapshot of live entries under a key prefix. Used by the background
    /// sweeper, which only runs against this backend.
    pub fn entries_with_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, (_, deadline)| deadline.map(|d| d > now).unwrap_or(true));
        entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, (value, _))| (key.clone(), value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, (_, deadline)| deadline.map(|d| d > now).unwrap_or(true));
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) => match Self::live_value(entry) {
                Some(value) => Ok(Some(value)),
                None => {
                    entries.remove(key);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let deadline = Instant::now() + ttl;
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_string(), Some(deadline)));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn set_if_not_exists(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let live = entries
            .get(key)
            .map(|entry| Self::live_value(entry).is_some())
            .unwrap_or(false);
        if live {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value.to_string(), Some(now + ttl)));
        Ok(true)
    }
}

/// Redis-backed store for distributed deployments. TTL handling is delegated
/// to the server (`SET .. EX`), so no sweeper is needed on this path.
pub struct RedisStore {
    connection: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let connection = client.get_connection_manager().await?;
        info!("Connected to Redis session store");
        Ok(Self { connection })
    }

    fn ttl_secs(ttl: Duration) -> u64 {
        ttl.as_secs().max(1)
    }
}

#[async_trait]
impl SessionStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut connection = self.connection.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut connection)
            .await?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut connection = self.connection.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(Self::ttl_secs(ttl))
            .query_async(&mut connection)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut connection = self.connection.clone();
        let _: () = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut connection)
            .await?;
        Ok(())
    }

    async fn set_if_not_exists(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut connection = self.connection.clone();
        // SET NX EX replies OK on success and nil when the key already exists
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(Self::ttl_secs(ttl))
            .query_async(&mut connection)
            .await?;
        Ok(reply.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("session:abc", "{}", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(
            store.get("session:abc").await.unwrap(),
            Some("{}".to_string())
        );
        assert_eq!(store.get("session:missing").await.unwrap(), None);

        store.delete("session:abc").await.unwrap();
        assert_eq!(store.get("session:abc").await.unwrap(), None);
        // Deleting again is a no-op
        store.delete("session:abc").await.unwrap();
    }

    #[tokio::test]
    async fn memory_store_expires_entries() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("thread:t1", "sid", Duration::from_millis(5))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("thread:t1").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn set_if_not_exists_is_first_writer_wins() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        assert!(store.set_if_not_exists("thread:t1", "a", ttl).await.unwrap());
        assert!(!store.set_if_not_exists("thread:t1", "b", ttl).await.unwrap());
        assert_eq!(store.get("thread:t1").await.unwrap(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn set_if_not_exists_reclaims_expired_keys() {
        let store = MemoryStore::new();
        store
            .set_if_not_exists("thread:t1", "a", Duration::from_millis(5))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store
            .set_if_not_exists("thread:t1", "b", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn prefix_scan_skips_dead_entries() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        store.set_with_ttl("session:a", "1", ttl).await.unwrap();
        store.set_with_ttl("session:b", "2", ttl).await.unwrap();
        store.set_with_ttl("thread:t", "a", ttl).await.unwrap();
        store
            .set_with_ttl("session:dead", "x", Duration::from_millis(5))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut keys: Vec<String> = store
            .entries_with_prefix("session:")
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["session:a", "session:b"]);
    }
}
