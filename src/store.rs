//! The shared key-value store behind every component.
//!
//! All authoritative state (keys, tokens, sessions, blacklists) lives in the
//! store; service instances hold no local state of record, so any instance
//! can issue, verify, or revoke. `RedisStore` is the production
//! implementation; `MemoryStore` backs deterministic tests. Every Redis
//! round-trip is bounded by the configured timeout and surfaces as
//! `StoreUnavailable` when it expires — verification paths treat that as a
//! denial.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::{Result, SecurityError};

/// Async key-value operations the security core needs from its store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Gets a string value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Sets a string value, with an optional time-to-live.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Deletes a key. Returns whether it existed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Whether a key currently exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Adds a member to a set.
    async fn sadd(&self, key: &str, member: &str) -> Result<()>;

    /// Removes a member from a set.
    async fn srem(&self, key: &str, member: &str) -> Result<()>;

    /// All members of a set.
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// All keys starting with `prefix`. Used by maintenance sweeps only;
    /// request paths address entities by id.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Redis-backed store used in production.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    timeout: Duration,
}

impl RedisStore {
    /// Connects to Redis at `url`. Each operation is bounded by `timeout`.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("✅ Redis Connection Manager initialized (pooled)");
        Ok(Self { conn, timeout })
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(SecurityError::StoreUnavailable(format!("{}: {}", op, e))),
            Err(_) => Err(SecurityError::StoreUnavailable(format!(
                "{}: timed out after {:?}",
                op, self.timeout
            ))),
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        self.bounded("GET", async move {
            redis::cmd("GET").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        self.bounded("SET", async move {
            match ttl {
                Some(ttl) => {
                    // SETEX rejects a zero expiry; clamp to the minimum tick.
                    let secs = ttl.as_secs().max(1);
                    redis::cmd("SETEX")
                        .arg(key)
                        .arg(secs)
                        .arg(value)
                        .query_async(&mut conn)
                        .await
                }
                None => {
                    redis::cmd("SET")
                        .arg(key)
                        .arg(value)
                        .query_async(&mut conn)
                        .await
                }
            }
        })
        .await
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .bounded("DEL", async move {
                redis::cmd("DEL").arg(key).query_async(&mut conn).await
            })
            .await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        self.bounded("EXISTS", async move {
            redis::cmd("EXISTS").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        self.bounded("SADD", async move {
            redis::cmd("SADD")
                .arg(key)
                .arg(member)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        self.bounded("SREM", async move {
            redis::cmd("SREM")
                .arg(key)
                .arg(member)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        self.bounded("SMEMBERS", async move {
            redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", prefix);
        self.bounded("SCAN", async move {
            let mut keys = Vec::new();
            let mut cursor: u64 = 0;
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(100)
                    .query_async(&mut conn)
                    .await?;
                keys.extend(batch);
                cursor = next;
                if cursor == 0 {
                    break;
                }
            }
            Ok(keys)
        })
        .await
    }
}

/// In-memory store for tests and single-process setups. Entries expire
/// lazily, on the read that finds them stale.
#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, (String, Option<Instant>)>>,
    sets: RwLock<HashMap<String, HashSet<String>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn expired(deadline: &Option<Instant>) -> bool {
        deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.read().await;
        Ok(values.get(key).and_then(|(value, deadline)| {
            if Self::expired(deadline) {
                None
            } else {
                Some(value.clone())
            }
        }))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let deadline = ttl.map(|ttl| Instant::now() + ttl);
        self.values
            .write()
            .await
            .insert(key.to_string(), (value.to_string(), deadline));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let removed_value = self.values.write().await.remove(key).is_some();
        let removed_set = self.sets.write().await.remove(key).is_some();
        Ok(removed_value || removed_set)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        if let Some((_, deadline)) = self.values.read().await.get(key) {
            if !Self::expired(deadline) {
                return Ok(true);
            }
        }
        Ok(self.sets.read().await.contains_key(key))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.sets
            .write()
            .await
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        if let Some(set) = self.sets.write().await.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .sets
            .read()
            .await
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let values = self.values.read().await;
        let sets = self.sets.read().await;
        let mut keys: Vec<String> = values
            .iter()
            .filter(|(key, (_, deadline))| key.starts_with(prefix) && !Self::expired(deadline))
            .map(|(key, _)| key.clone())
            .collect();
        keys.extend(sets.keys().filter(|k| k.starts_with(prefix)).cloned());
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_get_set_del() {
        let store = MemoryStore::new();
        assert_eq!(store.get("a").await.unwrap(), None);

        store.set("a", "1", None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some("1".to_string()));
        assert!(store.exists("a").await.unwrap());

        assert!(store.del("a").await.unwrap());
        assert!(!store.del("a").await.unwrap());
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_store_ttl_expires() {
        let store = MemoryStore::new();
        store
            .set("a", "1", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some("1".to_string()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("a").await.unwrap(), None);
        assert!(!store.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn memory_store_sets() {
        let store = MemoryStore::new();
        store.sadd("s", "x").await.unwrap();
        store.sadd("s", "y").await.unwrap();
        store.sadd("s", "x").await.unwrap();

        let mut members = store.smembers("s").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["x", "y"]);

        store.srem("s", "x").await.unwrap();
        assert_eq!(store.smembers("s").await.unwrap(), vec!["y"]);
    }

    #[tokio::test]
    async fn memory_store_scan_prefix() {
        let store = MemoryStore::new();
        store.set("session:1", "a", None).await.unwrap();
        store.set("session:2", "b", None).await.unwrap();
        store.set("session_lock:1", "c", None).await.unwrap();

        let mut keys = store.scan_prefix("session:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["session:1", "session:2"]);
    }
}
