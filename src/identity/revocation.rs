//! Token blacklist backed by a TTL-capable key-value store.
//!
//! The store only answers "is this exact token blacklisted right now". Entries
//! expire on their own once the token they revoke could no longer verify, so
//! nothing ever deletes them explicitly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::RedisConfig;
use crate::error::AppError;

const SERVICE_PREFIX: &str = "stars-catalog.";
const JWT_PREFIX: &str = "jwt.";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RevocationError {
    #[error("revocation store unavailable: {0}")]
    Unavailable(String),
    #[error("revocation store timed out after {0:?}")]
    Timeout(Duration),
}

impl From<RevocationError> for AppError {
    fn from(e: RevocationError) -> Self {
        AppError::internal("revocation_store".to_string(), e.to_string())
    }
}

impl From<redis::RedisError> for RevocationError {
    fn from(e: redis::RedisError) -> Self { RevocationError::Unavailable(e.to_string()) }
}

/// Key under which a token's blacklist marker lives.
pub fn blacklist_key(token: &str) -> String {
    format!("{}{}{}", SERVICE_PREFIX, JWT_PREFIX, token)
}

#[async_trait]
pub trait RevocationStore: Send + Sync {
    /// Store a `true` marker under `key` that disappears after `ttl`.
    async fn set(&self, key: &str, ttl: Duration) -> Result<(), RevocationError>;
    /// `Ok(true)` when the key is present, `Ok(false)` when definitively absent.
    async fn contains(&self, key: &str) -> Result<bool, RevocationError>;
}

/// Shared handle plus the per-operation timeout applied to every call.
#[derive(Clone)]
pub struct Blacklist {
    store: Arc<dyn RevocationStore>,
    op_timeout: Duration,
}

impl Blacklist {
    pub fn new(store: Arc<dyn RevocationStore>, op_timeout: Duration) -> Self { Self { store, op_timeout } }

    pub async fn is_revoked(&self, token: &str) -> Result<bool, RevocationError> {
        let key = blacklist_key(token);
        match tokio::time::timeout(self.op_timeout, self.store.contains(&key)).await {
            Ok(res) => res,
            Err(_) => Err(RevocationError::Timeout(self.op_timeout)),
        }
    }

    /// Blacklist `token` for `ttl`. The write runs on its own task so a client
    /// disconnect cannot abandon it half way.
    pub async fn revoke(&self, token: &str, ttl: Duration) -> Result<(), RevocationError> {
        let key = blacklist_key(token);
        let store = self.store.clone();
        let op_timeout = self.op_timeout;
        let handle = tokio::spawn(async move {
            match tokio::time::timeout(op_timeout, store.set(&key, ttl)).await {
                Ok(res) => res,
                Err(_) => Err(RevocationError::Timeout(op_timeout)),
            }
        });
        handle.await.map_err(|e| RevocationError::Unavailable(format!("revocation task failed: {}", e)))?
    }
}

#[derive(Clone, Copy)]
struct Entry {
    expires_at: Instant,
}

/// In-process store for tests and single-node development runs.
#[derive(Clone, Default)]
pub struct MemoryRevocationStore {
    map: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemoryRevocationStore {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.map.read().len() }

    pub fn is_empty(&self) -> bool { self.map.read().is_empty() }

    /// Remove expired keys. Returns number removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut w = self.map.write();
        let before = w.len();
        w.retain(|_, e| e.expires_at > now);
        before - w.len()
    }
}

#[async_trait]
impl RevocationStore for MemoryRevocationStore {
    async fn set(&self, key: &str, ttl: Duration) -> Result<(), RevocationError> {
        let entry = Entry { expires_at: Instant::now() + ttl };
        self.map.write().insert(key.to_string(), entry);
        Ok(())
    }

    async fn contains(&self, key: &str) -> Result<bool, RevocationError> {
        {
            let r = self.map.read();
            match r.get(key) {
                None => return Ok(false),
                Some(e) if Instant::now() < e.expires_at => return Ok(true),
                Some(_) => {}
            }
        }
        // Expired on read. A `set` may have refreshed the key since, so decide again under the write lock.
        let mut w = self.map.write();
        match w.get(key) {
            Some(e) if Instant::now() < e.expires_at => Ok(true),
            Some(_) => {
                w.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

/// Redis-backed store shared by every gateway instance.
#[derive(Clone)]
pub struct RedisRevocationStore {
    conn: ConnectionManager,
}

impl RedisRevocationStore {
    /// Connect and PING within the configured dial timeout.
    pub async fn connect(cfg: &RedisConfig) -> Result<Self, RevocationError> {
        let client = redis::Client::open(cfg.url())?;
        let connect = async {
            let mut conn = ConnectionManager::new(client).await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, redis::RedisError>(conn)
        };
        let conn = tokio::time::timeout(cfg.dial_timeout, connect)
            .await
            .map_err(|_| RevocationError::Timeout(cfg.dial_timeout))??;
        info!(target: "startup", host = %cfg.host, port = cfg.port, "connected to redis revocation store");
        Ok(Self { conn })
    }
}

#[async_trait]
impl RevocationStore for RedisRevocationStore {
    async fn set(&self, key: &str, ttl: Duration) -> Result<(), RevocationError> {
        let mut conn = self.conn.clone();
        // SETEX rejects a zero expiry; one second is the shortest window redis keeps.
        let secs = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, true, secs).await?;
        debug!(ttl_secs = secs, "blacklist entry written");
        Ok(())
    }

    async fn contains(&self, key: &str) -> Result<bool, RevocationError> {
        let mut conn = self.conn.clone();
        let found: Option<String> = conn.get(key).await?;
        Ok(found.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowStore;

    #[async_trait]
    impl RevocationStore for SlowStore {
        async fn set(&self, _key: &str, _ttl: Duration) -> Result<(), RevocationError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
        async fn contains(&self, _key: &str) -> Result<bool, RevocationError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(false)
        }
    }

    #[test]
    fn key_is_prefixed_with_service_namespace() {
        assert_eq!(blacklist_key("abc.def.ghi"), "stars-catalog.jwt.abc.def.ghi");
    }

    #[tokio::test]
    async fn memory_store_marks_exact_token_only() {
        let store = Arc::new(MemoryRevocationStore::new());
        let bl = Blacklist::new(store.clone(), Duration::from_secs(1));
        bl.revoke("token-a", Duration::from_secs(60)).await.unwrap();
        assert!(bl.is_revoked("token-a").await.unwrap());
        assert!(!bl.is_revoked("token-b").await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn memory_entries_expire_with_ttl() {
        let store = MemoryRevocationStore::new();
        store.set("k", Duration::from_millis(20)).await.unwrap();
        assert!(store.contains("k").await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!store.contains("k").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn refreshed_entry_survives_concurrent_expiry_checks() {
        for _ in 0..50 {
            let store = Arc::new(MemoryRevocationStore::new());
            store.set("k", Duration::from_millis(1)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(3)).await;

            let readers: Vec<_> = (0..4)
                .map(|_| {
                    let s = store.clone();
                    tokio::spawn(async move {
                        for _ in 0..50 {
                            let _ = s.contains("k").await;
                        }
                    })
                })
                .collect();
            store.set("k", Duration::from_secs(60)).await.unwrap();
            for r in readers {
                r.await.unwrap();
            }
            assert!(store.contains("k").await.unwrap());
        }
    }

    #[tokio::test]
    async fn sweep_removes_expired_entries() {
        let store = MemoryRevocationStore::new();
        store.set("short", Duration::from_millis(10)).await.unwrap();
        store.set("long", Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn slow_store_times_out() {
        let bl = Blacklist::new(Arc::new(SlowStore), Duration::from_millis(50));
        assert_eq!(bl.is_revoked("t").await, Err(RevocationError::Timeout(Duration::from_millis(50))));
        assert_eq!(bl.revoke("t", Duration::from_secs(1)).await, Err(RevocationError::Timeout(Duration::from_millis(50))));
    }
}
