use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use mockall::automock;
use redis::AsyncCommands;
use sha2::{Digest, Sha256};
use tracing::{debug, error, warn};

use crate::database::RedisDatabase;

pub type DynResultCache = Arc<dyn ResultCache + Send + Sync>;

/// generic key/value cache for resolved results (raw manifests mostly)
///
/// everything here is opportunistic, a miss or a failed write never fails a request so the
/// methods don't return errors at all
#[automock]
#[async_trait::async_trait]
pub trait ResultCache {
    async fn get(&self, key: &str) -> Option<String>;

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64);
}

/// sha256 of the joined parts, keeps keys short no matter how long the signed cdn urls get
pub fn hashed_key(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"\n");
    }
    format!("{}:{}", prefix, hex::encode(hasher.finalize()))
}

struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

/// bounded in-process LRU, the oldest entry goes once capacity is hit
pub struct MemoryCache {
    entries: Mutex<LruCache<String, MemoryEntry>>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|lock| lock.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get_value(&self, key: &str) -> Option<String> {
        let Ok(mut lock) = self.entries.lock() else {
            error!("memory cache lock poisoned");
            return None;
        };

        let expired = match lock.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            debug!("memory cache EXPIRED: {}", key);
            lock.pop(key);
        }
        None
    }

    fn set_value(&self, key: &str, value: &str, ttl_seconds: u64) {
        let Ok(mut lock) = self.entries.lock() else {
            error!("memory cache lock poisoned");
            return;
        };

        lock.put(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Instant::now() + Duration::from_secs(ttl_seconds),
            },
        );
    }
}

#[async_trait::async_trait]
impl ResultCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        self.get_value(key)
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) {
        if ttl_seconds == 0 {
            return;
        }
        self.set_value(key, value, ttl_seconds);
    }
}

/// redis when it's configured, the memory LRU when it isn't or when redis errors out
pub struct ResultCacheService {
    redis: Option<Arc<RedisDatabase>>,
    memory: MemoryCache,
}

impl ResultCacheService {
    pub fn new(redis: Option<Arc<RedisDatabase>>, memory_capacity: usize) -> Self {
        Self {
            redis,
            memory: MemoryCache::new(memory_capacity),
        }
    }

    pub fn memory_only(memory_capacity: usize) -> Self {
        Self::new(None, memory_capacity)
    }
}

#[async_trait::async_trait]
impl ResultCache for ResultCacheService {
    async fn get(&self, key: &str) -> Option<String> {
        if let Some(redis) = &self.redis {
            let mut conn = redis.connection.clone();
            let result: Result<Option<String>, redis::RedisError> = conn.get(key).await;

            match result {
                Ok(Some(value)) => {
                    debug!("result cache HIT (redis): {}", key);
                    return Some(value);
                }
                Ok(None) => {}
                Err(e) => warn!("result cache redis GET failed for {}: {}", key, e),
            }
        }

        // writes land here when redis failed them, so check even with redis configured
        self.memory.get_value(key)
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) {
        if ttl_seconds == 0 {
            return;
        }

        if let Some(redis) = &self.redis {
            let mut conn = redis.connection.clone();
            let result: Result<(), redis::RedisError> = conn.set_ex(key, value, ttl_seconds).await;

            match result {
                Ok(_) => {
                    debug!("result cache SET (redis): {} (TTL {}s)", key, ttl_seconds);
                    return;
                }
                Err(e) => error!("result cache redis SET failed for {}: {}", key, e),
            }
        }

        self.memory.set_value(key, value, ttl_seconds);
        debug!("result cache SET (memory): {} (TTL {}s)", key, ttl_seconds);
    }
}
