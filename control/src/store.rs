use crate::clock::Clock;
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Result type alias for counter store operations
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Shared atomic counter substrate.
///
/// Rate-limit windows and circuit-breaker tallies live here so that every
/// gateway replica observes the same counts. Implementations must make
/// `incr` a single atomic round trip: the TTL is set only by the increment
/// that creates the key, so two concurrent first increments cannot leave
/// the key without an expiry.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` by one and return the post-increment value. `ttl`
    /// applies only when this increment creates the key.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64>;

    /// Decrement `key` by one, never below zero, and return the
    /// post-decrement value. Absent keys read as zero and stay absent.
    async fn decr(&self, key: &str) -> Result<u64>;

    async fn get(&self, key: &str) -> Result<Option<u64>>;

    async fn put(&self, key: &str, value: u64, ttl: Option<Duration>) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;
}

const INCR_WITH_TTL: &str = r#"
local value = redis.call('INCR', KEYS[1])
if value == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return value
"#;

const DECR_AT_ZERO_FLOOR: &str = r#"
local value = tonumber(redis.call('GET', KEYS[1]))
if not value or value <= 0 then
    return 0
end
return redis.call('DECR', KEYS[1])
"#;

/// Redis-backed store used by replicated deployments.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    incr_script: redis::Script,
    decr_script: redis::Script,
}

impl RedisCounterStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(RedisCounterStore {
            conn,
            incr_script: redis::Script::new(INCR_WITH_TTL),
            decr_script: redis::Script::new(DECR_AT_ZERO_FLOOR),
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64> {
        let mut conn = self.conn.clone();
        let value: u64 = self
            .incr_script
            .key(key)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn decr(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let value: u64 = self.decr_script.key(key).invoke_async(&mut conn).await?;
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<Option<u64>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn put(&self, key: &str, value: u64, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }
}

struct Entry {
    value: u64,
    expires_at: Option<SystemTime>,
}

/// Process-local store for tests and single-replica deployments.
///
/// Counts here are not shared across replicas; multi-replica correctness
/// requires the Redis backend.
pub struct MemoryCounterStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        MemoryCounterStore {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn is_expired(&self, entry: &Entry) -> bool {
        match entry.expires_at {
            Some(deadline) => self.clock.now() >= deadline,
            None => false,
        }
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64> {
        let mut entries = self.entries.lock();
        let expired = entries.get(key).is_some_and(|e| self.is_expired(e));
        if expired {
            entries.remove(key);
        }

        match entries.get_mut(key) {
            Some(entry) => {
                entry.value += 1;
                Ok(entry.value)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: 1,
                        expires_at: Some(self.clock.now() + ttl),
                    },
                );
                Ok(1)
            }
        }
    }

    async fn decr(&self, key: &str) -> Result<u64> {
        let mut entries = self.entries.lock();
        let expired = entries.get(key).is_some_and(|e| self.is_expired(e));
        if expired {
            entries.remove(key);
        }

        match entries.get_mut(key) {
            Some(entry) => {
                entry.value = entry.value.saturating_sub(1);
                Ok(entry.value)
            }
            None => Ok(0),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<u64>> {
        let entries = self.entries.lock();
        Ok(entries
            .get(key)
            .filter(|e| !self.is_expired(e))
            .map(|e| e.value))
    }

    async fn put(&self, key: &str, value: u64, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|t| self.clock.now() + t);
        self.entries
            .lock()
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_memory_incr_and_ttl() {
        let clock = ManualClock::at_unix(100);
        let store = MemoryCounterStore::new(Arc::new(clock.clone()));

        assert_eq!(store.incr("k", Duration::from_secs(10)).await.unwrap(), 1);
        assert_eq!(store.incr("k", Duration::from_secs(10)).await.unwrap(), 2);
        assert_eq!(store.get("k").await.unwrap(), Some(2));

        // TTL came from the creating increment; later increments do not
        // extend it.
        clock.advance(Duration::from_secs(9));
        assert_eq!(store.incr("k", Duration::from_secs(10)).await.unwrap(), 3);
        clock.advance(Duration::from_secs(1));
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.incr("k", Duration::from_secs(10)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_decr_floors_at_zero() {
        let clock = ManualClock::at_unix(0);
        let store = MemoryCounterStore::new(Arc::new(clock));

        assert_eq!(store.decr("missing").await.unwrap(), 0);

        store.incr("k", Duration::from_secs(10)).await.unwrap();
        store.incr("k", Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.decr("k").await.unwrap(), 1);
        assert_eq!(store.decr("k").await.unwrap(), 0);
        assert_eq!(store.decr("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_memory_put_get_remove() {
        let clock = ManualClock::at_unix(0);
        let store = MemoryCounterStore::new(Arc::new(clock.clone()));

        store.put("s", 7, None).await.unwrap();
        assert_eq!(store.get("s").await.unwrap(), Some(7));

        store
            .put("t", 1, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(5));
        assert_eq!(store.get("t").await.unwrap(), None);
        assert_eq!(store.get("s").await.unwrap(), Some(7));

        store.remove("s").await.unwrap();
        assert_eq!(store.get("s").await.unwrap(), None);
    }
}
