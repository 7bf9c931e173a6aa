//! Shared ephemeral store: the tick lock, the tick-id counter and the
//! last-tick metadata hash live here, not in SQLite.
//!
//! The trait is the five primitives the scheduler needs. Production runs on
//! Redis; tests and loopback development runs use [`MemoryEphemeral`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Ephemeral store error: {0}")]
pub struct EphemeralError(pub String);

impl From<redis::RedisError> for EphemeralError {
    fn from(e: redis::RedisError) -> Self {
        EphemeralError(e.to_string())
    }
}

pub type EphemeralResult<T> = std::result::Result<T, EphemeralError>;

/// Key/value primitives with TTLs, a counter and one hash per key.
///
/// The conditional operations (`expire_if_match`, `delete_if_match`) are the
/// lock-safety seam: a holder can only extend or drop its own token.
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    /// `SET key value NX EX ttl`; true when the key was freshly set.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> EphemeralResult<bool>;

    /// Re-arm the TTL only while the stored value still matches.
    async fn expire_if_match(&self, key: &str, value: &str, ttl_secs: u64)
        -> EphemeralResult<bool>;

    /// Delete only while the stored value still matches.
    async fn delete_if_match(&self, key: &str, value: &str) -> EphemeralResult<bool>;

    async fn get(&self, key: &str) -> EphemeralResult<Option<String>>;

    async fn incr(&self, key: &str) -> EphemeralResult<i64>;

    /// Replace the hash at `key` with `fields`.
    async fn put_hash(&self, key: &str, fields: &[(String, String)]) -> EphemeralResult<()>;

    async fn get_hash(&self, key: &str) -> EphemeralResult<HashMap<String, String>>;
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

static DELETE_IF_MATCH: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        "if redis.call('get', KEYS[1]) == ARGV[1] then \
             return redis.call('del', KEYS[1]) \
         else \
             return 0 \
         end",
    )
});

static EXPIRE_IF_MATCH: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        "if redis.call('get', KEYS[1]) == ARGV[1] then \
             return redis.call('expire', KEYS[1], ARGV[2]) \
         else \
             return 0 \
         end",
    )
});

/// Redis-backed ephemeral store.
pub struct RedisEphemeral {
    client: redis::Client,
}

impl RedisEphemeral {
    pub fn connect(url: &str) -> EphemeralResult<Self> {
        Ok(Self {
            client: redis::Client::open(url).map_err(EphemeralError::from)?,
        })
    }

    async fn conn(&self) -> EphemeralResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(EphemeralError::from)
    }
}

#[async_trait]
impl EphemeralStore for RedisEphemeral {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> EphemeralResult<bool> {
        let mut conn = self.conn().await?;
        let set: bool = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(EphemeralError::from)?;
        Ok(set)
    }

    async fn expire_if_match(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> EphemeralResult<bool> {
        let mut conn = self.conn().await?;
        let n: i64 = EXPIRE_IF_MATCH
            .key(key)
            .arg(value)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(EphemeralError::from)?;
        Ok(n != 0)
    }

    async fn delete_if_match(&self, key: &str, value: &str) -> EphemeralResult<bool> {
        let mut conn = self.conn().await?;
        let n: i64 = DELETE_IF_MATCH
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(EphemeralError::from)?;
        Ok(n != 0)
    }

    async fn get(&self, key: &str) -> EphemeralResult<Option<String>> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.get(key).await.map_err(EphemeralError::from)?;
        Ok(value)
    }

    async fn incr(&self, key: &str) -> EphemeralResult<i64> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let n: i64 = conn.incr(key, 1).await.map_err(EphemeralError::from)?;
        Ok(n)
    }

    async fn put_hash(&self, key: &str, fields: &[(String, String)]) -> EphemeralResult<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let _: () = conn.del(key).await.map_err(EphemeralError::from)?;
        let _: () = conn
            .hset_multiple(key, fields)
            .await
            .map_err(EphemeralError::from)?;
        Ok(())
    }

    async fn get_hash(&self, key: &str) -> EphemeralResult<HashMap<String, String>> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let map: HashMap<String, String> =
            conn.hgetall(key).await.map_err(EphemeralError::from)?;
        Ok(map)
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (tests, loopback development runs)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    strings: HashMap<String, (String, Option<Instant>)>,
    hashes: HashMap<String, HashMap<String, String>>,
}

impl MemoryInner {
    /// Drop the entry when its TTL has lapsed, then return the live value.
    fn live(&mut self, key: &str) -> Option<&String> {
        if let Some((_, Some(deadline))) = self.strings.get(key) {
            if *deadline <= Instant::now() {
                self.strings.remove(key);
            }
        }
        self.strings.get(key).map(|(v, _)| v)
    }
}

/// Process-local ephemeral store with the same observable semantics as the
/// Redis one (including TTL-based expiry).
#[derive(Default)]
pub struct MemoryEphemeral {
    inner: std::sync::Mutex<MemoryInner>,
}

impl MemoryEphemeral {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EphemeralStore for MemoryEphemeral {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> EphemeralResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.live(key).is_some() {
            return Ok(false);
        }
        let deadline = Instant::now() + Duration::from_secs(ttl_secs);
        inner
            .strings
            .insert(key.to_string(), (value.to_string(), Some(deadline)));
        Ok(true)
    }

    async fn expire_if_match(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> EphemeralResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.live(key).map(String::as_str) != Some(value) {
            return Ok(false);
        }
        let deadline = Instant::now() + Duration::from_secs(ttl_secs);
        if let Some(entry) = inner.strings.get_mut(key) {
            entry.1 = Some(deadline);
        }
        Ok(true)
    }

    async fn delete_if_match(&self, key: &str, value: &str) -> EphemeralResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.live(key).map(String::as_str) != Some(value) {
            return Ok(false);
        }
        inner.strings.remove(key);
        Ok(true)
    }

    async fn get(&self, key: &str) -> EphemeralResult<Option<String>> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.live(key).cloned())
    }

    async fn incr(&self, key: &str) -> EphemeralResult<i64> {
        let mut inner = self.inner.lock().unwrap();
        let current = inner
            .live(key)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        inner
            .strings
            .insert(key.to_string(), (next.to_string(), None));
        Ok(next)
    }

    async fn put_hash(&self, key: &str, fields: &[(String, String)]) -> EphemeralResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .hashes
            .insert(key.to_string(), fields.iter().cloned().collect());
        Ok(())
    }

    async fn get_hash(&self, key: &str) -> EphemeralResult<HashMap<String, String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_is_exclusive_until_deleted() {
        let store = MemoryEphemeral::new();
        assert!(store.set_nx_ex("k", "a", 60).await.unwrap());
        assert!(!store.set_nx_ex("k", "b", 60).await.unwrap());

        assert!(store.delete_if_match("k", "a").await.unwrap());
        assert!(store.set_nx_ex("k", "b", 60).await.unwrap());
    }

    #[tokio::test]
    async fn conditional_ops_require_matching_value() {
        let store = MemoryEphemeral::new();
        store.set_nx_ex("k", "a", 60).await.unwrap();

        assert!(!store.delete_if_match("k", "other").await.unwrap());
        assert!(!store.expire_if_match("k", "other", 60).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));

        assert!(store.expire_if_match("k", "a", 60).await.unwrap());
        assert!(store.delete_if_match("k", "a").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn incr_is_monotonic_from_one() {
        let store = MemoryEphemeral::new();
        assert_eq!(store.incr("seq").await.unwrap(), 1);
        assert_eq!(store.incr("seq").await.unwrap(), 2);
        assert_eq!(store.incr("seq").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn hash_round_trips() {
        let store = MemoryEphemeral::new();
        store
            .put_hash(
                "h",
                &[
                    ("tick_id".to_string(), "7".to_string()),
                    ("posts_inserted".to_string(), "3".to_string()),
                ],
            )
            .await
            .unwrap();
        let map = store.get_hash("h").await.unwrap();
        assert_eq!(map.get("tick_id").map(String::as_str), Some("7"));
        assert_eq!(map.get("posts_inserted").map(String::as_str), Some("3"));
    }
}
