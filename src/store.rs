// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared key-value store with TTLs.
//!
//! The distributed lock and the idempotency cache both live here. In
//! production this is Redis ([`RedisStore`]); tests and standalone runs use
//! [`MemoryStore`], which has the same expiry semantics.
//!
//! The trait returns boxed futures rather than using `async fn` so that it
//! stays object-safe and the orchestrator can be generic over it without
//! extra crates.

use crate::error::{BoxFuture, Result, SyncError};
use crate::resilience::RetryConfig;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{info, warn};

/// Delete `KEYS[1]` only if it still holds `ARGV[1]`.
const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Operations the lock and the idempotency gate need from the shared store.
pub trait SharedStore: Send + Sync + 'static {
    /// `SET key value NX PX ttl`. Returns `true` if the key was set.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, bool>;

    /// Delete `key` only if its value equals `expected`. Returns `true` if deleted.
    fn delete_if_equals(&self, key: &str, expected: &str) -> BoxFuture<'_, bool>;

    /// Read a value; expired keys read as `None`.
    fn get(&self, key: &str) -> BoxFuture<'_, Option<String>>;

    /// Unconditional write with a TTL.
    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, ()>;
}

impl<T: SharedStore + ?Sized> SharedStore for Arc<T> {
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, bool> {
        (**self).set_if_absent(key, value, ttl)
    }

    fn delete_if_equals(&self, key: &str, expected: &str) -> BoxFuture<'_, bool> {
        (**self).delete_if_equals(key, expected)
    }

    fn get(&self, key: &str) -> BoxFuture<'_, Option<String>> {
        (**self).get(key)
    }

    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, ()> {
        (**self).set_with_ttl(key, value, ttl)
    }
}

// =============================================================================
// Redis
// =============================================================================

/// Open a multiplexed Redis connection, retrying with backoff.
///
/// Each attempt is bounded by `retry.connection_timeout` so an unreachable
/// host does not hang startup.
pub async fn connect(url: &str, retry: &RetryConfig) -> Result<ConnectionManager> {
    let client = Client::open(url)
        .map_err(|e| SyncError::Config(format!("Invalid Redis URL '{}': {}", url, e)))?;

    let mut attempt = 0;
    loop {
        attempt += 1;

        let err_msg = match timeout(retry.connection_timeout, client.get_connection_manager()).await {
            Ok(Ok(conn)) => {
                if attempt > 1 {
                    info!(attempt, "Connected to Redis after retry");
                } else {
                    info!("Connected to Redis");
                }
                return Ok(conn);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {}ms", retry.connection_timeout.as_millis()),
        };

        if attempt >= retry.max_attempts {
            return Err(SyncError::store_msg(
                "connect",
                format!("Connection failed after {} attempts: {}", attempt, err_msg),
            ));
        }

        let delay = retry.delay_for_attempt(attempt);
        warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err_msg,
            "Redis connection attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    ttl.as_millis().clamp(1, u64::MAX as u128) as u64
}

/// Redis-backed [`SharedStore`].
///
/// `ConnectionManager` is `Clone` and multiplexed, so each call clones it.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(url: &str, retry: &RetryConfig) -> Result<Self> {
        Ok(Self::new(connect(url, retry).await?))
    }
}

impl SharedStore for RedisStore {
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, bool> {
        let key = key.to_string();
        let value = value.to_string();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let reply: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&value)
                .arg("NX")
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async(&mut conn)
                .await
                .map_err(|e| SyncError::redis("SET NX", e))?;
            Ok(reply.is_some())
        })
    }

    fn delete_if_equals(&self, key: &str, expected: &str) -> BoxFuture<'_, bool> {
        let key = key.to_string();
        let expected = expected.to_string();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let deleted: i64 = Script::new(COMPARE_AND_DELETE)
                .key(&key)
                .arg(&expected)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| SyncError::redis("compare-and-delete", e))?;
            Ok(deleted == 1)
        })
    }

    fn get(&self, key: &str) -> BoxFuture<'_, Option<String>> {
        let key = key.to_string();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            redis::cmd("GET")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(|e| SyncError::redis("GET", e))
        })
    }

    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, ()> {
        let key = key.to_string();
        let value = value.to_string();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let _: () = redis::cmd("SET")
                .arg(&key)
                .arg(&value)
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async(&mut conn)
                .await
                .map_err(|e| SyncError::redis("SET PX", e))?;
            Ok(())
        })
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-process [`SharedStore`] with TTL expiry.
///
/// Uses `tokio::time::Instant`, so expiry follows paused test clocks.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl SharedStore for MemoryStore {
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, bool> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.entries.lock().await;
            if entries.get(&key).is_some_and(|e| e.expires_at > now) {
                return Ok(false);
            }
            entries.insert(
                key,
                Entry {
                    value,
                    expires_at: now + ttl,
                },
            );
            Ok(true)
        })
    }

    fn delete_if_equals(&self, key: &str, expected: &str) -> BoxFuture<'_, bool> {
        let key = key.to_string();
        let expected = expected.to_string();
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.entries.lock().await;
            match entries.get(&key) {
                Some(e) if e.expires_at > now && e.value == expected => {
                    entries.remove(&key);
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn get(&self, key: &str) -> BoxFuture<'_, Option<String>> {
        let key = key.to_string();
        Box::pin(async move {
            let now = Instant::now();
            let entries = self.entries.lock().await;
            Ok(entries
                .get(&key)
                .filter(|e| e.expires_at > now)
                .map(|e| e.value.clone()))
        })
    }

    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, ()> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let expires_at = Instant::now() + ttl;
            self.entries
                .lock()
                .await
                .insert(key, Entry { value, expires_at });
            Ok(())
        })
    }
}
