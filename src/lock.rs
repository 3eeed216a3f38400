// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-record distributed lock.
//!
//! A lock is a `SET NX PX` key (`<prefix>lock:<id>`) holding a random owner
//! token. Release is compare-and-delete, so an instance whose lock already
//! expired cannot delete a lock now held by someone else. A crashed holder's
//! lock simply expires after the TTL.

use crate::error::Result;
use crate::metrics;
use crate::store::SharedStore;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default lock TTL.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// A held lock. Hand it back to [`DistributedLock::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    key: String,
    token: String,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Lock manager over a [`SharedStore`].
#[derive(Debug, Clone)]
pub struct DistributedLock<S> {
    store: S,
    prefix: String,
    ttl: Duration,
}

impl<S: SharedStore> DistributedLock<S> {
    /// `prefix` is the shared key prefix (e.g. `rfq_sync:`).
    pub fn new(store: S, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Storage key for a record's lock.
    pub fn key_for(&self, record_id: &str) -> String {
        format!("{}lock:{}", self.prefix, record_id)
    }

    /// Try to take the lock. `Ok(None)` means someone else holds it.
    pub async fn acquire(&self, record_id: &str) -> Result<Option<LockHandle>> {
        let key = self.key_for(record_id);
        let token = Uuid::new_v4().to_string();

        if self.store.set_if_absent(&key, &token, self.ttl).await? {
            debug!(key = %key, "Lock acquired");
            Ok(Some(LockHandle { key, token }))
        } else {
            metrics::record_lock_contention();
            Ok(None)
        }
    }

    /// Release a lock. Returns `false` if it had already expired or been taken over.
    pub async fn release(&self, handle: LockHandle) -> Result<bool> {
        let released = self.store.delete_if_equals(&handle.key, &handle.token).await?;
        if !released {
            warn!(key = %handle.key, "Lock expired before release");
        }
        Ok(released)
    }

    /// Run `f` while holding the lock for `record_id`.
    ///
    /// Returns `Ok(None)` without running `f` if the lock is held elsewhere.
    /// The lock is released on every exit path of `f`; a failed release is
    /// logged and does not mask `f`'s outcome.
    pub async fn with_lock<F, Fut, T>(&self, record_id: &str, f: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Some(handle) = self.acquire(record_id).await? else {
            return Ok(None);
        };

        let outcome = f().await;

        let key = handle.key.clone();
        if let Err(e) = self.release(handle).await {
            warn!(key = %key, error = %e, "Failed to release lock");
        }

        outcome.map(Some)
    }
}
