// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The at-most-one-write transaction for a single [`SyncRequest`].
//!
//! # Attempt Flow
//!
//! ```text
//! SyncPolicy::execute ─┐  (breaker gate + retry of transient errors)
//!                      ▼
//!   acquire lock ──held elsewhere──► pending "Lock not acquired, will retry"
//!        │
//!        ├─ idempotency gate ──hit──► completed (existing destination id)
//!        ├─ validate + transform ───► Validation error (terminal)
//!        ├─ gateway.create ─────────► destination id
//!        ├─ cache mapping (best effort)
//!   release lock (every path)
//! ```
//!
//! # Outcomes
//!
//! | Situation | Return |
//! |-----------|--------|
//! | created or duplicate | `Ok(completed)` |
//! | lock held elsewhere | `Ok(pending)`, neutral to the breaker |
//! | breaker open | `Ok(failed)` |
//! | anything else | `Err(SyncFailure { result: failed, error })` |

use crate::error::{ErrorKind, SyncError};
use crate::gateway::RecordGateway;
use crate::idempotency::{IdempotencyGate, DEFAULT_MAPPING_TTL};
use crate::lock::{DistributedLock, DEFAULT_LOCK_TTL};
use crate::metrics;
use crate::model::{SyncRequest, SyncResult};
use crate::policy::SyncPolicy;
use crate::store::SharedStore;
use crate::transformer::Transformer;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// A failed attempt that escaped the policy: the `failed` result to publish
/// plus the error that caused it.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct SyncFailure {
    pub result: SyncResult,
    #[source]
    pub error: SyncError,
}

impl SyncFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

/// Key layout and TTLs for the orchestrator's shared-store entries.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Prefix for `lock:` and `map:` keys.
    pub key_prefix: String,
    pub lock_ttl: Duration,
    pub mapping_ttl: Duration,
    /// Tag written to `external_source`.
    pub source_system: String,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            key_prefix: "rfq_sync:".to_string(),
            lock_ttl: DEFAULT_LOCK_TTL,
            mapping_ttl: DEFAULT_MAPPING_TTL,
            source_system: "email".to_string(),
        }
    }
}

/// In-process counters.
#[derive(Debug, Default)]
pub struct SyncStats {
    total: AtomicU64,
    successful: AtomicU64,
    duplicates: AtomicU64,
    pending: AtomicU64,
    failed: AtomicU64,
    attempts: AtomicU64,
}

/// Point-in-time copy of [`SyncStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStatsSnapshot {
    pub total: u64,
    pub successful: u64,
    pub duplicates: u64,
    pub pending: u64,
    pub failed: u64,
    pub attempts: u64,
    pub retries: u64,
}

#[derive(Debug)]
enum AttemptOutcome {
    Created(String),
    Duplicate(String),
    LockNotAcquired,
}

/// Composes lock, idempotency gate, transformer, gateway and policy.
pub struct SyncOrchestrator<S, G> {
    lock: DistributedLock<S>,
    gate: IdempotencyGate<S, G>,
    transformer: Transformer,
    policy: SyncPolicy,
    stats: Arc<SyncStats>,
}

impl<S, G> SyncOrchestrator<S, G>
where
    S: SharedStore + Clone,
    G: RecordGateway,
{
    pub fn new(store: S, gateway: G, policy: SyncPolicy, options: OrchestratorOptions) -> Self {
        Self {
            lock: DistributedLock::new(store.clone(), options.key_prefix.clone(), options.lock_ttl),
            gate: IdempotencyGate::new(store, gateway, options.key_prefix, options.mapping_ttl),
            transformer: Transformer::new(options.source_system),
            policy,
            stats: Arc::new(SyncStats::default()),
        }
    }

    pub fn gateway(&self) -> &G {
        self.gate.gateway()
    }

    pub fn transformer(&self) -> &Transformer {
        &self.transformer
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    pub fn stats(&self) -> SyncStatsSnapshot {
        SyncStatsSnapshot {
            total: self.stats.total.load(Ordering::Relaxed),
            successful: self.stats.successful.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
            pending: self.stats.pending.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            attempts: self.stats.attempts.load(Ordering::Relaxed),
            retries: self.policy.retries(),
        }
    }

    /// Sync one request. See the module docs for the outcome table.
    pub async fn sync(&self, request: &SyncRequest) -> Result<SyncResult, SyncFailure> {
        let started_at = Utc::now();
        self.stats.total.fetch_add(1, Ordering::Relaxed);

        let outcome = self
            .policy
            .execute_classified(
                |attempt| {
                    self.stats.attempts.fetch_add(1, Ordering::Relaxed);
                    debug!(source_id = %request.source_id, attempt, "Sync attempt");
                    self.attempt(request)
                },
                // Lock contention never reached the gateway.
                |outcome| !matches!(outcome, AttemptOutcome::LockNotAcquired),
            )
            .await;

        let result = match outcome {
            Ok(AttemptOutcome::LockNotAcquired) => {
                self.stats.pending.fetch_add(1, Ordering::Relaxed);
                warn!(
                    rfq_number = %request.rfq_number,
                    source_id = %request.source_id,
                    "Lock held by another consumer, leaving for redelivery"
                );
                SyncResult::lock_not_acquired(request, started_at)
            }
            Ok(AttemptOutcome::Duplicate(destination_id)) => {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                info!(
                    rfq_number = %request.rfq_number,
                    source_id = %request.source_id,
                    destination_id = %destination_id,
                    "RFQ already synced"
                );
                SyncResult::completed(request, started_at, destination_id)
            }
            Ok(AttemptOutcome::Created(destination_id)) => {
                self.stats.successful.fetch_add(1, Ordering::Relaxed);
                let result = SyncResult::completed(request, started_at, destination_id);
                info!(
                    rfq_number = %request.rfq_number,
                    source_id = %request.source_id,
                    destination_id = result.destination_id.as_deref().unwrap_or_default(),
                    duration_ms = result.duration_ms,
                    "RFQ synced"
                );
                result
            }
            Err(error @ SyncError::CircuitOpen { .. }) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(rfq_number = %request.rfq_number, error = %error, "Sync rejected by circuit breaker");
                SyncResult::failed(request, started_at, &error)
            }
            Err(error) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                metrics::record_sync_error(error.kind());
                let result = SyncResult::failed(request, started_at, &error);
                metrics::record_sync_outcome(&result);
                return Err(SyncFailure { result, error });
            }
        };

        metrics::record_sync_outcome(&result);
        Ok(result)
    }

    async fn attempt(&self, request: &SyncRequest) -> crate::error::Result<AttemptOutcome> {
        let outcome = self
            .lock
            .with_lock(&request.source_id, || self.locked_attempt(request))
            .await?;
        Ok(outcome.unwrap_or(AttemptOutcome::LockNotAcquired))
    }

    async fn locked_attempt(&self, request: &SyncRequest) -> crate::error::Result<AttemptOutcome> {
        if let Some(destination_id) = self.gate.lookup(&request.source_id).await? {
            return Ok(AttemptOutcome::Duplicate(destination_id));
        }

        let record = self.transformer.prepare(&request.source_id, &request.rfq_data)?;
        let destination_id = self.gate.gateway().create(&record).await?;
        self.gate.remember(&request.source_id, &destination_id).await;

        Ok(AttemptOutcome::Created(destination_id))
    }
}
