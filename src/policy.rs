// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry + circuit-breaker policy around one orchestration step.
//!
//! ```text
//! execute(op)
//!   │
//!   ├─ breaker rejects ──────────────► Err(CircuitOpen)      (op never runs)
//!   │
//!   └─ loop attempt = 1..=max_attempts
//!        op(attempt)
//!          ├─ Ok, reached downstream  ► record_success, Ok
//!          ├─ Ok, never reached it    ► record_neutral, Ok   (e.g. lock held)
//!          ├─ transient, attempts left► warn, sleep(backoff), retry
//!          ├─ transient, exhausted    ► record_failure, Err
//!          └─ anything else           ► record_neutral, Err  (no retry)
//! ```
//!
//! The breaker sees one outcome per `execute` call, not per attempt, so a
//! single message whose retries all fail counts as one failure.

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::resilience::RetryConfig;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Composes a shared [`CircuitBreaker`] with a [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct SyncPolicy {
    breaker: Arc<CircuitBreaker>,
    retry: RetryConfig,
    retries: Arc<AtomicU64>,
}

impl SyncPolicy {
    pub fn new(breaker: Arc<CircuitBreaker>, retry: RetryConfig) -> Self {
        Self {
            breaker,
            retry,
            retries: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Total retries performed (attempts beyond the first).
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Run `op` under the policy. `op` receives the 1-based attempt number.
    /// Every `Ok` counts as evidence that downstream is healthy.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_classified(op, |_| true).await
    }

    /// Like [`execute`](Self::execute), but `reached_downstream` decides
    /// whether an `Ok` value says anything about downstream health. Values
    /// for which it returns `false` are reported as neutral, so a half-open
    /// trial that never touched downstream neither closes nor reopens the
    /// breaker.
    pub async fn execute_classified<F, Fut, T, C>(&self, mut op: F, reached_downstream: C) -> Result<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&T) -> bool,
    {
        if !self.breaker.try_acquire() {
            metrics::record_circuit_rejection(self.breaker.name());
            return Err(SyncError::CircuitOpen {
                circuit: self.breaker.name().to_string(),
            });
        }

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match op(attempt).await {
                Ok(value) => {
                    if reached_downstream(&value) {
                        self.breaker.record_success();
                    } else {
                        self.breaker.record_neutral();
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                self.breaker.record_neutral();
                return Err(error);
            }

            if attempt >= max_attempts {
                self.breaker.record_failure();
                return Err(error);
            }

            let delay = self.retry.delay_for_attempt(attempt);
            self.retries.fetch_add(1, Ordering::Relaxed);
            metrics::record_retry(error.kind());
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
