// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the RFQ sync service.
//!
//! Errors are categorized by where they come from (shared store, destination
//! database, bus) and by whether retrying can possibly help.
//!
//! # Error Categories
//!
//! | Error Type | Kind | Retryable | Description |
//! |------------|------|-----------|-------------|
//! | `Store` | TransientInfra | Yes | Redis lock/cache unreachable, timeouts |
//! | `Database` | TransientInfra | Yes | Destination Postgres errors |
//! | `Bus` | TransientInfra | Yes | Stream read/publish/ack failures |
//! | `Validation` | Validation | No | RFQ payload is missing required fields |
//! | `Decode` | Decode | No | Bus message is not a valid sync request |
//! | `CircuitOpen` | CircuitOpen | No | Breaker is open, downstream not touched |
//! | `Config` | Fatal | No | Configuration invalid |
//! | `InvalidState` | Fatal | No | Consumer state machine violation |
//! | `Shutdown` | Fatal | No | Consumer is shutting down |
//! | `Internal` | Fatal | No | Unexpected internal error |
//!
//! Lock contention is deliberately absent: a held lock is not an error, it
//! yields a `pending` [`SyncResult`](crate::model::SyncResult).
//!
//! # Retry Behavior
//!
//! Use [`SyncError::is_retryable()`] to decide whether an attempt should be
//! retried with backoff. Validation and decode errors are deterministic, so
//! retrying them only burns attempts.

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Boxed future returned by the store, gateway and bus traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Coarse classification used by the retry policy, the breaker and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Input is malformed; never retried.
    Validation,
    /// Message payload could not be decoded; never retried.
    Decode,
    /// Downstream infrastructure trouble; retried and counted by the breaker.
    TransientInfra,
    /// Fast-fail while the breaker is open.
    CircuitOpen,
    /// Programming or configuration error.
    Fatal,
}

impl ErrorKind {
    /// Label used for the `error_type` metric dimension.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Decode => "decode",
            Self::TransientInfra => "transient_infra",
            Self::CircuitOpen => "circuit_open",
            Self::Fatal => "fatal",
        }
    }

    /// Terminal input errors say nothing about downstream health.
    pub fn is_terminal_input(&self) -> bool {
        matches!(self, Self::Validation | Self::Decode)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while syncing an RFQ.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Shared-store (Redis) command error.
    ///
    /// Occurs when acquiring/releasing locks or reading the id cache.
    #[error("Store error ({operation}): {message}")]
    Store {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// Destination database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Message bus error (read, publish or acknowledge).
    #[error("Bus error ({operation}): {message}")]
    Bus { operation: String, message: String },

    /// RFQ payload failed validation.
    ///
    /// Carries every problem found, in the order they were checked.
    #[error("Validation failed: {}", .0.join(", "))]
    Validation(Vec<String>),

    /// Bus message could not be decoded into a sync request.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Circuit breaker is open; the attempt was rejected without I/O.
    #[error("Circuit breaker '{circuit}' open: service unavailable")]
    CircuitOpen { circuit: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Consumer state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create a store error from a redis::RedisError
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Store {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a store error without source
    pub fn store_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a bus error
    pub fn bus(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Bus {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store { .. } | Self::Database(_) | Self::Bus { .. } => ErrorKind::TransientInfra,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Decode(_) => ErrorKind::Decode,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Config(_) | Self::InvalidState { .. } | Self::Shutdown | Self::Internal(_) => {
                ErrorKind::Fatal
            }
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientInfra
    }
}

impl From<redis::RedisError> for SyncError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}
