//! Consumer state and options.
//!
//! # State Transitions
//!
//! ```text
//!            start()                 (subscribed)
//! Stopped ───────────→ Starting ───────────────→ Running
//!    ↑                     │                        │
//!    │  (subscribe failed) │              shutdown()│
//!    ├─────────────────────┘                        ↓
//!    └──────────────────────────────────────── Stopping
//!                (loop drained or timed out)
//! ```

use crate::config::{SyncConfig, TopicConfig};
use std::time::Duration;

/// State of the sync consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Not consuming. Initial and terminal state; `start()` is only valid here.
    Stopped,

    /// Joining the consumer group on the input topics.
    Starting,

    /// Polling and handling messages.
    Running,

    /// Stop requested; the in-flight message is allowed to finish.
    Stopping,
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsumerState::Stopped => write!(f, "Stopped"),
            ConsumerState::Starting => write!(f, "Starting"),
            ConsumerState::Running => write!(f, "Running"),
            ConsumerState::Stopping => write!(f, "Stopping"),
        }
    }
}

/// Runtime knobs for the consumption loop.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Stamped on completion events; status changes carrying it are echoes.
    pub service_name: String,
    pub topics: TopicConfig,
    /// Maximum messages per poll.
    pub batch_size: usize,
    /// How long a poll may wait for new messages.
    pub block_timeout: Duration,
    /// How long `shutdown()` waits for the in-flight message.
    pub drain_timeout: Duration,
    /// Pause after a failed poll.
    pub error_backoff: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            service_name: "rfq-sync-service".to_string(),
            topics: TopicConfig::default(),
            batch_size: 50,
            block_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(30),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl ConsumerOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            service_name: config.service_name.clone(),
            topics: config.topics.clone(),
            batch_size: config.bus.batch_size,
            block_timeout: config.bus.block_timeout_duration(),
            ..Self::default()
        }
    }
}
