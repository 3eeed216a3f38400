//! # RFQ Sync
//!
//! Event-driven sync of RFQs from the procurement (email) service into the
//! commerce backend.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               rfq-sync                                   │
//! │                                                                          │
//! │  rfq.sync.to_medusa ─┐                                                   │
//! │  rfq.status.changed ─┤  ┌──────────────┐    ┌─────────────────────────┐  │
//! │                      └─►│ SyncConsumer │───►│ SyncOrchestrator        │  │
//! │                         │ (poll + ack) │    │  SyncPolicy (breaker +  │  │
//! │                         └──────────────┘    │   retry)                │  │
//! │                            │        │       │  DistributedLock        │  │
//! │                            │        │       │  IdempotencyGate        │  │
//! │                            ▼        ▼       │  Transformer            │  │
//! │               rfq.sync.completed  rfq.dlq   │  RecordGateway          │  │
//! │                                             └─────────────────────────┘  │
//! │                                                  │              │        │
//! │                                             Redis (lock,    Postgres     │
//! │                                             id cache)       (rfq table)  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each message is handled once per delivery: the lock keeps concurrent
//! consumers off the same source record, the idempotency gate turns
//! redeliveries into no-ops, and anything the pipeline cannot process ends
//! up on the dead-letter topic.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rfq_sync::{
//!     CircuitBreaker, CircuitConfig, ConsumerOptions, MemoryBus, MemoryGateway, MemoryStore,
//!     OrchestratorOptions, RetryConfig, SyncConsumer, SyncOrchestrator, SyncPolicy,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let policy = SyncPolicy::new(
//!         Arc::new(CircuitBreaker::new("rfq_sync", CircuitConfig::default())),
//!         RetryConfig::default(),
//!     );
//!     let orchestrator = Arc::new(SyncOrchestrator::new(
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(MemoryGateway::new()),
//!         policy,
//!         OrchestratorOptions::default(),
//!     ));
//!
//!     let mut consumer =
//!         SyncConsumer::new(orchestrator, Arc::new(MemoryBus::new()), ConsumerOptions::default());
//!     consumer.start().await.expect("Failed to start");
//!
//!     // Consumer runs until shutdown
//!     consumer.shutdown().await;
//! }
//! ```

pub mod bus;
pub mod circuit_breaker;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod error;
pub mod gateway;
pub mod idempotency;
pub mod lock;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod policy;
pub mod resilience;
pub mod store;
pub mod transformer;

// Re-exports for convenience
pub use bus::{BusMessage, MemoryBus, MessageBus, RedisStreamBus};
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitState};
pub use config::SyncConfig;
pub use consumer::{ConsumerOptions, ConsumerState, SyncConsumer};
pub use dead_letter::DeadLetterRouter;
pub use error::{ErrorKind, Result, SyncError};
pub use gateway::{MemoryGateway, PgRecordGateway, RecordGateway};
pub use lock::{DistributedLock, LockHandle};
pub use model::{SyncRequest, SyncResult, SyncStatus};
pub use orchestrator::{OrchestratorOptions, SyncFailure, SyncOrchestrator};
pub use policy::SyncPolicy;
pub use resilience::RetryConfig;
pub use store::{MemoryStore, RedisStore, SharedStore};
pub use transformer::Transformer;
