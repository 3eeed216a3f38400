// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync consumer: the long-running bus consumption loop.
//!
//! Ties together:
//! - The [`MessageBus`] (input topics, completion events, dead letters)
//! - The [`SyncOrchestrator`] (one request → one result)
//! - The [`MessageHandler`] (dispatch by topic, ack policy)
//!
//! # Loop
//!
//! One task polls a batch, then handles its messages one at a time. Only the
//! poll races the shutdown signal; a message that has started is always
//! finished. Messages of the current batch that were not started when the
//! stop flag flipped stay unacknowledged and are redelivered.

mod handler;
mod types;

pub use handler::{Disposition, MessageHandler};
pub use types::{ConsumerOptions, ConsumerState};

use crate::bus::MessageBus;
use crate::error::{Result, SyncError};
use crate::gateway::RecordGateway;
use crate::metrics;
use crate::orchestrator::{SyncOrchestrator, SyncStatsSnapshot};
use crate::store::SharedStore;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Consumes sync requests and status changes until shut down.
pub struct SyncConsumer<S, G, B> {
    handler: Arc<MessageHandler<S, G, B>>,

    /// Consumer state (broadcast to watchers)
    state_tx: watch::Sender<ConsumerState>,
    state_rx: watch::Receiver<ConsumerState>,

    /// Stop flag; replaced on every start so a stopped consumer can restart.
    shutdown_tx: watch::Sender<bool>,

    handle: Option<JoinHandle<()>>,
}

impl<S, G, B> SyncConsumer<S, G, B>
where
    S: SharedStore + Clone,
    G: RecordGateway,
    B: MessageBus,
{
    pub fn new(orchestrator: Arc<SyncOrchestrator<S, G>>, bus: Arc<B>, options: ConsumerOptions) -> Self {
        let (state_tx, state_rx) = watch::channel(ConsumerState::Stopped);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            handler: Arc::new(MessageHandler::new(orchestrator, bus, options)),
            state_tx,
            state_rx,
            shutdown_tx,
            handle: None,
        }
    }

    pub fn handler(&self) -> &Arc<MessageHandler<S, G, B>> {
        &self.handler
    }

    pub fn options(&self) -> &ConsumerOptions {
        self.handler.options()
    }

    /// Get current consumer state.
    pub fn state(&self) -> ConsumerState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ConsumerState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ConsumerState::Running
    }

    /// Orchestrator counters.
    pub fn stats(&self) -> SyncStatsSnapshot {
        self.handler.orchestrator().stats()
    }

    fn set_state(&self, state: ConsumerState) {
        let _ = self.state_tx.send(state);
        metrics::record_consumer_state(&state.to_string());
    }

    /// Join the consumer group and spawn the consumption loop.
    ///
    /// Fails with [`SyncError::InvalidState`] unless the consumer is
    /// `Stopped`. If subscribing fails the consumer goes back to `Stopped`
    /// and the error is returned.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != ConsumerState::Stopped {
            return Err(SyncError::InvalidState {
                expected: ConsumerState::Stopped.to_string(),
                actual: self.state().to_string(),
            });
        }

        let options = self.handler.options().clone();
        let topics = options.topics.inputs();
        info!(
            service = %options.service_name,
            topics = ?topics,
            batch_size = options.batch_size,
            "Starting sync consumer"
        );
        self.set_state(ConsumerState::Starting);

        if let Err(e) = self.handler.bus().subscribe(&topics).await {
            error!(error = %e, "Failed to subscribe to input topics");
            self.set_state(ConsumerState::Stopped);
            return Err(e);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = shutdown_tx;

        let handler = Arc::clone(&self.handler);
        let span = info_span!("consumer", consumer = %options.service_name);
        self.handle = Some(tokio::spawn(run_loop(handler, shutdown_rx).instrument(span)));

        self.set_state(ConsumerState::Running);
        info!("Sync consumer running");
        Ok(())
    }

    /// Stop intake and wait for the in-flight message, up to the drain timeout.
    ///
    /// No-op unless the consumer is `Running`.
    pub async fn shutdown(&mut self) {
        if self.state() != ConsumerState::Running {
            debug!(state = %self.state(), "Shutdown requested while not running");
            return;
        }

        info!("Shutting down sync consumer");
        self.set_state(ConsumerState::Stopping);
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.handle.take() {
            let drain_timeout = self.handler.options().drain_timeout;
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => debug!("Consumer loop completed gracefully"),
                Ok(Err(e)) => warn!(error = %e, "Consumer loop panicked during shutdown"),
                Err(_) => warn!(
                    timeout_ms = drain_timeout.as_millis() as u64,
                    "Consumer loop timed out during shutdown (in-flight message will be redelivered)"
                ),
            }
        }

        self.set_state(ConsumerState::Stopped);
        let stats = self.stats();
        info!(
            total = stats.total,
            successful = stats.successful,
            duplicates = stats.duplicates,
            pending = stats.pending,
            failed = stats.failed,
            dead_letter_publish_failures = self.handler.dead_letters().publish_failures(),
            "Sync consumer stopped"
        );
    }
}

async fn run_loop<S, G, B>(handler: Arc<MessageHandler<S, G, B>>, mut shutdown_rx: watch::Receiver<bool>)
where
    S: SharedStore + Clone,
    G: RecordGateway,
    B: MessageBus,
{
    let options = handler.options().clone();
    let mut consecutive_errors: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let polled = tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received during poll");
                    break;
                }
                continue;
            }

            result = handler.bus().poll(options.batch_size, options.block_timeout) => result,
        };

        let batch = match polled {
            Ok(batch) => {
                consecutive_errors = 0;
                batch
            }
            Err(e) => {
                consecutive_errors += 1;
                metrics::record_bus_error("poll");
                let backoff = options.error_backoff * consecutive_errors.min(10);
                warn!(
                    error = %e,
                    consecutive_errors,
                    backoff_ms = backoff.as_millis() as u64,
                    "Poll failed, backing off"
                );
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(backoff) => {}
                }
                continue;
            }
        };

        if batch.is_empty() {
            continue;
        }

        let started = Instant::now();
        let size = batch.len();
        for (handled, message) in batch.iter().enumerate() {
            if *shutdown_rx.borrow() {
                debug!(
                    unstarted = size - handled,
                    "Stopping mid-batch, remaining messages left for redelivery"
                );
                break;
            }
            handler.handle(message).await;
        }
        metrics::record_batch(size, started.elapsed());
    }

    info!("Consumer loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::circuit_breaker::{CircuitBreaker, CircuitConfig};
    use crate::gateway::MemoryGateway;
    use crate::orchestrator::OrchestratorOptions;
    use crate::policy::SyncPolicy;
    use crate::resilience::RetryConfig;
    use crate::store::MemoryStore;
    use std::time::Duration;

    type TestConsumer = SyncConsumer<Arc<MemoryStore>, Arc<MemoryGateway>, MemoryBus>;

    fn consumer(bus: Arc<MemoryBus>) -> TestConsumer {
        let policy = SyncPolicy::new(
            Arc::new(CircuitBreaker::new("rfq_sync", CircuitConfig::testing())),
            RetryConfig::testing(),
        );
        let orchestrator = Arc::new(SyncOrchestrator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryGateway::new()),
            policy,
            OrchestratorOptions::default(),
        ));
        let options = ConsumerOptions {
            block_timeout: Duration::from_millis(20),
            drain_timeout: Duration::from_secs(2),
            ..ConsumerOptions::default()
        };
        SyncConsumer::new(orchestrator, bus, options)
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let mut consumer = consumer(Arc::new(MemoryBus::new()));
        assert_eq!(consumer.state(), ConsumerState::Stopped);

        consumer.start().await.unwrap();
        assert!(consumer.is_running());

        consumer.shutdown().await;
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid() {
        let mut consumer = consumer(Arc::new(MemoryBus::new()));
        consumer.start().await.unwrap();

        let err = consumer.start().await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidState { .. }));
        assert!(consumer.is_running());

        consumer.shutdown().await;
    }

    #[tokio::test]
    async fn test_subscribe_failure_leaves_consumer_stopped() {
        let bus = Arc::new(MemoryBus::new());
        bus.fail_subscribe().await;
        let mut consumer = consumer(bus);

        let err = consumer.start().await.unwrap_err();
        assert!(matches!(err, SyncError::Bus { .. }));
        assert_eq!(consumer.state(), ConsumerState::Stopped);

        // One-shot failure: a second start succeeds.
        consumer.start().await.unwrap();
        consumer.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_after_shutdown() {
        let mut consumer = consumer(Arc::new(MemoryBus::new()));
        consumer.start().await.unwrap();
        consumer.shutdown().await;
        consumer.start().await.unwrap();
        assert!(consumer.is_running());
        consumer.shutdown().await;
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_when_stopped_is_noop() {
        let mut consumer = consumer(Arc::new(MemoryBus::new()));
        consumer.shutdown().await;
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }
}
