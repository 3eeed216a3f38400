//! Per-message handling: decode, dispatch by topic, publish, dead-letter, ack.
//!
//! | topic | outcome | completion event | dead letter | ack |
//! |-------|---------|------------------|-------------|-----|
//! | sync request | undecodable | - | yes | yes |
//! | sync request | completed (new or duplicate) | yes | - | yes |
//! | sync request | pending (lock held) | yes | - | no |
//! | sync request | failed (circuit open) | yes | - | no |
//! | sync request | error escaped orchestrator | yes (failed) | yes | yes |
//! | status change | echo / unmapped status / unknown record / applied | - | - | yes |
//! | status change | error | - | yes | yes |
//! | other | - | - | - | yes |
//!
//! Unacknowledged messages come back after the bus redelivery window.

use super::types::ConsumerOptions;
use crate::bus::{BusMessage, MessageBus};
use crate::dead_letter::DeadLetterRouter;
use crate::error::{Result, SyncError};
use crate::gateway::RecordGateway;
use crate::metrics;
use crate::model::{StatusChangedEvent, SyncRequest, SyncResult};
use crate::orchestrator::SyncOrchestrator;
use crate::store::SharedStore;
use crate::transformer::known_status;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What to do with a message once handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Leave unacknowledged for redelivery.
    Leave,
}

impl Disposition {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Ack => "acked",
            Self::Leave => "left_for_redelivery",
        }
    }
}

/// Routes one [`BusMessage`] to the orchestrator or the status updater.
pub struct MessageHandler<S, G, B> {
    orchestrator: Arc<SyncOrchestrator<S, G>>,
    bus: Arc<B>,
    dead_letters: DeadLetterRouter<Arc<B>>,
    options: ConsumerOptions,
}

impl<S, G, B> MessageHandler<S, G, B>
where
    S: SharedStore + Clone,
    G: RecordGateway,
    B: MessageBus,
{
    pub fn new(orchestrator: Arc<SyncOrchestrator<S, G>>, bus: Arc<B>, options: ConsumerOptions) -> Self {
        let dead_letters = DeadLetterRouter::with_topic(bus.clone(), options.topics.dead_letter.clone());
        Self {
            orchestrator,
            bus,
            dead_letters,
            options,
        }
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator<S, G>> {
        &self.orchestrator
    }

    pub fn bus(&self) -> &Arc<B> {
        &self.bus
    }

    pub fn dead_letters(&self) -> &DeadLetterRouter<Arc<B>> {
        &self.dead_letters
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    /// Handle one message and acknowledge it unless it must be redelivered.
    pub async fn handle(&self, message: &BusMessage) -> Disposition {
        let topics = &self.options.topics;
        let disposition = if message.topic == topics.sync_request {
            self.handle_sync_request(message).await
        } else if message.topic == topics.status_changed {
            self.handle_status_change(message).await
        } else {
            warn!(topic = %message.topic, stream_id = %message.id, "Message on unknown topic, acknowledging");
            Disposition::Ack
        };

        if disposition == Disposition::Ack {
            if let Err(e) = self.bus.ack(message).await {
                metrics::record_bus_error("ack");
                warn!(topic = %message.topic, stream_id = %message.id, error = %e, "Failed to acknowledge message");
            }
        }
        metrics::record_message(&message.topic, disposition.as_str());
        disposition
    }

    async fn handle_sync_request(&self, message: &BusMessage) -> Disposition {
        let request = match SyncRequest::decode(&message.payload) {
            Ok(request) => request,
            Err(e) => {
                self.dead_letters
                    .route(&message.topic, &message.payload, &e.to_string())
                    .await;
                return Disposition::Ack;
            }
        };

        debug!(
            rfq_number = %request.rfq_number,
            source_id = %request.source_id,
            event_id = %request.event_id,
            "Received sync request"
        );

        match self.orchestrator.sync(&request).await {
            Ok(result) => {
                self.publish_completion(&result).await;
                if result.is_completed() {
                    Disposition::Ack
                } else {
                    Disposition::Leave
                }
            }
            Err(failure) => {
                self.publish_completion(&failure.result).await;
                self.dead_letters
                    .route(&message.topic, &message.payload, &failure.to_string())
                    .await;
                Disposition::Ack
            }
        }
    }

    async fn publish_completion(&self, result: &SyncResult) {
        let event = result.to_event(&self.options.service_name);
        let published = match serde_json::to_value(&event) {
            Ok(payload) => self
                .bus
                .publish(&self.options.topics.sync_completed, &result.rfq_number, &payload)
                .await
                .map(|_| ()),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = published {
            metrics::record_bus_error("publish");
            warn!(
                rfq_number = %result.rfq_number,
                source_id = %result.source_id,
                error = %e,
                "Failed to publish sync completion event"
            );
        }
    }

    async fn handle_status_change(&self, message: &BusMessage) -> Disposition {
        let event: StatusChangedEvent = match serde_json::from_str(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                let error = SyncError::from(e);
                self.dead_letters
                    .route(&message.topic, &message.payload, &error.to_string())
                    .await;
                return Disposition::Ack;
            }
        };

        if event.is_echo_of(&self.options.service_name) {
            debug!(event_id = ?event.event_id, "Ignoring our own status change");
            metrics::record_status_change("echo");
            return Disposition::Ack;
        }

        let (Some(source_id), Some(status)) = (event.source_id.as_deref(), event.status.as_deref())
        else {
            debug!(event_id = ?event.event_id, "Status change without record id or status, skipping");
            metrics::record_status_change("skipped");
            return Disposition::Ack;
        };

        let Some(mapped) = known_status(status) else {
            metrics::record_status_change("unmapped");
            warn!(source_id = %source_id, status = %status, "Status change with unmapped status, ignoring");
            return Disposition::Ack;
        };

        let applied = self
            .orchestrator
            .policy()
            .execute(|_| self.apply_status(source_id, mapped))
            .await;

        match applied {
            Ok(Some(destination_id)) => {
                metrics::record_status_change("applied");
                info!(
                    source_id = %source_id,
                    destination_id = %destination_id,
                    status = %mapped,
                    "Applied status change"
                );
                Disposition::Ack
            }
            Ok(None) => {
                metrics::record_status_change("unknown_record");
                info!(source_id = %source_id, "Status change for a record we never synced, skipping");
                Disposition::Ack
            }
            Err(e @ SyncError::CircuitOpen { .. }) => {
                metrics::record_status_change("deferred");
                warn!(source_id = %source_id, error = %e, "Status change deferred by circuit breaker");
                Disposition::Leave
            }
            Err(e) => {
                metrics::record_status_change("failed");
                self.dead_letters
                    .route(&message.topic, &message.payload, &e.to_string())
                    .await;
                Disposition::Ack
            }
        }
    }

    /// Write an already-mapped status. Returns the destination id when the
    /// record exists downstream.
    async fn apply_status(&self, source_id: &str, status: &str) -> Result<Option<String>> {
        let gateway = self.orchestrator.gateway();
        let Some(record) = gateway.find_by_external_id(source_id).await? else {
            return Ok(None);
        };
        let updated = gateway.update_status(&record.id, status).await?;
        Ok(updated.then_some(record.id))
    }
}
