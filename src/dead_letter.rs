// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dead-letter routing for poison messages.
//!
//! A message that cannot be processed is wrapped in a [`DeadLetterEntry`] and
//! published to `rfq.dlq` under key `dlq_<unix-millis>`. Routing fails open:
//! if the DLQ publish itself fails, the failure is logged and counted, and
//! the caller carries on.

use crate::bus::MessageBus;
use crate::metrics;
use crate::model::DeadLetterEntry;
use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

/// Default dead-letter topic.
pub const DLQ_TOPIC: &str = "rfq.dlq";

/// Publishes [`DeadLetterEntry`]s to the dead-letter topic.
#[derive(Debug)]
pub struct DeadLetterRouter<B> {
    bus: B,
    topic: String,
    routed: AtomicU64,
    publish_failures: AtomicU64,
}

impl<B: MessageBus> DeadLetterRouter<B> {
    pub fn new(bus: B) -> Self {
        Self::with_topic(bus, DLQ_TOPIC)
    }

    pub fn with_topic(bus: B, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
            routed: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Entries successfully published.
    pub fn routed(&self) -> u64 {
        self.routed.load(Ordering::Relaxed)
    }

    /// DLQ publishes that failed and were swallowed.
    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    /// Dead-letter `payload` from `original_topic`. Never fails.
    ///
    /// A payload that is not valid JSON is carried as a JSON string.
    pub async fn route(&self, original_topic: &str, payload: &str, reason: &str) {
        let now = Utc::now();
        let original_event = serde_json::from_str::<Value>(payload)
            .unwrap_or_else(|_| Value::String(payload.to_string()));
        let entry = DeadLetterEntry {
            original_topic: original_topic.to_string(),
            original_event,
            failure_reason: reason.to_string(),
            failure_timestamp: now,
        };
        let key = format!("dlq_{}", now.timestamp_millis());

        error!(
            original_topic = %original_topic,
            reason = %reason,
            "Routing message to dead-letter topic"
        );

        let published = match serde_json::to_value(&entry) {
            Ok(value) => self.bus.publish(&self.topic, &key, &value).await.map(|_| ()),
            Err(e) => Err(e.into()),
        };

        match published {
            Ok(()) => {
                self.routed.fetch_add(1, Ordering::Relaxed);
                metrics::record_dead_letter(original_topic);
            }
            Err(e) => {
                self.publish_failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_dead_letter_publish_failure();
                error!(
                    original_topic = %original_topic,
                    error = %e,
                    "Failed to publish to dead-letter topic"
                );
            }
        }
    }
}
