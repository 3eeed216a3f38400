// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Idempotency gate: "has this source record already been materialized?"
//!
//! Two layers, checked in order:
//!
//! 1. the id cache in the shared store (`<prefix>map:<id>` → destination id)
//! 2. the destination database's external-reference lookup
//!
//! A database hit backfills the cache. Cache writes are best effort: a
//! failure is logged and the database remains the source of truth.

use crate::error::Result;
use crate::gateway::RecordGateway;
use crate::metrics;
use crate::store::SharedStore;
use std::time::Duration;
use tracing::{debug, warn};

/// Default TTL for cached mappings (30 days).
pub const DEFAULT_MAPPING_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Cache-then-database duplicate check.
#[derive(Debug, Clone)]
pub struct IdempotencyGate<S, G> {
    store: S,
    gateway: G,
    prefix: String,
    ttl: Duration,
}

impl<S: SharedStore, G: RecordGateway> IdempotencyGate<S, G> {
    pub fn new(store: S, gateway: G, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            gateway,
            prefix: prefix.into(),
            ttl,
        }
    }

    /// Cache key for a source id.
    pub fn key_for(&self, source_id: &str) -> String {
        format!("{}map:{}", self.prefix, source_id)
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Destination id for `source_id`, if it has already been created.
    pub async fn lookup(&self, source_id: &str) -> Result<Option<String>> {
        let key = self.key_for(source_id);

        match self.store.get(&key).await {
            Ok(Some(destination_id)) => {
                metrics::record_idempotency_hit("cache");
                return Ok(Some(destination_id));
            }
            Ok(None) => {}
            // The database answers authoritatively; a cache outage only costs a query.
            Err(e) => warn!(source_id = %source_id, error = %e, "Id cache read failed"),
        }

        let existing = self.gateway.find_by_external_id(source_id).await?;
        match existing {
            Some(record) => {
                metrics::record_idempotency_hit("database");
                debug!(source_id = %source_id, destination_id = %record.id, "Found existing destination record");
                self.remember(source_id, &record.id).await;
                Ok(Some(record.id))
            }
            None => Ok(None),
        }
    }

    /// Cache `source_id → destination_id`. Never fails.
    pub async fn remember(&self, source_id: &str, destination_id: &str) {
        let key = self.key_for(source_id);
        if let Err(e) = self.store.set_with_ttl(&key, destination_id, self.ttl).await {
            warn!(source_id = %source_id, error = %e, "Failed to cache id mapping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BoxFuture, SyncError};
    use crate::gateway::MemoryGateway;
    use crate::model::RfqPayload;
    use crate::store::MemoryStore;
    use crate::transformer::Transformer;
    use serde_json::json;
    use std::sync::Arc;

    /// Store whose every call fails.
    struct BrokenStore;

    impl SharedStore for BrokenStore {
        fn set_if_absent(&self, _: &str, _: &str, _: Duration) -> BoxFuture<'_, bool> {
            Box::pin(async { Err(SyncError::store_msg("SET NX", "down")) })
        }
        fn delete_if_equals(&self, _: &str, _: &str) -> BoxFuture<'_, bool> {
            Box::pin(async { Err(SyncError::store_msg("EVAL", "down")) })
        }
        fn get(&self, _: &str) -> BoxFuture<'_, Option<String>> {
            Box::pin(async { Err(SyncError::store_msg("GET", "down")) })
        }
        fn set_with_ttl(&self, _: &str, _: &str, _: Duration) -> BoxFuture<'_, ()> {
            Box::pin(async { Err(SyncError::store_msg("SET PX", "down")) })
        }
    }

    async fn seeded_gateway(source_id: &str) -> (Arc<MemoryGateway>, String) {
        let gateway = Arc::new(MemoryGateway::new());
        let payload = RfqPayload::from_value(&json!({
            "rfq_number": "RFQ-1",
            "customer": {"email": "a@b.com"},
            "line_items": [{"description": "Bolt"}]
        }))
        .unwrap();
        let id = gateway
            .create(&Transformer::default().transform(source_id, &payload))
            .await
            .unwrap();
        (gateway, id)
    }

    #[tokio::test]
    async fn test_miss_everywhere() {
        let gate = IdempotencyGate::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryGateway::new()),
            "rfq_sync:",
            DEFAULT_MAPPING_TTL,
        );
        assert!(gate.lookup("src-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_database_hit_backfills_cache() {
        let (gateway, id) = seeded_gateway("src-1").await;
        let store = Arc::new(MemoryStore::new());
        let gate = IdempotencyGate::new(store.clone(), gateway, "rfq_sync:", DEFAULT_MAPPING_TTL);

        assert_eq!(gate.lookup("src-1").await.unwrap(), Some(id.clone()));
        assert_eq!(
            store.get("rfq_sync:map:src-1").await.unwrap(),
            Some(id)
        );
    }

    #[tokio::test]
    async fn test_cache_hit_skips_database() {
        let store = Arc::new(MemoryStore::new());
        let gate = IdempotencyGate::new(
            store,
            Arc::new(MemoryGateway::new()),
            "rfq_sync:",
            DEFAULT_MAPPING_TTL,
        );
        gate.remember("src-1", "rfq_cached").await;
        assert_eq!(gate.lookup("src-1").await.unwrap().as_deref(), Some("rfq_cached"));
    }

    #[tokio::test]
    async fn test_cache_outage_falls_back_to_database() {
        let (gateway, id) = seeded_gateway("src-1").await;
        let gate = IdempotencyGate::new(BrokenStore, gateway, "rfq_sync:", DEFAULT_MAPPING_TTL);
        assert_eq!(gate.lookup("src-1").await.unwrap(), Some(id));
        // remember() swallows the failure
        gate.remember("src-2", "rfq_x").await;
    }
}
