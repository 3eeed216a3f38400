// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration tests against real Redis and Postgres.
//!
//! Tests use testcontainers for portability - no external docker-compose required.
//!
//! # Running Tests
//! ```bash
//! # Run all integration tests (requires Docker)
//! cargo test --test integration -- --ignored
//!
//! # Run specific test
//! cargo test --test integration redis_lock -- --ignored
//! ```
//!
//! # Test Organization
//! - `redis_*` - shared store and distributed lock
//! - `stream_*` - Redis Streams bus (consumer groups, redelivery)
//! - `postgres_*` - destination gateway
//! - `e2e_*` - the whole service wired to real backends

mod common;

use common::{
    eventually, postgres_container, postgres_gateway, postgres_url, redis_container, redis_url,
    sync_payload, valid_data,
};
use rfq_sync::config::{BusConfig, OffsetReset};
use rfq_sync::consumer::ConsumerOptions;
use rfq_sync::{
    CircuitBreaker, CircuitConfig, DistributedLock, MessageBus, OrchestratorOptions,
    RecordGateway, RedisStore, RedisStreamBus, RetryConfig, SharedStore, SyncConsumer,
    SyncOrchestrator, SyncPolicy, Transformer,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::clients::Cli;

fn bus_config(url: &str, consumer: &str, redelivery_idle_sec: u64) -> BusConfig {
    BusConfig {
        url: url.to_string(),
        consumer_group: "rfq-sync-test".to_string(),
        consumer_name: consumer.to_string(),
        offset_reset: OffsetReset::Earliest,
        batch_size: 10,
        block_timeout: "100ms".to_string(),
        redelivery_idle_sec,
    }
}

fn topics(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

// =============================================================================
// Shared Store + Lock
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_lock_is_exclusive_and_released() {
    let docker = Cli::default();
    let container = redis_container(&docker);
    let store = RedisStore::connect(&redis_url(&container), &RetryConfig::testing())
        .await
        .expect("Failed to connect");
    let lock = DistributedLock::new(Arc::new(store), "rfq_sync:", Duration::from_secs(30));

    let handle = lock.acquire("src-1").await.unwrap().expect("first acquire wins");
    assert_eq!(handle.key(), "rfq_sync:lock:src-1");
    assert!(lock.acquire("src-1").await.unwrap().is_none());
    assert!(lock.acquire("src-2").await.unwrap().is_some());

    assert!(lock.release(handle).await.unwrap());
    assert!(lock.acquire("src-1").await.unwrap().is_some());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_lock_expired_holder_cannot_release_successor() {
    let docker = Cli::default();
    let container = redis_container(&docker);
    let store = Arc::new(
        RedisStore::connect(&redis_url(&container), &RetryConfig::testing())
            .await
            .unwrap(),
    );
    let lock = DistributedLock::new(store.clone(), "rfq_sync:", Duration::from_millis(200));

    let stale = lock.acquire("src-1").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    let current = lock.acquire("src-1").await.unwrap().expect("expired lock is free");

    assert!(!lock.release(stale).await.unwrap());
    assert_eq!(
        store.get("rfq_sync:lock:src-1").await.unwrap().as_deref(),
        Some(current.token())
    );
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_store_values_expire() {
    let docker = Cli::default();
    let container = redis_container(&docker);
    let store = RedisStore::connect(&redis_url(&container), &RetryConfig::testing())
        .await
        .unwrap();

    store
        .set_with_ttl("rfq_sync:map:src-1", "rfq_abc", Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(store.get("rfq_sync:map:src-1").await.unwrap().as_deref(), Some("rfq_abc"));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(store.get("rfq_sync:map:src-1").await.unwrap().is_none());
}

#[tokio::test]
async fn redis_connect_rejects_bad_url() {
    let result = RedisStore::connect("not-a-url", &RetryConfig::testing()).await;
    assert!(result.is_err());
}

// =============================================================================
// Redis Streams Bus
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn stream_bus_publish_poll_ack() {
    let docker = Cli::default();
    let container = redis_container(&docker);
    let url = redis_url(&container);
    let bus = RedisStreamBus::connect(&bus_config(&url, "c1", 60), &RetryConfig::testing())
        .await
        .unwrap();

    bus.subscribe(&topics(&["rfq.sync.to_medusa"])).await.unwrap();
    // Re-subscribing hits BUSYGROUP and is fine.
    bus.subscribe(&topics(&["rfq.sync.to_medusa"])).await.unwrap();

    let id = bus
        .publish("rfq.sync.to_medusa", "RFQ-1", &json!({"hello": "world"}))
        .await
        .unwrap();

    let batch = bus.poll(10, Duration::from_millis(500)).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, id);
    assert_eq!(batch[0].topic, "rfq.sync.to_medusa");
    assert_eq!(batch[0].key.as_deref(), Some("RFQ-1"));
    assert_eq!(batch[0].payload, r#"{"hello":"world"}"#);

    bus.ack(&batch[0]).await.unwrap();
    assert!(bus.poll(10, Duration::from_millis(100)).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn stream_unacked_entry_is_reclaimed() {
    let docker = Cli::default();
    let container = redis_container(&docker);
    let url = redis_url(&container);
    let first = RedisStreamBus::connect(&bus_config(&url, "c1", 0), &RetryConfig::testing())
        .await
        .unwrap();
    let second = RedisStreamBus::connect(&bus_config(&url, "c2", 0), &RetryConfig::testing())
        .await
        .unwrap();
    let input = topics(&["rfq.sync.to_medusa"]);
    first.subscribe(&input).await.unwrap();
    second.subscribe(&input).await.unwrap();

    let id = first
        .publish("rfq.sync.to_medusa", "RFQ-1", &json!({"n": 1}))
        .await
        .unwrap();
    let taken = first.poll(10, Duration::from_millis(500)).await.unwrap();
    assert_eq!(taken[0].id, id);

    // Never acked by c1; c2 claims it once idle.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let reclaimed = second.poll(10, Duration::from_millis(100)).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, id);

    second.ack(&reclaimed[0]).await.unwrap();
    assert!(first.poll(10, Duration::from_millis(100)).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn stream_poll_before_subscribe_fails() {
    let docker = Cli::default();
    let container = redis_container(&docker);
    let config = bus_config(&redis_url(&container), "c1", 60);
    let bus = RedisStreamBus::connect(&config, &RetryConfig::testing()).await.unwrap();
    assert!(bus.poll(10, Duration::from_millis(10)).await.is_err());
}

// =============================================================================
// Postgres Gateway
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn postgres_create_is_unique_per_external_id() {
    let docker = Cli::default();
    let container = postgres_container(&docker);
    let gateway = postgres_gateway(&postgres_url(&container)).await;

    let record = Transformer::default().prepare("src-1", &valid_data()).unwrap();
    let first = gateway.create(&record).await.unwrap();
    let second = gateway.create(&record).await.unwrap();
    assert_eq!(first, second);
    assert!(first.starts_with("rfq_"));

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rfq WHERE external_id = $1")
        .bind("src-1")
        .fetch_one(gateway.pool())
        .await
        .unwrap();
    assert_eq!(count, 1);

    let found = gateway.find_by_external_id("src-1").await.unwrap().unwrap();
    assert_eq!(found.id, first);
    assert_eq!(found.rfq_number, "RFQ-100");
    assert_eq!(found.status, "received");
    assert_eq!(found.sync_status, "synced");

    assert!(gateway.find_by_external_id("missing").await.unwrap().is_none());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn postgres_update_status() {
    let docker = Cli::default();
    let container = postgres_container(&docker);
    let gateway = postgres_gateway(&postgres_url(&container)).await;

    let record = Transformer::default().prepare("src-1", &valid_data()).unwrap();
    let id = gateway.create(&record).await.unwrap();

    assert!(gateway.update_status(&id, "quoted").await.unwrap());
    assert!(!gateway.update_status("rfq_nope", "quoted").await.unwrap());
    let found = gateway.find_by_external_id("src-1").await.unwrap().unwrap();
    assert_eq!(found.status, "quoted");
}

#[tokio::test]
#[ignore] // Requires Docker
async fn postgres_concurrent_creates_race_to_one_row() {
    let docker = Cli::default();
    let container = postgres_container(&docker);
    let gateway = postgres_gateway(&postgres_url(&container)).await;
    let record = Transformer::default().prepare("src-1", &valid_data()).unwrap();

    let ids = futures::future::join_all((0..8).map(|_| gateway.create(&record))).await;
    let ids: Vec<String> = ids.into_iter().map(|r| r.unwrap()).collect();
    assert!(ids.windows(2).all(|w| w[0] == w[1]));
}

// =============================================================================
// End to End
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn e2e_request_to_completion_event() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let postgres = postgres_container(&docker);
    let url = redis_url(&redis);

    let store = Arc::new(RedisStore::connect(&url, &RetryConfig::testing()).await.unwrap());
    let gateway = Arc::new(postgres_gateway(&postgres_url(&postgres)).await);
    let bus = Arc::new(
        RedisStreamBus::connect(&bus_config(&url, "c1", 60), &RetryConfig::testing())
            .await
            .unwrap(),
    );
    let policy = SyncPolicy::new(
        Arc::new(CircuitBreaker::new("rfq_sync", CircuitConfig::default())),
        RetryConfig::testing(),
    );
    let orchestrator = Arc::new(SyncOrchestrator::new(
        store,
        gateway.clone(),
        policy,
        OrchestratorOptions::default(),
    ));
    let options = ConsumerOptions {
        block_timeout: Duration::from_millis(100),
        ..ConsumerOptions::default()
    };
    let mut consumer = SyncConsumer::new(orchestrator, bus.clone(), options);
    consumer.start().await.unwrap();

    let request: serde_json::Value = serde_json::from_str(&sync_payload("src-1", valid_data())).unwrap();
    bus.publish("rfq.sync.to_medusa", "RFQ-100", &request).await.unwrap();

    let conn = rfq_sync::store::connect(&url, &RetryConfig::testing()).await.unwrap();
    let completed = eventually(Duration::from_secs(10), || {
        let mut conn = conn.clone();
        async move {
            let len: usize = redis::AsyncCommands::xlen(&mut conn, "rfq.sync.completed")
                .await
                .unwrap_or(0);
            len > 0
        }
    })
    .await;
    consumer.shutdown().await;
    assert!(completed, "no completion event on rfq.sync.completed");

    let found = gateway.find_by_external_id("src-1").await.unwrap().unwrap();
    assert_eq!(found.status, "received");
    assert_eq!(consumer.stats().successful, 1);
}
