// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Message bus seam.
//!
//! Each topic is a Redis stream of the same name. Entries carry two fields,
//! `key` and `payload` (JSON text). Consumption uses a consumer group:
//!
//! ```text
//! subscribe:  XGROUP CREATE <topic> <group> <$|0> MKSTREAM   (BUSYGROUP ignored)
//! poll:       XAUTOCLAIM <topic> <group> <consumer> <idle-ms> 0-0 COUNT n
//!             then XREADGROUP GROUP <group> <consumer> COUNT n BLOCK ms STREAMS ... >
//! publish:    XADD <topic> * key <key> payload <json>
//! ack:        XACK <topic> <group> <id>
//! ```
//!
//! Unacknowledged entries stay in the group's pending list and are reclaimed
//! by `XAUTOCLAIM` once idle for the redelivery window, which is how lock
//! contention and circuit-open results get retried.
//!
//! [`MemoryBus`] implements the same contract in-process for tests.

use crate::config::{BusConfig, OffsetReset};
use crate::error::{BoxFuture, Result, SyncError};
use crate::resilience::RetryConfig;
use crate::store;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, trace, warn};

/// Stream entry field holding the message key.
pub const FIELD_KEY: &str = "key";
/// Stream entry field holding the JSON payload.
pub const FIELD_PAYLOAD: &str = "payload";

/// A message read from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    /// Stream entry id (e.g. "1700000000000-0"); used to acknowledge.
    pub id: String,
    pub key: Option<String>,
    /// Raw payload text; decoding is the handler's job.
    pub payload: String,
}

/// Pull/publish/ack operations the consumer loop needs.
pub trait MessageBus: Send + Sync + 'static {
    /// Join the consumer group on every topic, creating streams as needed.
    fn subscribe<'a>(&'a self, topics: &'a [String]) -> BoxFuture<'a, ()>;

    /// Next batch of at most `max` messages, waiting up to `block` for one.
    /// An empty batch means nothing arrived in time.
    fn poll(&self, max: usize, block: Duration) -> BoxFuture<'_, Vec<BusMessage>>;

    /// Publish a JSON payload; returns the new entry id.
    fn publish<'a>(&'a self, topic: &'a str, key: &'a str, payload: &'a Value)
        -> BoxFuture<'a, String>;

    /// Mark a message as handled.
    fn ack<'a>(&'a self, message: &'a BusMessage) -> BoxFuture<'a, ()>;
}

impl<T: MessageBus + ?Sized> MessageBus for Arc<T> {
    fn subscribe<'a>(&'a self, topics: &'a [String]) -> BoxFuture<'a, ()> {
        (**self).subscribe(topics)
    }

    fn poll(&self, max: usize, block: Duration) -> BoxFuture<'_, Vec<BusMessage>> {
        (**self).poll(max, block)
    }

    fn publish<'a>(
        &'a self,
        topic: &'a str,
        key: &'a str,
        payload: &'a Value,
    ) -> BoxFuture<'a, String> {
        (**self).publish(topic, key, payload)
    }

    fn ack<'a>(&'a self, message: &'a BusMessage) -> BoxFuture<'a, ()> {
        (**self).ack(message)
    }
}

// =============================================================================
// Redis Streams
// =============================================================================

/// Extract a string field from a stream entry.
fn get_string_field(fields: &HashMap<String, redis::Value>, name: &str) -> Option<String> {
    match fields.get(name)? {
        redis::Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
        redis::Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

fn to_message(topic: &str, id: String, fields: &HashMap<String, redis::Value>) -> BusMessage {
    let payload = get_string_field(fields, FIELD_PAYLOAD).unwrap_or_else(|| {
        // Left empty so the handler's decode step dead-letters it.
        warn!(topic = %topic, stream_id = %id, "Stream entry has no readable payload field");
        String::new()
    });
    BusMessage {
        topic: topic.to_string(),
        key: get_string_field(fields, FIELD_KEY),
        id,
        payload,
    }
}

/// [`MessageBus`] over Redis Streams consumer groups.
///
/// Blocking reads go through their own connection so that a 5 s
/// `XREADGROUP BLOCK` does not stall publishes and acks.
pub struct RedisStreamBus {
    read_conn: ConnectionManager,
    write_conn: ConnectionManager,
    group: String,
    consumer: String,
    offset_reset: OffsetReset,
    redelivery_idle: Duration,
    topics: RwLock<Vec<String>>,
}

impl RedisStreamBus {
    pub fn new(
        read_conn: ConnectionManager,
        write_conn: ConnectionManager,
        config: &BusConfig,
    ) -> Self {
        Self {
            read_conn,
            write_conn,
            group: config.consumer_group.clone(),
            consumer: config.consumer_name.clone(),
            offset_reset: config.offset_reset,
            redelivery_idle: Duration::from_secs(config.redelivery_idle_sec),
            topics: RwLock::new(Vec::new()),
        }
    }

    /// Open both connections.
    pub async fn connect(config: &BusConfig, retry: &RetryConfig) -> Result<Self> {
        let read_conn = store::connect(&config.url, retry).await?;
        let write_conn = store::connect(&config.url, retry).await?;
        Ok(Self::new(read_conn, write_conn, config))
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer
    }

    async fn create_group(&self, topic: &str) -> Result<()> {
        let mut conn = self.write_conn.clone();
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(topic)
            .arg(&self.group)
            .arg(self.offset_reset.start_id())
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => {
                info!(topic = %topic, group = %self.group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(topic = %topic, group = %self.group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(SyncError::bus("XGROUP CREATE", e)),
        }
    }

    /// Claim entries other consumers (or a previous run of us) left pending.
    async fn reclaim(&self, topic: &str, max: usize) -> Result<Vec<BusMessage>> {
        let mut conn = self.read_conn.clone();
        let reply: Vec<redis::Value> = redis::cmd("XAUTOCLAIM")
            .arg(topic)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.redelivery_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(|e| SyncError::bus("XAUTOCLAIM", e))?;

        // Redis 6.2 replies [cursor, entries]; 7.x adds [deleted-ids].
        let Some(entries) = reply.get(1) else {
            return Ok(Vec::new());
        };
        let entries: Vec<(String, Option<HashMap<String, redis::Value>>)> =
            redis::from_redis_value(entries).map_err(|e| SyncError::bus("XAUTOCLAIM", e))?;

        let mut messages = Vec::with_capacity(entries.len());
        for (id, fields) in entries {
            match fields {
                Some(fields) => messages.push(to_message(topic, id, &fields)),
                // Entry trimmed from the stream while pending: nothing to redeliver.
                None => self.ack_id(topic, &id).await?,
            }
        }
        if !messages.is_empty() {
            debug!(topic = %topic, count = messages.len(), "Reclaimed idle pending entries");
        }
        Ok(messages)
    }

    async fn read_new(
        &self,
        topics: &[String],
        max: usize,
        block: Duration,
    ) -> Result<Vec<BusMessage>> {
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(max)
            .block(block.as_millis() as usize);
        let ids = vec![">"; topics.len()];

        let mut conn = self.read_conn.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(topics, &ids, &opts)
            .await
            .map_err(|e| SyncError::bus("XREADGROUP", e))?;

        let mut messages = Vec::new();
        for stream in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in stream.ids {
                messages.push(to_message(&stream.key, entry.id, &entry.map));
            }
        }
        Ok(messages)
    }

    async fn ack_id(&self, topic: &str, id: &str) -> Result<()> {
        let mut conn = self.write_conn.clone();
        let _: i64 = conn
            .xack(topic, &self.group, &[id])
            .await
            .map_err(|e| SyncError::bus("XACK", e))?;
        Ok(())
    }
}

impl MessageBus for RedisStreamBus {
    fn subscribe<'a>(&'a self, topics: &'a [String]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            for topic in topics {
                self.create_group(topic).await?;
            }
            *self.topics.write().await = topics.to_vec();
            Ok(())
        })
    }

    fn poll(&self, max: usize, block: Duration) -> BoxFuture<'_, Vec<BusMessage>> {
        Box::pin(async move {
            let topics = self.topics.read().await.clone();
            if topics.is_empty() {
                return Err(SyncError::bus("poll", "not subscribed to any topic"));
            }

            let mut batch = Vec::new();
            for topic in &topics {
                if batch.len() >= max {
                    break;
                }
                batch.extend(self.reclaim(topic, max - batch.len()).await?);
            }
            if !batch.is_empty() {
                return Ok(batch);
            }

            let batch = self.read_new(&topics, max, block).await?;
            if !batch.is_empty() {
                trace!(count = batch.len(), "Read new entries");
            }
            Ok(batch)
        })
    }

    fn publish<'a>(
        &'a self,
        topic: &'a str,
        key: &'a str,
        payload: &'a Value,
    ) -> BoxFuture<'a, String> {
        Box::pin(async move {
            let body = serde_json::to_string(payload)
                .map_err(|e| SyncError::Internal(format!("payload serialization: {}", e)))?;
            let mut conn = self.write_conn.clone();
            let id: String = redis::cmd("XADD")
                .arg(topic)
                .arg("*")
                .arg(FIELD_KEY)
                .arg(key)
                .arg(FIELD_PAYLOAD)
                .arg(&body)
                .query_async(&mut conn)
                .await
                .map_err(|e| SyncError::bus("XADD", e))?;
            trace!(topic = %topic, key = %key, stream_id = %id, "Published");
            Ok(id)
        })
    }

    fn ack<'a>(&'a self, message: &'a BusMessage) -> BoxFuture<'a, ()> {
        Box::pin(self.ack_id(&message.topic, &message.id))
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// A record of one `publish` call on [`MemoryBus`].
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub key: String,
    pub payload: Value,
}

#[derive(Debug, Default)]
struct MemoryBusState {
    subscribed: Vec<String>,
    queue: VecDeque<BusMessage>,
    /// Delivered but not yet acknowledged, by id.
    pending: HashMap<String, BusMessage>,
    acked: Vec<String>,
    published: Vec<Published>,
    failing_topics: HashSet<String>,
    fail_subscribe: bool,
}

/// In-process [`MessageBus`] with inspection and fault-injection hooks.
#[derive(Debug, Default)]
pub struct MemoryBus {
    state: Mutex<MemoryBusState>,
    notify: Notify,
    seq: AtomicU64,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> String {
        format!("{}-0", self.seq.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Enqueue an inbound message with a raw payload. Returns its id.
    pub async fn inject(&self, topic: &str, key: &str, payload: impl Into<String>) -> String {
        let id = self.next_id();
        self.state.lock().await.queue.push_back(BusMessage {
            topic: topic.to_string(),
            id: id.clone(),
            key: Some(key.to_string()),
            payload: payload.into(),
        });
        self.notify.notify_waiters();
        id
    }

    /// Make every unacknowledged message deliverable again (simulates the
    /// idle-window reclaim).
    pub async fn redeliver_pending(&self) -> usize {
        let mut state = self.state.lock().await;
        let mut pending: Vec<BusMessage> = state.pending.drain().map(|(_, m)| m).collect();
        pending.sort_by(|a, b| a.id.cmp(&b.id));
        let count = pending.len();
        for message in pending.into_iter().rev() {
            state.queue.push_front(message);
        }
        drop(state);
        self.notify.notify_waiters();
        count
    }

    /// Make `publish` to `topic` fail.
    pub async fn fail_publishes_to(&self, topic: &str) {
        self.state.lock().await.failing_topics.insert(topic.to_string());
    }

    /// Make the next `subscribe` fail.
    pub async fn fail_subscribe(&self) {
        self.state.lock().await.fail_subscribe = true;
    }

    /// Everything published to `topic`, in order.
    pub async fn published(&self, topic: &str) -> Vec<Published> {
        self.state
            .lock()
            .await
            .published
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    pub async fn acked(&self) -> Vec<String> {
        self.state.lock().await.acked.clone()
    }

    pub async fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().await.pending.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Messages still waiting to be delivered.
    pub async fn queued(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    async fn take_batch(&self, max: usize) -> Vec<BusMessage> {
        let mut state = self.state.lock().await;
        let MemoryBusState {
            subscribed,
            queue,
            pending,
            ..
        } = &mut *state;

        let mut batch = Vec::new();
        let mut kept = VecDeque::with_capacity(queue.len());
        while let Some(message) = queue.pop_front() {
            if batch.len() < max && subscribed.contains(&message.topic) {
                pending.insert(message.id.clone(), message.clone());
                batch.push(message);
            } else {
                kept.push_back(message);
            }
        }
        *queue = kept;
        batch
    }
}

impl MessageBus for MemoryBus {
    fn subscribe<'a>(&'a self, topics: &'a [String]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if std::mem::take(&mut state.fail_subscribe) {
                return Err(SyncError::bus("subscribe", "injected subscribe failure"));
            }
            state.subscribed = topics.to_vec();
            Ok(())
        })
    }

    fn poll(&self, max: usize, block: Duration) -> BoxFuture<'_, Vec<BusMessage>> {
        Box::pin(async move {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking, so an inject in between is not missed.
            notified.as_mut().enable();

            let batch = self.take_batch(max).await;
            if !batch.is_empty() {
                return Ok(batch);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(block) => {}
            }
            Ok(self.take_batch(max).await)
        })
    }

    fn publish<'a>(
        &'a self,
        topic: &'a str,
        key: &'a str,
        payload: &'a Value,
    ) -> BoxFuture<'a, String> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.failing_topics.contains(topic) {
                return Err(SyncError::bus("publish", format!("injected failure on {}", topic)));
            }
            let id = self.next_id();
            state.published.push(Published {
                topic: topic.to_string(),
                key: key.to_string(),
                payload: payload.clone(),
            });
            state.queue.push_back(BusMessage {
                topic: topic.to_string(),
                id: id.clone(),
                key: Some(key.to_string()),
                payload: payload.to_string(),
            });
            drop(state);
            self.notify.notify_waiters();
            Ok(id)
        })
    }

    fn ack<'a>(&'a self, message: &'a BusMessage) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.pending.remove(&message.id);
            state.acked.push(message.id.clone());
            Ok(())
        })
    }
}
