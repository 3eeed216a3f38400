//! Fault-injecting wrappers and an in-memory wiring harness.
//!
//! `FlakyGateway` and `FlakyStore` wrap the in-memory implementations and fail
//! on demand with transient errors, so retry, breaker and dead-letter paths
//! can be driven without Docker.

use rfq_sync::consumer::MessageHandler;
use rfq_sync::error::BoxFuture;
use rfq_sync::model::{DestinationRecord, TargetRecord};
use rfq_sync::{
    CircuitBreaker, CircuitConfig, ConsumerOptions, MemoryBus, MemoryGateway, MemoryStore,
    OrchestratorOptions, RecordGateway, RetryConfig, SharedStore, SyncConsumer, SyncError,
    SyncOrchestrator, SyncPolicy,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Payload helpers
// =============================================================================

/// The canonical valid RFQ body.
pub fn valid_data() -> Value {
    json!({
        "rfq_number": "RFQ-100",
        "customer": {"email": "a@b.com"},
        "line_items": [{"description": "Bolt M6"}]
    })
}

/// A full `rfq.sync.to_medusa` event for `source_id`.
pub fn sync_event(source_id: &str, rfq_data: Value) -> Value {
    json!({
        "event_id": format!("evt-{source_id}"),
        "event_type": "rfq.sync.to_medusa",
        "event_timestamp": "2025-03-01T10:00:00Z",
        "source_service": "email-service",
        "idempotency_key": format!("sync_{source_id}"),
        "email_rfq_id": source_id,
        "rfq_number": "RFQ-100",
        "rfq_data": rfq_data,
    })
}

pub fn sync_payload(source_id: &str, rfq_data: Value) -> String {
    sync_event(source_id, rfq_data).to_string()
}

pub fn status_payload(source_service: &str, source_id: &str, status: &str) -> String {
    json!({
        "event_id": format!("status-{source_id}"),
        "source_service": source_service,
        "email_rfq_id": source_id,
        "new_status": status,
    })
    .to_string()
}

/// Poll `check` every 10 ms until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// =============================================================================
// FlakyGateway
// =============================================================================

fn db_down() -> SyncError {
    SyncError::Database(sqlx::Error::PoolTimedOut)
}

/// [`MemoryGateway`] that can fail creates and delay them.
#[derive(Debug, Default)]
pub struct FlakyGateway {
    inner: MemoryGateway,
    fail_next_creates: AtomicUsize,
    fail_all: AtomicBool,
    create_calls: AtomicUsize,
    create_delay: Duration,
}

impl FlakyGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every create sleeps for `delay` before touching the table.
    pub fn with_create_delay(delay: Duration) -> Self {
        Self {
            create_delay: delay,
            ..Self::default()
        }
    }

    pub fn inner(&self) -> &MemoryGateway {
        &self.inner
    }

    /// Fail the next `n` creates.
    pub fn fail_next_creates(&self, n: usize) {
        self.fail_next_creates.store(n, Ordering::SeqCst);
    }

    /// Fail every create until healed.
    pub fn go_down(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.fail_all.store(false, Ordering::SeqCst);
        self.fail_next_creates.store(0, Ordering::SeqCst);
    }

    /// Creates attempted, failed ones included.
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        if self.fail_all.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl RecordGateway for FlakyGateway {
    fn find_by_external_id<'a>(
        &'a self,
        external_id: &'a str,
    ) -> BoxFuture<'a, Option<DestinationRecord>> {
        self.inner.find_by_external_id(external_id)
    }

    fn create<'a>(&'a self, record: &'a TargetRecord) -> BoxFuture<'a, String> {
        Box::pin(async move {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            if !self.create_delay.is_zero() {
                tokio::time::sleep(self.create_delay).await;
            }
            if self.should_fail() {
                return Err(db_down());
            }
            self.inner.create(record).await
        })
    }

    fn update_status<'a>(&'a self, id: &'a str, status: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            if self.fail_all.load(Ordering::SeqCst) {
                return Err(db_down());
            }
            self.inner.update_status(id, status).await
        })
    }
}

// =============================================================================
// FlakyStore
// =============================================================================

/// [`MemoryStore`] whose commands all fail while `down`.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    down: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn go_down(&self) {
        self.down.store(true, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.down.store(false, Ordering::SeqCst);
    }

    fn check(&self, operation: &'static str) -> Result<(), SyncError> {
        if self.down.load(Ordering::SeqCst) {
            Err(SyncError::store_msg(operation, "connection refused"))
        } else {
            Ok(())
        }
    }
}

impl SharedStore for FlakyStore {
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, bool> {
        match self.check("SET NX") {
            Ok(()) => self.inner.set_if_absent(key, value, ttl),
            Err(e) => Box::pin(async move { Err(e) }),
        }
    }

    fn delete_if_equals(&self, key: &str, expected: &str) -> BoxFuture<'_, bool> {
        match self.check("EVALSHA") {
            Ok(()) => self.inner.delete_if_equals(key, expected),
            Err(e) => Box::pin(async move { Err(e) }),
        }
    }

    fn get(&self, key: &str) -> BoxFuture<'_, Option<String>> {
        match self.check("GET") {
            Ok(()) => self.inner.get(key),
            Err(e) => Box::pin(async move { Err(e) }),
        }
    }

    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, ()> {
        match self.check("SET PX") {
            Ok(()) => self.inner.set_with_ttl(key, value, ttl),
            Err(e) => Box::pin(async move { Err(e) }),
        }
    }
}

// =============================================================================
// Harness
// =============================================================================

pub type Orchestrator<S, G> = SyncOrchestrator<Arc<S>, Arc<G>>;

/// In-memory wiring of every component.
pub struct Harness<S, G> {
    pub store: Arc<S>,
    pub gateway: Arc<G>,
    pub bus: Arc<MemoryBus>,
    pub orchestrator: Arc<Orchestrator<S, G>>,
}

impl Harness<MemoryStore, MemoryGateway> {
    pub fn new() -> Self {
        Self::build(MemoryStore::new(), MemoryGateway::new(), CircuitConfig::default())
    }
}

impl<S: SharedStore, G: RecordGateway> Harness<S, G> {
    pub fn build(store: S, gateway: G, circuit: CircuitConfig) -> Self {
        let store = Arc::new(store);
        let gateway = Arc::new(gateway);
        let policy = SyncPolicy::new(
            Arc::new(CircuitBreaker::new("rfq_sync", circuit)),
            RetryConfig::testing(),
        );
        let orchestrator = Arc::new(SyncOrchestrator::new(
            store.clone(),
            gateway.clone(),
            policy,
            OrchestratorOptions::default(),
        ));
        Self {
            store,
            gateway,
            bus: Arc::new(MemoryBus::new()),
            orchestrator,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.orchestrator.policy().breaker()
    }

    pub fn consumer(&self) -> SyncConsumer<Arc<S>, Arc<G>, MemoryBus> {
        SyncConsumer::new(self.orchestrator.clone(), self.bus.clone(), consumer_options())
    }

    /// A handler over the same components, for driving messages by hand.
    pub fn handler(&self) -> MessageHandler<Arc<S>, Arc<G>, MemoryBus> {
        MessageHandler::new(self.orchestrator.clone(), self.bus.clone(), consumer_options())
    }
}

/// Short poll and drain timings.
pub fn consumer_options() -> ConsumerOptions {
    ConsumerOptions {
        block_timeout: Duration::from_millis(20),
        drain_timeout: Duration::from_secs(5),
        error_backoff: Duration::from_millis(10),
        ..ConsumerOptions::default()
    }
}
