// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persistence gateway for the destination (commerce backend) database.
//!
//! Destination rows live in table `rfq`, keyed by a generated id
//! (`rfq_` + 24 hex chars). `external_id` carries the source record id and is
//! `UNIQUE`, which is the last line of defense against duplicate creates:
//! even if two instances race past the lock, the insert uses
//! `ON CONFLICT (external_id) DO NOTHING` and the loser reads back the
//! winner's id.

use crate::config::DatabaseConfig;
use crate::error::{BoxFuture, Result, SyncError};
use crate::model::{DestinationRecord, TargetRecord};
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// `sync_status` written on every row this service creates.
pub const SYNC_STATUS_SYNCED: &str = "synced";

/// Generate a destination id: `rfq_` followed by 24 lowercase hex characters.
pub fn new_destination_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("rfq_{}", &hex[..24])
}

/// Destination-store operations used by the orchestrator and the status handler.
pub trait RecordGateway: Send + Sync + 'static {
    /// Look up the row created for a source record.
    fn find_by_external_id<'a>(
        &'a self,
        external_id: &'a str,
    ) -> BoxFuture<'a, Option<DestinationRecord>>;

    /// Insert a record and return its destination id.
    ///
    /// If a row with the same `external_id` already exists, its id is
    /// returned and nothing is written.
    fn create<'a>(&'a self, record: &'a TargetRecord) -> BoxFuture<'a, String>;

    /// Set the status of an existing row. Returns `false` if no row matched.
    fn update_status<'a>(&'a self, id: &'a str, status: &'a str) -> BoxFuture<'a, bool>;
}

impl<T: RecordGateway + ?Sized> RecordGateway for Arc<T> {
    fn find_by_external_id<'a>(
        &'a self,
        external_id: &'a str,
    ) -> BoxFuture<'a, Option<DestinationRecord>> {
        (**self).find_by_external_id(external_id)
    }

    fn create<'a>(&'a self, record: &'a TargetRecord) -> BoxFuture<'a, String> {
        (**self).create(record)
    }

    fn update_status<'a>(&'a self, id: &'a str, status: &'a str) -> BoxFuture<'a, bool> {
        (**self).update_status(id, status)
    }
}

// =============================================================================
// Postgres
// =============================================================================

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS rfq (
    id                  TEXT PRIMARY KEY,
    rfq_number          TEXT NOT NULL,
    customer_id         TEXT,
    company_id          TEXT,
    customer_email      TEXT NOT NULL,
    customer_company    TEXT,
    customer_name       TEXT,
    description         TEXT,
    line_items          JSONB NOT NULL,
    status              TEXT NOT NULL,
    priority            TEXT NOT NULL,
    estimated_value     DOUBLE PRECISION,
    currency            TEXT NOT NULL,
    requirements        JSONB,
    delivery_address    JSONB,
    attachments         JSONB,
    ai_confidence_score DOUBLE PRECISION,
    ai_analysis         JSONB,
    external_id         TEXT NOT NULL UNIQUE,
    external_source     TEXT NOT NULL,
    sync_status         TEXT NOT NULL,
    synced_at           TIMESTAMPTZ,
    created_at          TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at          TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

const INSERT_RFQ: &str = r#"
INSERT INTO rfq (
    id, rfq_number, customer_id, company_id,
    customer_email, customer_company, customer_name,
    description, line_items, status, priority,
    estimated_value, currency, requirements,
    delivery_address, attachments,
    ai_confidence_score, ai_analysis,
    external_id, external_source, sync_status, synced_at,
    created_at, updated_at
) VALUES (
    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
    $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $22, $22
)
ON CONFLICT (external_id) DO NOTHING
RETURNING id
"#;

#[derive(Debug, FromRow)]
struct RfqRow {
    id: String,
    rfq_number: String,
    status: String,
    external_id: String,
    sync_status: String,
}

impl From<RfqRow> for DestinationRecord {
    fn from(row: RfqRow) -> Self {
        Self {
            id: row.id,
            rfq_number: row.rfq_number,
            status: row.status,
            external_id: row.external_id,
            sync_status: row.sync_status,
        }
    }
}

/// [`RecordGateway`] over a Postgres pool.
#[derive(Clone)]
pub struct PgRecordGateway {
    pool: PgPool,
}

impl PgRecordGateway {
    /// Build a pool from config and connect.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_sec))
            .connect(&config.url)
            .await?;
        info!(max_connections = config.max_connections, "Connected to destination database");
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `rfq` table if it does not exist. Bootstrap and tests only.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn fetch_by_external_id(&self, external_id: &str) -> Result<Option<DestinationRecord>> {
        let row = sqlx::query_as::<_, RfqRow>(
            "SELECT id, rfq_number, status, external_id, sync_status
             FROM rfq WHERE external_id = $1 LIMIT 1",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(DestinationRecord::from))
    }

    async fn insert(&self, record: &TargetRecord) -> Result<String> {
        let id = new_destination_id();
        let now = Utc::now();

        let inserted: Option<String> = sqlx::query_scalar(INSERT_RFQ)
            .bind(&id)
            .bind(&record.rfq_number)
            .bind(&record.customer_id)
            .bind(&record.company_id)
            .bind(&record.customer_email)
            .bind(&record.customer_company)
            .bind(&record.customer_name)
            .bind(&record.description)
            .bind(Json(&record.line_items))
            .bind(&record.status)
            .bind(&record.priority)
            .bind(record.estimated_value)
            .bind(&record.currency)
            .bind(record.requirements.as_ref().map(Json))
            .bind(record.delivery_address.as_ref().map(Json))
            .bind(record.attachments.as_ref().map(Json))
            .bind(record.ai_confidence_score)
            .bind(Json(&record.ai_analysis))
            .bind(&record.external_id)
            .bind(&record.external_source)
            .bind(SYNC_STATUS_SYNCED)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(id) = inserted {
            info!(destination_id = %id, rfq_number = %record.rfq_number, "Created destination record");
            return Ok(id);
        }

        // Lost the race on external_id: return the existing row's id.
        let existing = self
            .fetch_by_external_id(&record.external_id)
            .await?
            .ok_or_else(|| {
                SyncError::Internal(format!(
                    "insert for external_id {} conflicted but no row was found",
                    record.external_id
                ))
            })?;
        debug!(destination_id = %existing.id, "Insert conflicted, reusing existing record");
        Ok(existing.id)
    }

    async fn set_status(&self, id: &str, status: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE rfq SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(status)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        let updated = result.rows_affected() > 0;
        if updated {
            info!(destination_id = %id, status = %status, "Updated destination status");
        }
        Ok(updated)
    }
}

impl RecordGateway for PgRecordGateway {
    fn find_by_external_id<'a>(
        &'a self,
        external_id: &'a str,
    ) -> BoxFuture<'a, Option<DestinationRecord>> {
        Box::pin(self.fetch_by_external_id(external_id))
    }

    fn create<'a>(&'a self, record: &'a TargetRecord) -> BoxFuture<'a, String> {
        Box::pin(self.insert(record))
    }

    fn update_status<'a>(&'a self, id: &'a str, status: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(self.set_status(id, status))
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Debug, Clone)]
struct StoredRecord {
    id: String,
    record: TargetRecord,
}

/// In-process [`RecordGateway`] enforcing the same `external_id` uniqueness.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    /// external_id -> stored row
    rows: RwLock<HashMap<String, StoredRecord>>,
    creates: AtomicUsize,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows actually inserted (conflicts excluded).
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::Acquire)
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    /// Full stored record for a source id.
    pub async fn record(&self, external_id: &str) -> Option<TargetRecord> {
        self.rows
            .read()
            .await
            .get(external_id)
            .map(|stored| stored.record.clone())
    }
}

impl RecordGateway for MemoryGateway {
    fn find_by_external_id<'a>(
        &'a self,
        external_id: &'a str,
    ) -> BoxFuture<'a, Option<DestinationRecord>> {
        Box::pin(async move {
            Ok(self
                .rows
                .read()
                .await
                .get(external_id)
                .map(|stored| DestinationRecord {
                    id: stored.id.clone(),
                    rfq_number: stored.record.rfq_number.clone(),
                    status: stored.record.status.clone(),
                    external_id: stored.record.external_id.clone(),
                    sync_status: SYNC_STATUS_SYNCED.to_string(),
                }))
        })
    }

    fn create<'a>(&'a self, record: &'a TargetRecord) -> BoxFuture<'a, String> {
        Box::pin(async move {
            let mut rows = self.rows.write().await;
            if let Some(existing) = rows.get(&record.external_id) {
                return Ok(existing.id.clone());
            }
            let id = new_destination_id();
            rows.insert(
                record.external_id.clone(),
                StoredRecord {
                    id: id.clone(),
                    record: record.clone(),
                },
            );
            self.creates.fetch_add(1, Ordering::AcqRel);
            Ok(id)
        })
    }

    fn update_status<'a>(&'a self, id: &'a str, status: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let mut rows = self.rows.write().await;
            match rows.values_mut().find(|stored| stored.id == id) {
                Some(stored) => {
                    stored.record.status = status.to_string();
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }
}
