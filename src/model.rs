// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Data model: bus events, the typed RFQ payload and destination records.
//!
//! Wire names follow the procurement platform's event schema
//! (`email_rfq_id`, `medusa_rfq_id`, `rfq_number`), while the Rust side uses
//! direction-neutral names (`source_id`, `destination_id`).
//!
//! # Lifecycle
//!
//! ```text
//! bus message ──decode──► SyncRequest ──orchestrate──► SyncResult ──► SyncCompletedEvent
//!                             │
//!                             └─ rfq_data ──parse──► RfqPayload ──transform──► TargetRecord
//! ```

use crate::error::{Result, SyncError};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Number, Value};

/// Event type stamped on completion events.
pub const SYNC_COMPLETED_EVENT_TYPE: &str = "rfq.sync.completed";

// ═══════════════════════════════════════════════════════════════════════════════
// Enums
// ═══════════════════════════════════════════════════════════════════════════════

/// Direction of a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    #[default]
    EmailToMedusa,
    MedusaToEmail,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmailToMedusa => "email_to_medusa",
            Self::MedusaToEmail => "medusa_to_email",
        }
    }
}

/// Outcome status of one orchestration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SyncRequest
// ═══════════════════════════════════════════════════════════════════════════════

fn default_max_retries() -> u32 {
    3
}

/// A request to sync one RFQ, decoded from `rfq.sync.to_medusa`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub event_id: String,
    pub event_type: String,
    #[serde(deserialize_with = "de_timestamp")]
    pub event_timestamp: DateTime<Utc>,
    pub source_service: String,
    pub idempotency_key: String,
    #[serde(default)]
    pub correlation_id: Option<String>,

    /// Logical record id in the source system.
    #[serde(rename = "email_rfq_id")]
    pub source_id: String,
    /// Human-readable RFQ number.
    pub rfq_number: String,
    /// Raw source-format payload; parsed into [`RfqPayload`] during validation.
    pub rfq_data: Value,

    #[serde(default, rename = "sync_direction")]
    pub direction: SyncDirection,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl SyncRequest {
    /// Decode a bus payload. Any failure is a terminal [`SyncError::Decode`].
    pub fn decode(payload: &str) -> Result<Self> {
        let request: SyncRequest = serde_json::from_str(payload)?;
        if request.source_id.trim().is_empty() {
            return Err(SyncError::Decode("email_rfq_id is empty".to_string()));
        }
        Ok(request)
    }
}

/// Accept RFC 3339 timestamps as well as offset-less ISO timestamps (read as UTC).
fn de_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

// ═══════════════════════════════════════════════════════════════════════════════
// SyncResult
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of one orchestration attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncResult {
    pub source_id: String,
    pub destination_id: Option<String>,
    pub rfq_number: String,
    pub direction: SyncDirection,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error_message: Option<String>,
}

impl SyncResult {
    fn base(request: &SyncRequest, started_at: DateTime<Utc>, status: SyncStatus) -> Self {
        let completed_at = Utc::now();
        Self {
            source_id: request.source_id.clone(),
            destination_id: None,
            rfq_number: request.rfq_number.clone(),
            direction: request.direction,
            status,
            started_at,
            completed_at,
            duration_ms: elapsed_ms(started_at, completed_at),
            error_message: None,
        }
    }

    /// Lock held elsewhere; reported with zero duration.
    pub fn lock_not_acquired(request: &SyncRequest, started_at: DateTime<Utc>) -> Self {
        Self {
            duration_ms: 0,
            error_message: Some("Lock not acquired, will retry".to_string()),
            ..Self::base(request, started_at, SyncStatus::Pending)
        }
    }

    /// Fresh create or duplicate delivery.
    pub fn completed(
        request: &SyncRequest,
        started_at: DateTime<Utc>,
        destination_id: impl Into<String>,
    ) -> Self {
        Self {
            destination_id: Some(destination_id.into()),
            ..Self::base(request, started_at, SyncStatus::Completed)
        }
    }

    pub fn failed(request: &SyncRequest, started_at: DateTime<Utc>, error: impl ToString) -> Self {
        Self {
            error_message: Some(error.to_string()),
            ..Self::base(request, started_at, SyncStatus::Failed)
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == SyncStatus::Completed
    }

    /// Build the `rfq.sync.completed` event for this result.
    pub fn to_event(&self, source_service: &str) -> SyncCompletedEvent {
        let event_id = format!("sync_completed_{}", self.source_id);
        SyncCompletedEvent {
            idempotency_key: event_id.clone(),
            event_id,
            event_type: SYNC_COMPLETED_EVENT_TYPE.to_string(),
            event_timestamp: self.completed_at,
            source_service: source_service.to_string(),
            source_id: self.source_id.clone(),
            destination_id: self.destination_id.clone(),
            rfq_number: self.rfq_number.clone(),
            direction: self.direction,
            status: self.status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: self.duration_ms,
            error_message: self.error_message.clone(),
        }
    }
}

fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}

/// Payload published on `rfq.sync.completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncCompletedEvent {
    pub event_id: String,
    pub event_type: String,
    pub event_timestamp: DateTime<Utc>,
    pub source_service: String,
    pub idempotency_key: String,
    #[serde(rename = "email_rfq_id")]
    pub source_id: String,
    #[serde(rename = "medusa_rfq_id")]
    pub destination_id: Option<String>,
    pub rfq_number: String,
    #[serde(rename = "sync_direction")]
    pub direction: SyncDirection,
    #[serde(rename = "sync_status")]
    pub status: SyncStatus,
    #[serde(rename = "sync_started_at")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "sync_completed_at")]
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error_message: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Other bus payloads
// ═══════════════════════════════════════════════════════════════════════════════

/// Terminal record published on `rfq.dlq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub original_topic: String,
    pub original_event: Value,
    pub failure_reason: String,
    pub failure_timestamp: DateTime<Utc>,
}

/// Notification on `rfq.status.changed`.
///
/// Everything is optional: notifications come from several services and we
/// only act on the ones we understand.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusChangedEvent {
    pub event_id: Option<String>,
    pub source_service: Option<String>,
    #[serde(rename = "email_rfq_id")]
    pub source_id: Option<String>,
    pub rfq_number: Option<String>,
    #[serde(alias = "new_status")]
    pub status: Option<String>,
}

impl StatusChangedEvent {
    /// True when the event was emitted by `service_name` itself.
    pub fn is_echo_of(&self, service_name: &str) -> bool {
        self.source_service.as_deref() == Some(service_name)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RfqPayload: typed view of `rfq_data`
// ═══════════════════════════════════════════════════════════════════════════════

/// Customer block of an RFQ.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomerInfo {
    pub email: Option<String>,
    pub name: Option<String>,
    pub company: Option<String>,
    pub phone: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
}

/// One requested item as it arrives from the source.
///
/// Upstream extraction is loose about types (`"quantity": "100"`,
/// `"part_number": 912345`), so every field is read leniently: scalars are
/// coerced, and a value that cannot be coerced reads as absent instead of
/// rejecting the whole RFQ.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineItemInput {
    #[serde(deserialize_with = "lenient::string")]
    pub description: Option<String>,
    #[serde(deserialize_with = "lenient::number")]
    pub quantity: Option<Number>,
    #[serde(deserialize_with = "lenient::string")]
    pub unit: Option<String>,
    #[serde(deserialize_with = "lenient::string")]
    pub part_number: Option<String>,
    #[serde(deserialize_with = "lenient::string")]
    pub manufacturer: Option<String>,
    #[serde(deserialize_with = "lenient::object")]
    pub specifications: Option<Map<String, Value>>,
    #[serde(deserialize_with = "lenient::float")]
    pub unit_price: Option<f64>,
    #[serde(deserialize_with = "lenient::float")]
    pub total_price: Option<f64>,
}

/// Tolerant field readers for [`LineItemInput`].
mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::{Map, Number, Value};

    /// Strings as-is, numbers and booleans as their text. Objects and
    /// arrays keep their JSON text.
    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Null => None,
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            other => Some(other.to_string()),
        })
    }

    /// Numbers as-is, numeric strings parsed, anything else absent.
    pub fn number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Number>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Number(n) => Some(n),
            Value::String(s) => s.trim().parse::<Number>().ok(),
            _ => None,
        })
    }

    /// Finite floats from numbers or numeric strings, anything else absent.
    pub fn float<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        let parsed = match Value::deserialize(d)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        Ok(parsed.filter(|f| f.is_finite()))
    }

    pub fn object<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Map<String, Value>>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Object(map) => Some(map),
            _ => None,
        })
    }
}

/// Delivery block of an RFQ.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryInfo {
    pub city: Option<String>,
    pub country: Option<String>,
    pub address: Option<String>,
    pub required_date: Option<String>,
    pub payment_terms: Option<String>,
    pub special_instructions: Option<String>,
}

impl DeliveryInfo {
    pub fn is_empty(&self) -> bool {
        *self == DeliveryInfo::default()
    }
}

/// Typed intermediate representation of `rfq_data`.
///
/// Unknown fields are ignored. Required fields are enforced by
/// [`crate::transformer::validate`], not by the type, so that every missing
/// field can be reported at once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RfqPayload {
    pub rfq_number: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub customer: Option<CustomerInfo>,
    pub line_items: Vec<LineItemInput>,
    pub delivery: Option<DeliveryInfo>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub currency: Option<String>,
    pub estimated_value: Option<f64>,
    pub requirements: Option<Value>,
    pub attachments: Option<Value>,
    pub ai_confidence_score: Option<f64>,
    pub language: Option<String>,
}

impl RfqPayload {
    /// Parse `rfq_data`. A shape mismatch is a validation failure, not a
    /// decode failure: the envelope was fine, the business content is not.
    pub fn from_value(value: &Value) -> Result<Self> {
        if !value.is_object() {
            return Err(SyncError::Validation(vec![
                "rfq_data must be a JSON object".to_string(),
            ]));
        }
        serde_json::from_value(value.clone())
            .map_err(|e| SyncError::Validation(vec![format!("Malformed rfq_data: {e}")]))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Destination side
// ═══════════════════════════════════════════════════════════════════════════════

/// Normalized line item stored downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetLineItem {
    pub description: String,
    pub quantity: Number,
    pub unit: String,
    pub part_number: Option<String>,
    pub manufacturer: Option<String>,
    pub specifications: Map<String, Value>,
    pub unit_price: Option<f64>,
    pub total_price: Option<f64>,
}

/// Destination-shaped RFQ, ready for the persistence gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub rfq_number: String,
    pub customer_email: String,
    pub customer_name: Option<String>,
    pub customer_company: Option<String>,
    pub customer_id: Option<String>,
    pub company_id: Option<String>,
    pub description: Option<String>,
    pub line_items: Vec<TargetLineItem>,
    pub status: String,
    pub priority: String,
    pub currency: String,
    pub estimated_value: Option<f64>,
    pub requirements: Option<Value>,
    pub delivery_address: Option<DeliveryInfo>,
    pub attachments: Option<Value>,
    pub ai_confidence_score: Option<f64>,
    pub ai_analysis: Value,
    /// Source record id; unique downstream.
    pub external_id: String,
    /// Source system tag.
    pub external_source: String,
}

/// Summary of a stored destination row, as returned by lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationRecord {
    pub id: String,
    pub rfq_number: String,
    pub status: String,
    pub external_id: String,
    pub sync_status: String,
}
