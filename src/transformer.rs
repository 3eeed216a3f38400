// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pure mapping from the source RFQ shape to the destination shape.
//!
//! No I/O happens here. The vocabulary tables are static; anything not in
//! them falls back to `received` (status) or `medium` (priority).

use crate::error::{Result, SyncError};
use crate::model::{LineItemInput, RfqPayload, TargetLineItem, TargetRecord};
use serde_json::{json, Map, Number};

/// Source status → destination status.
pub const STATUS_TABLE: &[(&str, &str)] = &[
    ("received", "received"),
    ("parsing", "processing"),
    ("classified", "processing"),
    ("validated", "processing"),
    ("pending_review", "processing"),
    ("approved", "processing"),
    ("quote_requested", "quoted"),
    ("quoted", "quoted"),
    ("proposal_sent", "sent"),
    ("accepted", "approved"),
    ("completed", "approved"),
    ("rejected", "rejected"),
    ("cancelled", "rejected"),
];

/// Source priority → destination priority.
pub const PRIORITY_TABLE: &[(&str, &str)] = &[
    ("low", "low"),
    ("medium", "medium"),
    ("high", "high"),
    ("urgent", "urgent"),
    ("critical", "urgent"),
];

const DEFAULT_STATUS: &str = "received";
const DEFAULT_PRIORITY: &str = "medium";
const DEFAULT_CURRENCY: &str = "EUR";
const DEFAULT_UNIT: &str = "pcs";
const DESCRIPTION_ITEMS: usize = 3;

fn lookup(table: &[(&str, &'static str)], key: &str, fallback: &'static str) -> &'static str {
    table
        .iter()
        .find(|(from, _)| *from == key)
        .map(|(_, to)| *to)
        .unwrap_or(fallback)
}

/// Map a source status; unknown values become `received`.
pub fn map_status(status: &str) -> &'static str {
    lookup(STATUS_TABLE, status, DEFAULT_STATUS)
}

/// Exact status lookup, no fallback. Used when overwriting an existing row.
pub fn known_status(status: &str) -> Option<&'static str> {
    STATUS_TABLE
        .iter()
        .find(|(from, _)| *from == status)
        .map(|(_, to)| *to)
}

/// Map a source priority; unknown values become `medium`.
pub fn map_priority(priority: &str) -> &'static str {
    lookup(PRIORITY_TABLE, priority, DEFAULT_PRIORITY)
}

fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.is_empty())
}

/// Check required fields, reporting every problem in order.
pub fn validate(payload: &RfqPayload) -> Result<()> {
    let mut errors = Vec::new();

    if is_blank(payload.rfq_number.as_deref()) {
        errors.push("Missing rfq_number".to_string());
    }
    let email = payload.customer.as_ref().and_then(|c| c.email.as_deref());
    if is_blank(email) {
        errors.push("Missing customer email".to_string());
    }
    if payload.line_items.is_empty() {
        errors.push("No line items found".to_string());
    }
    for (i, item) in payload.line_items.iter().enumerate() {
        if is_blank(item.description.as_deref()) {
            errors.push(format!("Line item {} missing description", i + 1));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(SyncError::Validation(errors))
    }
}

/// Maps validated payloads into [`TargetRecord`]s tagged with a source system.
#[derive(Debug, Clone)]
pub struct Transformer {
    source_system: String,
}

impl Default for Transformer {
    fn default() -> Self {
        Self::new("email")
    }
}

impl Transformer {
    pub fn new(source_system: impl Into<String>) -> Self {
        Self {
            source_system: source_system.into(),
        }
    }

    pub fn source_system(&self) -> &str {
        &self.source_system
    }

    /// Parse, validate and transform raw `rfq_data` in one step.
    pub fn prepare(&self, source_id: &str, raw: &serde_json::Value) -> Result<TargetRecord> {
        let payload = RfqPayload::from_value(raw)?;
        validate(&payload)?;
        Ok(self.transform(source_id, &payload))
    }

    /// Build the destination record. Assumes `payload` passed [`validate`].
    pub fn transform(&self, source_id: &str, payload: &RfqPayload) -> TargetRecord {
        let customer = payload.customer.clone().unwrap_or_default();

        TargetRecord {
            rfq_number: payload.rfq_number.clone().unwrap_or_default(),
            customer_email: customer.email.unwrap_or_default(),
            customer_name: customer.name,
            customer_company: customer.company,
            customer_id: None,
            company_id: None,
            description: describe(payload),
            line_items: payload.line_items.iter().map(transform_line_item).collect(),
            status: map_status(payload.status.as_deref().unwrap_or(DEFAULT_STATUS)).to_string(),
            priority: map_priority(payload.priority.as_deref().unwrap_or(DEFAULT_PRIORITY))
                .to_string(),
            currency: payload
                .currency
                .clone()
                .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            estimated_value: payload.estimated_value,
            requirements: payload.requirements.clone(),
            delivery_address: payload.delivery.clone().filter(|d| !d.is_empty()),
            attachments: payload.attachments.clone(),
            ai_confidence_score: payload.ai_confidence_score,
            ai_analysis: json!({
                "source": self.source_system,
                "email_rfq_id": source_id,
                "confidence": payload.ai_confidence_score,
                "language": payload.language,
            }),
            external_id: source_id.to_string(),
            external_source: self.source_system.clone(),
        }
    }
}

fn transform_line_item(item: &LineItemInput) -> TargetLineItem {
    TargetLineItem {
        description: item.description.clone().unwrap_or_default(),
        quantity: item.quantity.clone().unwrap_or_else(|| Number::from(1)),
        unit: item.unit.clone().unwrap_or_else(|| DEFAULT_UNIT.to_string()),
        part_number: item.part_number.clone(),
        manufacturer: item.manufacturer.clone(),
        specifications: item.specifications.clone().unwrap_or_else(Map::new),
        unit_price: item.unit_price,
        total_price: item.total_price,
    }
}

/// `description`, then `title`, then a summary of the first few line items.
fn describe(payload: &RfqPayload) -> Option<String> {
    let explicit = [payload.description.as_deref(), payload.title.as_deref()]
        .into_iter()
        .flatten()
        .find(|s| !s.is_empty());
    if let Some(text) = explicit {
        return Some(text.to_string());
    }
    if payload.line_items.is_empty() {
        return None;
    }

    let mut summary = payload
        .line_items
        .iter()
        .take(DESCRIPTION_ITEMS)
        .map(|item| item.description.as_deref().unwrap_or(""))
        .collect::<Vec<_>>()
        .join("; ");
    let remaining = payload.line_items.len().saturating_sub(DESCRIPTION_ITEMS);
    if remaining > 0 {
        summary.push_str(&format!(" (+{remaining} more items)"));
    }
    Some(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CustomerInfo;
    use serde_json::json;

    fn item(description: &str) -> LineItemInput {
        LineItemInput {
            description: Some(description.to_string()),
            ..Default::default()
        }
    }

    fn valid_payload() -> RfqPayload {
        RfqPayload {
            rfq_number: Some("RFQ-100".to_string()),
            customer: Some(CustomerInfo {
                email: Some("a@b.com".to_string()),
                ..Default::default()
            }),
            line_items: vec![item("Bolt M6")],
            ..Default::default()
        }
    }

    #[test]
    fn test_status_table() {
        let cases = [
            ("received", "received"),
            ("parsing", "processing"),
            ("classified", "processing"),
            ("validated", "processing"),
            ("pending_review", "processing"),
            ("approved", "processing"),
            ("quote_requested", "quoted"),
            ("quoted", "quoted"),
            ("proposal_sent", "sent"),
            ("accepted", "approved"),
            ("completed", "approved"),
            ("rejected", "rejected"),
            ("cancelled", "rejected"),
            ("something_new", "received"),
            ("", "received"),
        ];
        for (from, to) in cases {
            assert_eq!(map_status(from), to, "status {from:?}");
        }
    }

    #[test]
    fn test_priority_table() {
        let cases = [
            ("low", "low"),
            ("medium", "medium"),
            ("high", "high"),
            ("urgent", "urgent"),
            ("critical", "urgent"),
            ("whenever", "medium"),
        ];
        for (from, to) in cases {
            assert_eq!(map_priority(from), to, "priority {from:?}");
        }
    }

    #[test]
    fn test_known_status_has_no_fallback() {
        assert_eq!(known_status("quote_requested"), Some("quoted"));
        assert_eq!(known_status("received"), Some("received"));
        assert_eq!(known_status("sent"), None);
        assert_eq!(known_status("Quoted"), None);
        for (from, to) in STATUS_TABLE {
            assert_eq!(known_status(from), Some(*to));
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(validate(&valid_payload()).is_ok());
    }

    #[test]
    fn test_validate_reports_everything_in_order() {
        let payload = RfqPayload {
            line_items: vec![item("ok"), LineItemInput::default(), item("")],
            ..Default::default()
        };
        match validate(&payload) {
            Err(SyncError::Validation(errors)) => assert_eq!(
                errors,
                vec![
                    "Missing rfq_number",
                    "Missing customer email",
                    "Line item 2 missing description",
                    "Line item 3 missing description",
                ]
            ),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_no_line_items_message() {
        let payload = RfqPayload {
            line_items: vec![],
            ..valid_payload()
        };
        let err = validate(&payload).unwrap_err();
        assert_eq!(err.to_string(), "Validation failed: No line items found");
    }

    #[test]
    fn test_transform_defaults() {
        let record = Transformer::default().transform("src-1", &valid_payload());

        assert_eq!(record.rfq_number, "RFQ-100");
        assert_eq!(record.customer_email, "a@b.com");
        assert_eq!(record.status, "received");
        assert_eq!(record.priority, "medium");
        assert_eq!(record.currency, "EUR");
        assert_eq!(record.external_id, "src-1");
        assert_eq!(record.external_source, "email");
        assert!(record.customer_id.is_none());
        assert!(record.delivery_address.is_none());

        let line = &record.line_items[0];
        assert_eq!(line.quantity, Number::from(1));
        assert_eq!(line.unit, "pcs");
        assert!(line.specifications.is_empty());

        assert_eq!(record.description.as_deref(), Some("Bolt M6"));
        assert_eq!(record.ai_analysis["source"], "email");
        assert_eq!(record.ai_analysis["email_rfq_id"], "src-1");
    }

    #[test]
    fn test_description_precedence() {
        let mut payload = valid_payload();
        payload.title = Some("Title".to_string());
        assert_eq!(describe(&payload).as_deref(), Some("Title"));

        payload.description = Some("Explicit".to_string());
        assert_eq!(describe(&payload).as_deref(), Some("Explicit"));

        payload.description = Some(String::new());
        assert_eq!(describe(&payload).as_deref(), Some("Title"));
    }

    #[test]
    fn test_description_summarizes_line_items() {
        let mut payload = valid_payload();
        payload.line_items = vec![item("A"), item("B"), item("C"), item("D"), item("E")];
        assert_eq!(describe(&payload).as_deref(), Some("A; B; C (+2 more items)"));

        payload.line_items.truncate(3);
        assert_eq!(describe(&payload).as_deref(), Some("A; B; C"));
    }

    #[test]
    fn test_prepare_runs_validation() {
        let transformer = Transformer::new("email");
        let err = transformer
            .prepare("src-1", &json!({"rfq_number": "RFQ-1"}))
            .unwrap_err();
        assert!(err.to_string().contains("Missing customer email"));

        let record = transformer
            .prepare(
                "src-1",
                &json!({
                    "rfq_number": "RFQ-1",
                    "status": "quote_requested",
                    "priority": "critical",
                    "customer": {"email": "x@y.z", "company": "ACME"},
                    "line_items": [{"description": "Nut", "quantity": 2.5, "unit": "kg"}],
                    "delivery": {"city": "Graz"}
                }),
            )
            .unwrap();
        assert_eq!(record.status, "quoted");
        assert_eq!(record.priority, "urgent");
        assert_eq!(record.customer_company.as_deref(), Some("ACME"));
        assert_eq!(record.line_items[0].unit, "kg");
        assert_eq!(record.line_items[0].quantity.as_f64(), Some(2.5));
        assert_eq!(
            record.delivery_address.and_then(|d| d.city).as_deref(),
            Some("Graz")
        );
    }

    #[test]
    fn test_transform_is_deterministic() {
        let transformer = Transformer::default();
        let a = serde_json::to_vec(&transformer.transform("s", &valid_payload())).unwrap();
        let b = serde_json::to_vec(&transformer.transform("s", &valid_payload())).unwrap();
        assert_eq!(a, b);
    }
}
