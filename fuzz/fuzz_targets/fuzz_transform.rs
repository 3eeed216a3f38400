//! Fuzz target for payload validation and transformation.
//!
//! Any JSON value either fails with a validation error or transforms into
//! a record whose status and priority are in the destination vocabulary.

#![no_main]

use libfuzzer_sys::fuzz_target;
use rfq_sync::transformer::{PRIORITY_TABLE, STATUS_TABLE};
use rfq_sync::Transformer;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };

    let transformer = Transformer::default();
    if let Ok(record) = transformer.prepare("fuzz-source", &value) {
        assert!(STATUS_TABLE.iter().any(|(_, to)| *to == record.status));
        assert!(PRIORITY_TABLE.iter().any(|(_, to)| *to == record.priority));
        assert!(!record.line_items.is_empty());
        assert_eq!(record.external_id, "fuzz-source");
    }
});
