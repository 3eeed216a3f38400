//! Fuzz target for inbound event decoding.
//!
//! Arbitrary bus payloads must decode to a request or a decode error,
//! never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use rfq_sync::model::StatusChangedEvent;
use rfq_sync::{SyncError, SyncRequest};

fuzz_target!(|data: &[u8]| {
    let Ok(payload) = std::str::from_utf8(data) else {
        return;
    };

    match SyncRequest::decode(payload) {
        Ok(request) => assert!(!request.source_id.trim().is_empty()),
        Err(e) => assert!(matches!(e, SyncError::Decode(_))),
    }

    let _ = serde_json::from_str::<StatusChangedEvent>(payload);
});
