//! Shared test utilities for pipeline, chaos and integration tests.
//!
//! This module provides:
//! - Redis and Postgres testcontainer setup
//! - Fault-injecting gateway and store wrappers
//! - An in-memory wiring harness and payload helpers

// Each test binary uses a different subset.
#![allow(dead_code)]

pub mod containers;
pub mod fakes;

pub use containers::*;
pub use fakes::*;
