//! Integration test modules.

#[path = "../common/fit_fields.rs"]
mod fit_fields;

mod bridge_test;
mod connection_test;
