#![allow(dead_code)]

// Shared with the unit tests in the library crate.
#[path = "../../src/test_support/socket_guard.rs"]
pub mod socket_guard;
