//! Composable storefront checkout library.
//!
//! The binary in `main.rs` serves these routes; the library exists so the
//! integration tests and the CLI can build the same state and router.

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod checkout;
pub mod commerce;
pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod payments;
pub mod routes;
pub mod session;
pub mod shipping;
pub mod state;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;
