//! Composable Core - Shared checkout types.
//!
//! This crate provides the types shared by the checkout components:
//! - `storefront` - Checkout service (shipping groups, delivery, orchestration)
//! - `cli` - Migrations and checkout recovery tools
//!
//! # Architecture
//!
//! The core crate contains only types and validation - no I/O, no database access,
//! no HTTP clients. This keeps it lightweight and allows it to be used anywhere.
//!
//! # Modules
//!
//! - [`types`] - Newtype IDs, money, addresses, emails and checkout stages

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
