//! Checkout: form validation, payment orchestration and order confirmation.
//!
//! # Flow
//!
//! 1. The browser submits a [`CheckoutFormInput`], validated into a [`CheckoutForm`]
//! 2. [`CheckoutOrchestrator::run`] gates on shipping-group assignment, resolves
//!    the delivery method and persists a [`CheckoutRecord`]
//! 3. The orchestrator drives the record through its stages, persisting after
//!    each one; a paused or failed run continues via [`CheckoutOrchestrator::resume`]
//! 4. The finished run yields an [`OrderConfirmation`] kept in the server session

pub mod confirmation;
mod form;
mod orchestrator;
mod payment;
mod store;

pub use confirmation::{ConfirmationTemplate, OrderConfirmation};
pub use form::{
    CheckoutForm, CheckoutFormInput, FormError, Identity, IdentityInput, PaymentMethodKind,
};
pub use orchestrator::{
    Caller, CheckoutContext, CheckoutError, CheckoutOrchestrator, CheckoutOutcome,
    CheckoutSettings,
};
pub use payment::{MANUAL_GATEWAY, build_payment_request, needs_processor_confirmation};
pub use store::{CheckoutRecord, CheckoutStore, PgCheckoutStore};

/// Name of the synthetic line item that carries the shipping cost.
pub const SHIPPING_ITEM_NAME: &str = "Shipping";

/// SKU prefix of shipping line items; the method token follows it.
pub const SHIPPING_SKU_PREFIX: &str = "__shipping_";

/// SKU of the shipping line for a delivery method token.
#[must_use]
pub fn shipping_sku(token: &str) -> String {
    format!("{SHIPPING_SKU_PREFIX}{token}")
}

/// Whether a line item is a shipping line added at checkout.
#[must_use]
pub fn is_shipping_sku(sku: Option<&str>) -> bool {
    sku.is_some_and(|sku| sku.starts_with(SHIPPING_SKU_PREFIX))
}
