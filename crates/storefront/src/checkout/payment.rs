//! Payment request construction.

use composable_core::{CustomerId, PaymentMethodId};

use crate::commerce::{PaymentAction, PaymentOptions, PaymentRequest, Transaction};

use super::form::{CheckoutForm, PaymentMethodKind};

/// Gateway used for deferred (purchase order, invoice) payments.
pub const MANUAL_GATEWAY: &str = "manual";

const OFF_SESSION: &str = "off_session";

/// Build the payment request for an order.
///
/// Manual payments are authorised against the manual gateway. Everything else is
/// purchased through `default_gateway`, reusing the saved card (or the freshly
/// tokenised `payment_method`) and keeping it on file when the shopper has a
/// processor customer record.
#[must_use]
pub fn build_payment_request(
    form: &CheckoutForm,
    default_gateway: &str,
    customer: Option<&CustomerId>,
    payment_method: Option<&PaymentMethodId>,
) -> PaymentRequest {
    match form.payment_method {
        PaymentMethodKind::Manual => PaymentRequest {
            gateway: MANUAL_GATEWAY.to_string(),
            method: PaymentAction::Authorize,
            payment_method_types: Vec::new(),
            options: PaymentOptions::default(),
        },
        PaymentMethodKind::EpPayment => PaymentRequest {
            gateway: default_gateway.to_string(),
            method: PaymentAction::Purchase,
            payment_method_types: vec!["card".to_string()],
            options: PaymentOptions {
                customer: customer.cloned(),
                payment_method: form.saved_card_id.clone().or_else(|| payment_method.cloned()),
                setup_future_usage: customer.map(|_| OFF_SESSION.to_string()),
                receipt_email: Some(form.identity.email().to_string()),
            },
        },
    }
}

/// Whether the processor has to confirm the payment before the order can be
/// confirmed. Subscription orders are confirmed by the platform itself.
#[must_use]
pub fn needs_processor_confirmation(
    form: &CheckoutForm,
    transaction: &Transaction,
    has_subscription_items: bool,
) -> bool {
    form.payment_method == PaymentMethodKind::EpPayment
        && !has_subscription_items
        && transaction
            .client_secret
            .as_deref()
            .is_some_and(|secret| !secret.is_empty())
}
