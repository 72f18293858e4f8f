//! Order confirmation data and view.
//!
//! A completed checkout stores its [`OrderConfirmation`] in the server session.
//! The confirmation page renders whatever is stored there; without it the shopper
//! sees the empty state instead of being redirected.

use askama::Template;
use askama_web::WebTemplate;
use serde::{Deserialize, Serialize};
use tower_sessions::Session;
use tracing::warn;

use composable_core::{CartId, CheckoutId, Money, TransactionId};

use crate::commerce::{Cart, Order, OrderItem};
use crate::shipping::DeliveryOption;

use super::form::PaymentMethodKind;

/// Session keys for checkout data.
pub mod keys {
    /// Key for the confirmation of the most recent completed checkout.
    pub const CONFIRMATION: &str = "checkout_confirmation";
}

/// Everything the confirmation view needs about a completed checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmation {
    pub checkout_id: CheckoutId,
    pub order: Order,
    pub transaction_id: Option<TransactionId>,
    pub payment_method: PaymentMethodKind,
    pub shipping: DeliveryOption,
    /// The consumed cart as it was when the order was placed.
    pub cart: Option<Cart>,
    /// Cart issued to the shopper after the order was placed.
    pub new_cart_id: CartId,
}

impl OrderConfirmation {
    /// Order lines excluding the synthetic shipping line.
    pub fn product_items(&self) -> impl Iterator<Item = &OrderItem> {
        self.order
            .items
            .iter()
            .filter(|item| !super::is_shipping_sku(item.sku.as_deref()))
    }

    /// Display total of the order, when the platform reported one.
    #[must_use]
    pub fn formatted_total(&self) -> Option<String> {
        self.order.total.as_ref().map(Money::formatted)
    }

    #[must_use]
    pub const fn is_manual_payment(&self) -> bool {
        matches!(self.payment_method, PaymentMethodKind::Manual)
    }
}

/// Store a confirmation for the confirmation view.
pub async fn store(session: &Session, confirmation: &OrderConfirmation) {
    if let Err(e) = session.insert(keys::CONFIRMATION, confirmation).await {
        warn!(checkout_id = %confirmation.checkout_id, "Failed to store order confirmation: {e}");
    }
}

/// Load the stored confirmation, if any.
pub async fn load(session: &Session) -> Option<OrderConfirmation> {
    session
        .get::<OrderConfirmation>(keys::CONFIRMATION)
        .await
        .ok()
        .flatten()
}

/// Order confirmation page.
#[derive(Template, WebTemplate)]
#[template(path = "checkout/confirmation.html")]
pub struct ConfirmationTemplate {
    pub confirmation: Option<OrderConfirmation>,
    /// Why a returning payment could not be completed.
    pub error: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use composable_core::{Address, CurrencyCode, OrderId, OrderPaymentStatus};

    use super::*;
    use crate::commerce::{CartItemKind, OrderContact};

    fn item(name: &str, kind: CartItemKind, sku: &str, amount: i64) -> OrderItem {
        OrderItem {
            id: name.to_lowercase(),
            kind,
            name: name.into(),
            sku: Some(sku.into()),
            quantity: 1,
            unit_price: Money::new(amount, CurrencyCode::usd()),
        }
    }

    fn confirmation() -> OrderConfirmation {
        OrderConfirmation {
            checkout_id: CheckoutId::generate(),
            order: Order {
                id: OrderId::new("order-1"),
                status: "complete".into(),
                payment: OrderPaymentStatus::Paid,
                contact: OrderContact {
                    name: "Ada Lovelace".into(),
                    email: "ada@example.com".into(),
                },
                shipping_address: Address::default(),
                billing_address: Address::default(),
                total: Some(Money::new(1599, CurrencyCode::usd())),
                items: vec![
                    item("Tea", CartItemKind::CartItem, "TEA-1", 1000),
                    item("Shipping", CartItemKind::CustomItem, "__shipping_express", 599),
                ],
            },
            transaction_id: Some(TransactionId::new("tx-1")),
            payment_method: PaymentMethodKind::EpPayment,
            shipping: DeliveryOption {
                label: "Express".into(),
                value: "express".into(),
                amount: 599,
                currency: CurrencyCode::usd(),
                formatted: "$5.99".into(),
                message: None,
                sort_order: 1,
            },
            cart: None,
            new_cart_id: CartId::new("cart-2"),
        }
    }

    #[test]
    fn test_product_items_skip_shipping_line() {
        let confirmation = confirmation();
        let names: Vec<_> = confirmation.product_items().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["Tea"]);
        assert_eq!(confirmation.formatted_total().as_deref(), Some("$15.99"));
    }

    #[test]
    fn test_template_renders_order() {
        let html = ConfirmationTemplate {
            confirmation: Some(confirmation()),
            error: None,
        }
        .render()
        .unwrap();
        assert!(html.contains("order-1"));
        assert!(html.contains("Tea"));
        assert!(html.contains("$5.99"));
    }

    #[test]
    fn test_template_renders_empty_state() {
        let html = ConfirmationTemplate {
            confirmation: None,
            error: None,
        }
        .render()
        .unwrap();
        assert!(html.contains("No recent order"));
    }

    #[test]
    fn test_template_renders_payment_error() {
        let html = ConfirmationTemplate {
            confirmation: None,
            error: Some("Your card was declined".into()),
        }
        .render()
        .unwrap();
        assert!(html.contains("Your card was declined"));
        assert!(html.contains("/checkout"));
    }
}
