//! Checkout HTML routes: the delivery-step gate and the confirmation page.

use askama::Template;
use askama_web::WebTemplate;
use axum::extract::{Query, State};
use serde::Deserialize;
use tower_sessions::Session;
use tracing::{instrument, warn};

use composable_core::CheckoutId;

use crate::checkout::{CheckoutOutcome, ConfirmationTemplate, confirmation};
use crate::error::AppError;
use crate::routes::api::checkout::{record_completion, session_caller};
use crate::session::{SessionContext, SessionCookies};
use crate::shipping::{DeliveryOption, DeliveryProgress};
use crate::state::AppState;

/// Delivery step footer: available methods and whether the shopper may continue.
#[derive(Template, WebTemplate)]
#[template(path = "checkout/delivery_gate.html")]
pub struct DeliveryGateTemplate {
    pub has_cart: bool,
    /// Assignment progress; `None` when shipping-group mode is off.
    pub progress: Option<DeliveryProgress>,
    pub options: Vec<DeliveryOption>,
    pub selected: String,
}

impl DeliveryGateTemplate {
    /// Whether the continue button is enabled.
    #[must_use]
    pub fn can_continue(&self) -> bool {
        self.has_cart
            && !self.options.is_empty()
            && self.progress.is_none_or(|p| p.can_continue)
    }
}

/// `GET /checkout/delivery` (HTMX fragment)
#[instrument(skip(state, session))]
pub async fn delivery_gate(
    State(state): State<AppState>,
    session: SessionContext,
) -> Result<DeliveryGateTemplate, AppError> {
    let selected = state.checkout().settings().standard_shipping.clone();
    let Some(cart_id) = session.cart_id() else {
        return Ok(DeliveryGateTemplate {
            has_cart: false,
            progress: None,
            options: Vec::new(),
            selected,
        });
    };

    let progress = if session.shipping_groups_enabled() {
        Some(state.shipping_groups().delivery_progress(&cart_id).await?)
    } else {
        None
    };
    let options = state.delivery().resolve(&cart_id).await;

    Ok(DeliveryGateTemplate {
        has_cart: true,
        progress,
        options,
        selected,
    })
}

/// Query the processor appends when returning from authentication.
#[derive(Debug, Deserialize)]
pub struct ConfirmationQuery {
    pub checkout: Option<CheckoutId>,
}

/// `GET /checkout/confirmation`
///
/// Renders the stored confirmation. When the processor sends the shopper back
/// after authentication, the named checkout is resumed first.
#[instrument(skip(state, session, server_session))]
pub async fn confirmation_page(
    State(state): State<AppState>,
    mut session: SessionContext,
    server_session: Session,
    Query(query): Query<ConfirmationQuery>,
) -> (SessionCookies, ConfirmationTemplate) {
    let stored = confirmation::load(&server_session).await;

    let pending = query
        .checkout
        .filter(|id| stored.as_ref().is_none_or(|c| &c.checkout_id != id));

    let template = match pending {
        None => ConfirmationTemplate {
            confirmation: stored,
            error: None,
        },
        Some(checkout_id) => {
            let result = match session_caller(&session) {
                Ok(caller) => state.checkout().resume(checkout_id, caller).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(CheckoutOutcome::Completed(completed)) => {
                    record_completion(&mut session, &server_session, &completed).await;
                    ConfirmationTemplate {
                        confirmation: Some(*completed),
                        error: None,
                    }
                }
                Ok(CheckoutOutcome::ActionRequired { .. }) => ConfirmationTemplate {
                    confirmation: None,
                    error: Some("Your payment still needs to be authorised".to_string()),
                },
                Err(e) => {
                    warn!(checkout_id = %checkout_id, error = %e, "Returning checkout failed");
                    ConfirmationTemplate {
                        confirmation: None,
                        error: Some(e.user_message()),
                    }
                }
            }
        }
    };

    (session.into_cookies(), template)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use composable_core::CurrencyCode;

    use super::*;

    fn option(value: &str) -> DeliveryOption {
        DeliveryOption {
            label: value.to_uppercase(),
            value: value.into(),
            amount: 0,
            currency: CurrencyCode::usd(),
            formatted: "$0.00".into(),
            message: None,
            sort_order: 0,
        }
    }

    fn progress(unassigned: usize) -> DeliveryProgress {
        DeliveryProgress {
            total_items: 3,
            assigned_items: 3 - unassigned,
            unassigned_items: unassigned,
            can_continue: unassigned == 0,
        }
    }

    #[test]
    fn test_gate_blocks_unassigned_items() {
        let gate = DeliveryGateTemplate {
            has_cart: true,
            progress: Some(progress(2)),
            options: vec![option("standard")],
            selected: "standard".into(),
        };
        assert!(!gate.can_continue());
        let html = gate.render().unwrap();
        assert!(html.contains("1 of 3"));
        assert!(html.contains("2 still need one"));
        assert!(html.contains("disabled"));
    }

    #[test]
    fn test_gate_blocks_without_delivery_methods() {
        let gate = DeliveryGateTemplate {
            has_cart: true,
            progress: None,
            options: Vec::new(),
            selected: "standard".into(),
        };
        assert!(!gate.can_continue());
        assert!(gate.render().unwrap().contains("No delivery methods"));
    }

    #[test]
    fn test_gate_open_when_all_assigned() {
        let gate = DeliveryGateTemplate {
            has_cart: true,
            progress: Some(progress(0)),
            options: vec![option("standard"), option("express")],
            selected: "standard".into(),
        };
        assert!(gate.can_continue());
        let html = gate.render().unwrap();
        assert!(html.contains("value=\"express\""));
        assert!(!html.contains("disabled"));
    }
}
