//! Checkout API routes.

use axum::{
    Json,
    extract::{Path, State},
};
use serde::Serialize;
use tower_sessions::Session;
use tracing::{info, instrument};

use composable_core::{CheckoutId, OrderId};

use crate::checkout::{
    Caller, CheckoutError, CheckoutFormInput, CheckoutOutcome, OrderConfirmation, confirmation,
};
use crate::error::{ApiResponse, AppError};
use crate::session::{CookieRepository, SessionContext, SessionCookies};
use crate::state::AppState;

/// Where the browser goes once an order is placed.
pub const CONFIRMATION_PATH: &str = "/checkout/confirmation";

/// Result of a checkout submission or resume.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckoutResponse {
    Completed {
        checkout_id: CheckoutId,
        order_id: OrderId,
        redirect_url: &'static str,
    },
    /// Send the shopper to the processor, then resume the checkout.
    ActionRequired {
        checkout_id: CheckoutId,
        redirect_url: Option<String>,
    },
}

/// `GET /api/checkout/defaults`
#[instrument(skip(state, session))]
pub async fn defaults(
    State(state): State<AppState>,
    session: SessionContext,
) -> ApiResponse<CheckoutFormInput> {
    let standard = &state.checkout().settings().standard_shipping;
    ApiResponse::ok(CheckoutFormInput::defaults(session.credential(), standard))
}

/// `POST /api/checkout`
#[instrument(skip_all)]
pub async fn submit(
    State(state): State<AppState>,
    mut session: SessionContext,
    server_session: Session,
    Json(input): Json<CheckoutFormInput>,
) -> Result<(SessionCookies, ApiResponse<CheckoutResponse>), AppError> {
    let context = session.checkout_context().ok_or(CheckoutError::EmptyCart)?;
    let outcome = state.checkout().run(&context, input).await?;
    let response = apply_outcome(&mut session, &server_session, outcome).await;
    Ok((session.into_cookies(), ApiResponse::ok(response)))
}

/// `POST /api/checkout/{checkout_id}/resume`
#[instrument(skip(state, session, server_session))]
pub async fn resume(
    State(state): State<AppState>,
    mut session: SessionContext,
    server_session: Session,
    Path(checkout_id): Path<CheckoutId>,
) -> Result<(SessionCookies, ApiResponse<CheckoutResponse>), AppError> {
    let caller = session_caller(&session)?;
    let outcome = state.checkout().resume(checkout_id, caller).await?;
    let response = apply_outcome(&mut session, &server_session, outcome).await;
    Ok((session.into_cookies(), ApiResponse::ok(response)))
}

/// The resuming shopper. A session without a cart cannot own any checkout.
pub(crate) fn session_caller(session: &SessionContext) -> Result<Caller, CheckoutError> {
    let cart_id = session.cart_id().ok_or(CheckoutError::NotFound)?;
    Ok(Caller::Session {
        cart_id,
        credential: session.credential().cloned(),
    })
}

/// Point the cart cookie at the replacement cart and keep the confirmation
/// for the confirmation view.
pub(crate) async fn apply_outcome(
    session: &mut SessionContext,
    server_session: &Session,
    outcome: CheckoutOutcome,
) -> CheckoutResponse {
    match outcome {
        CheckoutOutcome::Completed(completed) => {
            record_completion(session, server_session, &completed).await;
            CheckoutResponse::Completed {
                checkout_id: completed.checkout_id,
                order_id: completed.order.id.clone(),
                redirect_url: CONFIRMATION_PATH,
            }
        }
        CheckoutOutcome::ActionRequired {
            checkout_id,
            redirect_url,
        } => CheckoutResponse::ActionRequired {
            checkout_id,
            redirect_url,
        },
    }
}

pub(crate) async fn record_completion(
    session: &mut SessionContext,
    server_session: &Session,
    completed: &OrderConfirmation,
) {
    info!(
        checkout_id = %completed.checkout_id,
        order_id = %completed.order.id,
        "Checkout completed"
    );
    session.cookies_mut().set_cart_id(&completed.new_cart_id);
    confirmation::store(server_session, completed).await;
}
