//! Delivery method API routes.

use axum::extract::State;
use tracing::instrument;

use crate::error::{ApiResponse, AppError};
use crate::session::SessionContext;
use crate::shipping::DeliveryOption;
use crate::state::AppState;

use super::session_cart;

/// `GET /api/shipping/details`
///
/// Delivery methods for the shopper's cart in display order. An empty list means
/// no method is currently available and the delivery step cannot be completed.
#[instrument(skip(state, session))]
pub async fn details(
    State(state): State<AppState>,
    session: SessionContext,
) -> Result<ApiResponse<Vec<DeliveryOption>>, AppError> {
    let cart_id = session_cart(&session)?;
    let options = state.delivery().resolve(&cart_id).await;
    Ok(ApiResponse::ok(options))
}
