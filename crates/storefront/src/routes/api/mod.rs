//! JSON API routes.
//!
//! Successful responses use the [`ApiResponse`](crate::error::ApiResponse)
//! envelope; failures are rendered by [`AppError`].
//!
//! Cart routes carry the cart ID in the path but only act on the cart named by
//! the shopper's own cart cookie.

pub mod carts;
pub mod checkout;
pub mod shipping;

use axum::{
    Router,
    routing::{delete, get, post, put},
};

use composable_core::CartId;

use crate::error::AppError;
use crate::session::SessionContext;
use crate::state::AppState;

/// Create the cart API router.
pub fn cart_routes() -> Router<AppState> {
    Router::new()
        .route("/{cart_id}", get(carts::show))
        .route(
            "/{cart_id}/shipping-groups",
            get(carts::list_groups).post(carts::create_group),
        )
        .route(
            "/{cart_id}/shipping-groups/{group_id}",
            delete(carts::delete_group),
        )
        .route("/{cart_id}/items/{item_id}", put(carts::update_item))
        .route("/{cart_id}/delivery-progress", get(carts::delivery_progress))
}

/// Create the checkout API router.
pub fn checkout_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(checkout::submit))
        .route("/defaults", get(checkout::defaults))
        .route("/{checkout_id}/resume", post(checkout::resume))
}

/// Create all JSON API routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/carts", cart_routes())
        .nest("/checkout", checkout_routes())
        .route("/shipping/details", get(shipping::details))
}

/// The shopper's cart, which must be the one named in the path.
fn owned_cart(session: &SessionContext, cart_id: &CartId) -> Result<CartId, AppError> {
    match session.cart_id() {
        Some(own) if &own == cart_id => Ok(own),
        _ => Err(AppError::NotFound(format!("cart {cart_id}"))),
    }
}

/// The shopper's cart, whatever it is.
fn session_cart(session: &SessionContext) -> Result<CartId, AppError> {
    session
        .cart_id()
        .ok_or_else(|| AppError::BadRequest("no cart in this session".to_string()))
}
