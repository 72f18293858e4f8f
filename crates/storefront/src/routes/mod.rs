//! HTTP route handlers for the storefront.
//!
//! # Route Structure
//!
//! ```text
//! GET    /health                                   - Liveness
//! GET    /health/ready                             - Readiness (checkout store reachable)
//!
//! # Checkout pages
//! GET    /checkout/delivery                        - Delivery gate fragment (HTMX)
//! GET    /checkout/confirmation                    - Order confirmation
//!
//! # JSON API
//! GET    /api/carts/{cart_id}                      - Cart summary
//! GET    /api/carts/{cart_id}/shipping-groups      - Groups with their items + unassigned
//! POST   /api/carts/{cart_id}/shipping-groups      - Create a group
//! DELETE /api/carts/{cart_id}/shipping-groups/{id} - Delete a group
//! PUT    /api/carts/{cart_id}/items/{item_id}      - Attach to / remove from a group
//! GET    /api/carts/{cart_id}/delivery-progress    - Delivery gate state
//! GET    /api/shipping/details                     - Delivery methods
//! GET    /api/checkout/defaults                    - Default checkout form
//! POST   /api/checkout                             - Place the order
//! POST   /api/checkout/{checkout_id}/resume        - Resume a paused or failed checkout
//! ```

pub mod api;
pub mod checkout;

use axum::{
    Router,
    extract::{Request, State},
    http::StatusCode,
    middleware::from_fn,
    routing::get,
};
use tower_http::trace::TraceLayer;
use tracing::{Span, info_span, warn};

use crate::middleware::request_id_middleware;
use crate::state::AppState;

/// Create the checkout page router.
pub fn checkout_routes() -> Router<AppState> {
    Router::new()
        .route("/delivery", get(checkout::delivery_gate))
        .route("/confirmation", get(checkout::confirmation_page))
}

/// Create all routes for the storefront.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(readiness))
        .nest("/checkout", checkout_routes())
        .nest("/api", api::routes())
}

/// The storefront application with request tracing, ready to serve once a
/// session layer is added.
pub fn app(state: AppState) -> Router {
    routes()
        .with_state(state)
        .layer(from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
}

fn request_span(request: &Request) -> Span {
    info_span!(
        "request",
        method = %request.method(),
        path = %request.uri().path(),
        request_id = tracing::field::Empty,
    )
}

/// Liveness health check endpoint.
///
/// Returns "ok" if the server is running. Does not check dependencies.
async fn health() -> &'static str {
    "ok"
}

/// Readiness health check endpoint.
///
/// Returns 503 Service Unavailable if the checkout store is not reachable.
async fn readiness(State(state): State<AppState>) -> StatusCode {
    match state.store().ping().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
