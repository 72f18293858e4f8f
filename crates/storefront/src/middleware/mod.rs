//! HTTP middleware stack for the storefront.
//!
//! # Middleware Order (outermost first)
//!
//! 1. Sentry layers (hub per request, HTTP transaction)
//! 2. Session layer (tower-sessions with `PostgreSQL` store, confirmation data)
//! 3. `TraceLayer` (request span)
//! 4. Request ID (record in span and Sentry scope, echo in response)

pub mod request_id;
pub mod session;

pub use request_id::request_id_middleware;
pub use session::{create_session_layer, session_layer};
