//! Unified error handling with Sentry integration.
//!
//! Every handler returns `Result<T, AppError>`. The response body is JSON
//! `{"error": "<toast text>"}`, plus `"fields"` for form validation failures.
//! Server-side failures are captured to Sentry before responding.

use std::collections::BTreeMap;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::checkout::CheckoutError;
use crate::commerce::CommerceError;
use crate::db::RepositoryError;
use crate::shipping::ShippingGroupError;

/// Application-level error type for the storefront.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Checkout(#[from] CheckoutError),

    #[error(transparent)]
    ShippingGroup(#[from] ShippingGroupError),

    #[error("Commerce error: {0}")]
    Commerce(#[from] CommerceError),

    #[error("Database error: {0}")]
    Database(#[from] RepositoryError),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bad request from client.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response body.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<BTreeMap<String, String>>,
}

/// Success envelope: `{"success": true, "data": ...}`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    success: bool,
    data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub const fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

const fn commerce_status(err: &CommerceError) -> StatusCode {
    match err {
        CommerceError::NotFound(_) => StatusCode::NOT_FOUND,
        CommerceError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        CommerceError::Api { .. } if err.is_client_error() => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::BAD_GATEWAY,
    }
}

impl AppError {
    /// HTTP status for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Checkout(err) => match err {
                CheckoutError::Form(_)
                | CheckoutError::UnassignedItems { .. }
                | CheckoutError::UnknownShippingMethod(_)
                | CheckoutError::EmptyCart => StatusCode::UNPROCESSABLE_ENTITY,
                CheckoutError::Declined(_) => StatusCode::PAYMENT_REQUIRED,
                CheckoutError::Commerce(e) => commerce_status(e),
                CheckoutError::Processor(_) => StatusCode::BAD_GATEWAY,
                CheckoutError::SessionMismatch | CheckoutError::NotFound => StatusCode::NOT_FOUND,
                CheckoutError::InProgress => StatusCode::CONFLICT,
                CheckoutError::CredentialRequired => StatusCode::UNAUTHORIZED,
                CheckoutError::Incomplete(_)
                | CheckoutError::Repository(_)
                | CheckoutError::Stage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::ShippingGroup(err) => match err {
                ShippingGroupError::NotFound(_) => StatusCode::NOT_FOUND,
                ShippingGroupError::Commerce(e) => commerce_status(e),
                ShippingGroupError::NoItemsSelected
                | ShippingGroupError::MissingShippingType
                | ShippingGroupError::InvalidAddress(_)
                | ShippingGroupError::NoAddress
                | ShippingGroupError::UnknownItem(_) => StatusCode::UNPROCESSABLE_ENTITY,
            },
            Self::Commerce(e) => commerce_status(e),
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Text shown to the shopper. Internal details never leave the server.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Checkout(e) => e.user_message(),
            Self::ShippingGroup(ShippingGroupError::Commerce(e)) | Self::Commerce(e) => {
                e.user_message()
            }
            Self::ShippingGroup(e) => e.to_string(),
            Self::Database(_) | Self::Internal(_) => "Internal server error".to_string(),
            Self::NotFound(_) | Self::BadRequest(_) => self.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Capture server errors to Sentry
        if status.is_server_error() {
            let event_id = sentry::capture_error(&self);
            tracing::error!(
                error = %self,
                sentry_event_id = %event_id,
                "Request error"
            );
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let fields = match &self {
            Self::Checkout(CheckoutError::Form(form)) => Some(form.fields.clone()),
            _ => None,
        };

        let body = ErrorBody {
            error: self.user_message(),
            fields,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for `AppError`.
pub type Result<T> = std::result::Result<T, AppError>;
