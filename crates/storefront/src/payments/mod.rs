//! Payment processor integration.
//!
//! The commerce platform creates the payment intent when an order is paid through
//! the default gateway. The processor is only called directly to tokenise cards for
//! reuse and to run the confirmation step (3-D Secure / SCA) on the returned intent.

mod stripe;

pub use stripe::StripeClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use composable_core::{Address, CustomerId, Email, PaymentMethodId};

/// Errors that can occur when interacting with the payment processor.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The processor rejected the request.
    #[error("Processor error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Secret key rejected.
    #[error("Unauthorized: invalid processor key")]
    Unauthorized,

    /// Rate limited by the processor.
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    /// The client secret does not identify a payment intent.
    #[error("Invalid client secret")]
    InvalidClientSecret,

    /// Failed to parse response.
    #[error("Parse error: {0}")]
    Parse(String),
}

impl ProcessorError {
    /// The message to show the shopper.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Api { message, .. } => message.clone(),
            _ => "The payment could not be confirmed".to_string(),
        }
    }
}

/// Result of asking the processor to confirm a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessorOutcome {
    /// Funds captured or authorised.
    Succeeded,
    /// The shopper must authenticate (3-D Secure) before the payment can finish.
    RequiresAction { redirect_url: Option<String> },
    /// The processor accepted the payment and will settle it asynchronously.
    Processing,
    /// The processor declined the payment.
    Failed { message: String },
}

/// Operations the checkout flow needs from the payment processor.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Tokenise a card into a reusable payment method, billed to `billing`.
    async fn create_payment_method(
        &self,
        card_token: &str,
        billing: &Address,
        email: &Email,
    ) -> Result<PaymentMethodId, ProcessorError>;

    /// Attach a payment method to a processor customer for future use.
    async fn attach_payment_method(
        &self,
        payment_method: &PaymentMethodId,
        customer: &CustomerId,
    ) -> Result<(), ProcessorError>;

    /// Confirm the payment intent identified by `client_secret`, charging
    /// `payment_method` when one is given.
    async fn confirm_payment(
        &self,
        client_secret: &str,
        payment_method: Option<&PaymentMethodId>,
        return_url: &str,
    ) -> Result<ProcessorOutcome, ProcessorError>;

    /// Current state of the payment intent identified by `client_secret`.
    async fn payment_status(&self, client_secret: &str) -> Result<ProcessorOutcome, ProcessorError>;
}
