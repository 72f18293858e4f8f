//! Commerce platform REST API client.
//!
//! # Architecture
//!
//! - The commerce platform is the system of record for carts, shipping groups,
//!   orders and payments. Nothing here is synced locally.
//! - Services depend on the [`CommerceApi`] trait, not on the HTTP client, so the
//!   checkout flow can run against the in-memory platform in tests.
//! - Carts are cached in memory via `moka` (60 second TTL) and invalidated on
//!   every mutation (see [`CartCache`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use composable_storefront::commerce::{CommerceApi, EpClient};
//!
//! let client = EpClient::new(&config.commerce)?;
//! let cart = client.get_cart(&cart_id).await?;
//! let groups = client.list_shipping_groups(&cart_id).await?;
//! ```

mod cache;
mod client;
pub mod types;

pub use cache::CartCache;
pub use client::EpClient;
pub use types::*;

use async_trait::async_trait;
use thiserror::Error;

use composable_core::{AddressId, CartId, CartItemId, OrderId, ShippingGroupId, TransactionId};

/// Errors that can occur when interacting with the commerce platform.
#[derive(Debug, Error)]
pub enum CommerceError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The platform rejected the request with structured errors.
    #[error("API error: {status} - {}", format_api_errors(.errors))]
    Api {
        status: u16,
        errors: Vec<ApiErrorDetail>,
    },

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Client credentials or account token rejected.
    #[error("Unauthorized: credentials rejected by commerce platform")]
    Unauthorized,

    /// Rate limited by the platform.
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    /// Failed to parse response.
    #[error("Parse error: {0}")]
    Parse(String),
}

impl CommerceError {
    /// Build an API error from a single message.
    #[must_use]
    pub fn api(status: u16, detail: impl Into<String>) -> Self {
        Self::Api {
            status,
            errors: vec![ApiErrorDetail::new("Error", detail)],
        }
    }

    /// The message to show the shopper: the first structured error detail when
    /// the platform sent one, a generic message otherwise.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Api { errors, .. } => errors.first().map_or_else(
                || "The store could not process the request".to_string(),
                |e| e.message().to_string(),
            ),
            Self::NotFound(_) => "The requested resource was not found".to_string(),
            Self::RateLimited(_) => "Too many requests, please try again shortly".to_string(),
            Self::Http(_) | Self::Unauthorized | Self::Parse(_) => {
                "The store is temporarily unavailable".to_string()
            }
        }
    }

    /// Whether the platform rejected the request because of its content (4xx).
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Api { status, .. } if *status >= 400 && *status < 500)
    }
}

fn format_api_errors(errors: &[ApiErrorDetail]) -> String {
    errors
        .iter()
        .map(ApiErrorDetail::message)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Cart item fields written by an item-level update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartItemUpdate {
    pub quantity: u32,
    /// `None` clears the item's shipping-group reference.
    pub shipping_group_id: Option<ShippingGroupId>,
}

/// Operations the checkout flow needs from the commerce platform.
#[async_trait]
pub trait CommerceApi: Send + Sync {
    /// Fetch a cart with its items.
    async fn get_cart(&self, cart_id: &CartId) -> Result<Cart, CommerceError>;

    /// Create a new empty cart.
    async fn create_cart(&self, name: &str) -> Result<Cart, CommerceError>;

    /// Add a synthetic custom item.
    async fn add_custom_item(
        &self,
        cart_id: &CartId,
        item: &CustomItemInput,
    ) -> Result<(), CommerceError>;

    /// Remove one line from a cart.
    async fn remove_cart_item(
        &self,
        cart_id: &CartId,
        item_id: &CartItemId,
    ) -> Result<(), CommerceError>;

    /// Update one line (quantity and shipping-group reference).
    async fn update_cart_item(
        &self,
        cart_id: &CartId,
        item_id: &CartItemId,
        update: &CartItemUpdate,
    ) -> Result<CartItem, CommerceError>;

    /// Remove every line from a cart.
    async fn clear_cart(&self, cart_id: &CartId) -> Result<(), CommerceError>;

    /// List the shipping groups of a cart.
    async fn list_shipping_groups(
        &self,
        cart_id: &CartId,
    ) -> Result<Vec<ShippingGroup>, CommerceError>;

    /// Create a shipping group on a cart.
    async fn create_shipping_group(
        &self,
        cart_id: &CartId,
        group: &NewShippingGroup,
    ) -> Result<ShippingGroup, CommerceError>;

    /// Delete a shipping group record.
    async fn delete_shipping_group(
        &self,
        cart_id: &CartId,
        group_id: &ShippingGroupId,
    ) -> Result<(), CommerceError>;

    /// Convert a cart into an order. Account checkouts pass the member's credential.
    async fn checkout(
        &self,
        cart_id: &CartId,
        request: &CheckoutRequest,
        credential: Option<&AccountCredential>,
    ) -> Result<Order, CommerceError>;

    /// Fetch an order with its items.
    async fn get_order(&self, order_id: &OrderId) -> Result<Order, CommerceError>;

    /// Pay for an order through a gateway.
    async fn create_payment(
        &self,
        order_id: &OrderId,
        request: &PaymentRequest,
    ) -> Result<Transaction, CommerceError>;

    /// Tell the platform the processor has confirmed the payment.
    async fn confirm_payment(
        &self,
        order_id: &OrderId,
        transaction_id: &TransactionId,
    ) -> Result<Transaction, CommerceError>;

    /// Fetch the selected account of a signed-in member.
    async fn get_account(&self, credential: &AccountCredential) -> Result<Account, CommerceError>;

    /// Fetch a saved address of the selected account.
    async fn get_account_address(
        &self,
        credential: &AccountCredential,
        address_id: &AddressId,
    ) -> Result<AccountAddress, CommerceError>;
}
