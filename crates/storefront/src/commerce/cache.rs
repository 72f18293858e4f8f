//! In-memory cart cache.
//!
//! Reads through to the commerce platform on a miss. Every mutation of a cart
//! (item updates, shipping groups, checkout cleanup) must invalidate it so the
//! next read reflects the system of record.

use std::time::Duration;

use moka::future::Cache;
use tracing::debug;

use composable_core::CartId;

use super::{Cart, CommerceApi, CommerceError};

/// Cart entries live at most this long without an explicit invalidation.
const CART_TTL: Duration = Duration::from_secs(60);

/// Cache of carts keyed by cart ID.
#[derive(Clone)]
pub struct CartCache {
    carts: Cache<CartId, Cart>,
}

impl CartCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            carts: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(CART_TTL)
                .build(),
        }
    }

    /// Return the cached cart or load it from the platform.
    ///
    /// # Errors
    ///
    /// Returns the platform error when the cart has to be loaded and cannot be.
    pub async fn get_or_load(
        &self,
        commerce: &dyn CommerceApi,
        cart_id: &CartId,
    ) -> Result<Cart, CommerceError> {
        if let Some(cart) = self.carts.get(cart_id).await {
            debug!(cart_id = %cart_id, "Cache hit for cart");
            return Ok(cart);
        }

        self.refresh(commerce, cart_id).await
    }

    /// Load the cart from the platform and replace the cached copy.
    ///
    /// # Errors
    ///
    /// Returns the platform error if the cart cannot be loaded.
    pub async fn refresh(
        &self,
        commerce: &dyn CommerceApi,
        cart_id: &CartId,
    ) -> Result<Cart, CommerceError> {
        let cart = commerce.get_cart(cart_id).await?;
        self.carts.insert(cart_id.clone(), cart.clone()).await;
        Ok(cart)
    }

    /// Drop one cart from the cache.
    pub async fn invalidate(&self, cart_id: &CartId) {
        self.carts.invalidate(cart_id).await;
    }

    /// Drop every cached cart.
    pub fn invalidate_all(&self) {
        self.carts.invalidate_all();
    }

    /// Whether the cart is currently cached.
    pub async fn contains(&self, cart_id: &CartId) -> bool {
        self.carts.get(cart_id).await.is_some()
    }
}

impl Default for CartCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CartCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CartCache")
            .field("entries", &self.carts.entry_count())
            .finish()
    }
}
