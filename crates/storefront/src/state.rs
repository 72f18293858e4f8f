//! Application state shared across handlers.

use std::sync::Arc;

use sqlx::PgPool;

use crate::checkout::{CheckoutOrchestrator, CheckoutStore, PgCheckoutStore};
use crate::commerce::{CartCache, CommerceApi, CommerceError, EpClient};
use crate::config::StorefrontConfig;
use crate::payments::{PaymentProcessor, ProcessorError, StripeClient};
use crate::shipping::{
    DeliveryMethodResolver, HttpRateSource, RateSourceError, ShippingGroupManager,
    ShippingRateSource, StaticRateSource,
};

/// Error building the application state.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("commerce client: {0}")]
    Commerce(#[from] CommerceError),
    #[error("payment processor client: {0}")]
    Processor(#[from] ProcessorError),
    #[error("shipping rate source: {0}")]
    RateSource(#[from] RateSourceError),
}

/// Application state shared across all handlers.
///
/// This struct is cheaply cloneable via `Arc`. Every service shares one
/// [`CartCache`] so a write through any of them invalidates the same entries.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: StorefrontConfig,
    commerce: Arc<dyn CommerceApi>,
    carts: CartCache,
    shipping_groups: ShippingGroupManager,
    delivery: DeliveryMethodResolver,
    checkout: CheckoutOrchestrator,
    store: Arc<dyn CheckoutStore>,
}

impl AppState {
    /// Create the production state: platform and processor REST clients, the
    /// Postgres checkout store and the configured rate source.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be built.
    pub fn new(config: StorefrontConfig, pool: PgPool) -> Result<Self, StateError> {
        let commerce: Arc<dyn CommerceApi> = Arc::new(EpClient::new(&config.commerce)?);
        let processor: Arc<dyn PaymentProcessor> = Arc::new(StripeClient::new(&config.payments)?);
        let store: Arc<dyn CheckoutStore> = Arc::new(PgCheckoutStore::new(pool));
        let rates: Arc<dyn ShippingRateSource> = match &config.shipping_rates_url {
            Some(url) => Arc::new(HttpRateSource::new(url.clone())?),
            None => {
                tracing::info!("SHIPPING_RATES_URL not set, using the static delivery table");
                Arc::new(StaticRateSource)
            }
        };

        Ok(Self::from_parts(config, commerce, processor, store, rates))
    }

    /// Assemble the state from already-built collaborators.
    #[must_use]
    pub fn from_parts(
        config: StorefrontConfig,
        commerce: Arc<dyn CommerceApi>,
        processor: Arc<dyn PaymentProcessor>,
        store: Arc<dyn CheckoutStore>,
        rates: Arc<dyn ShippingRateSource>,
    ) -> Self {
        let carts = CartCache::new();
        let delivery = DeliveryMethodResolver::new(rates, config.currency.clone());
        let shipping_groups = ShippingGroupManager::new(Arc::clone(&commerce), carts.clone());
        let checkout = CheckoutOrchestrator::new(
            Arc::clone(&commerce),
            processor,
            Arc::clone(&store),
            delivery.clone(),
            carts.clone(),
            config.checkout.clone(),
        );

        Self {
            inner: Arc::new(AppStateInner {
                config,
                commerce,
                carts,
                shipping_groups,
                delivery,
                checkout,
                store,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &StorefrontConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn commerce(&self) -> &dyn CommerceApi {
        self.inner.commerce.as_ref()
    }

    #[must_use]
    pub fn carts(&self) -> &CartCache {
        &self.inner.carts
    }

    #[must_use]
    pub fn shipping_groups(&self) -> &ShippingGroupManager {
        &self.inner.shipping_groups
    }

    #[must_use]
    pub fn delivery(&self) -> &DeliveryMethodResolver {
        &self.inner.delivery
    }

    #[must_use]
    pub fn checkout(&self) -> &CheckoutOrchestrator {
        &self.inner.checkout
    }

    #[must_use]
    pub fn store(&self) -> &dyn CheckoutStore {
        self.inner.store.as_ref()
    }
}
