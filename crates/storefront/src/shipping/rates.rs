//! Sources of raw shipping-rate data.

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::instrument;

use composable_core::CartId;

/// Errors returned by a rate source.
#[derive(Debug, Error)]
pub enum RateSourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rate endpoint returned {0}")]
    Status(u16),
}

/// Where delivery methods come from.
///
/// Sources return the upstream payload untouched; normalisation happens in
/// [`super::DeliveryMethodResolver`].
#[async_trait]
pub trait ShippingRateSource: Send + Sync {
    async fn fetch_rates(&self, cart_id: &CartId) -> Result<Value, RateSourceError>;
}

/// Rates fetched from an HTTP endpoint (`GET <url>?cart_id=...`).
#[derive(Debug, Clone)]
pub struct HttpRateSource {
    client: reqwest::Client,
    url: String,
}

impl HttpRateSource {
    /// Create a source for the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client fails to build.
    pub fn new(url: impl Into<String>) -> Result<Self, RateSourceError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ShippingRateSource for HttpRateSource {
    #[instrument(skip(self), fields(cart_id = %cart_id))]
    async fn fetch_rates(&self, cart_id: &CartId) -> Result<Value, RateSourceError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("cart_id", cart_id.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RateSourceError::Status(status.as_u16()));
        }

        Ok(response.json().await?)
    }
}

/// Fixed rate table used when no rate endpoint is configured.
#[derive(Debug, Clone, Default)]
pub struct StaticRateSource;

impl StaticRateSource {
    /// The built-in table: free standard shipping and paid express shipping.
    #[must_use]
    pub fn table() -> Value {
        json!({
            "standard": {
                "label": "Standard shipping",
                "amount": 0,
                "message": "Delivered in 3-5 business days",
                "sort_order": 2
            },
            "express": {
                "label": "Express shipping",
                "amount": 1200,
                "message": "Delivered in 1-2 business days",
                "sort_order": 1
            }
        })
    }
}

#[async_trait]
impl ShippingRateSource for StaticRateSource {
    async fn fetch_rates(&self, _cart_id: &CartId) -> Result<Value, RateSourceError> {
        Ok(Self::table())
    }
}
