//! Delivery method resolution.
//!
//! Rate endpoints disagree on shape. Some return an object keyed by method token,
//! some an array, some wrap either in `{"data": ...}`, and field names vary
//! (`label`/`name`/`title`, `amount`/`price`/`cost`). Everything is normalised to
//! [`DeliveryOption`] and sorted by descending `sort_order`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{instrument, warn};

use composable_core::{CartId, CurrencyCode, Money};

use super::rates::ShippingRateSource;

/// A delivery method ready for display and pricing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOption {
    pub label: String,
    /// Method token submitted with the checkout form.
    pub value: String,
    /// Price in minor units.
    pub amount: i64,
    pub currency: CurrencyCode,
    pub formatted: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub sort_order: i64,
}

/// Resolves the delivery methods available to a cart.
#[derive(Clone)]
pub struct DeliveryMethodResolver {
    source: Arc<dyn ShippingRateSource>,
    currency: CurrencyCode,
}

impl DeliveryMethodResolver {
    /// Create a resolver over a rate source. `currency` applies to entries that
    /// do not name one.
    #[must_use]
    pub fn new(source: Arc<dyn ShippingRateSource>, currency: CurrencyCode) -> Self {
        Self { source, currency }
    }

    /// Fetch and normalise the delivery methods for a cart.
    ///
    /// Upstream failures are logged and yield an empty list; an empty list blocks
    /// progression past the delivery step.
    #[instrument(skip(self), fields(cart_id = %cart_id))]
    pub async fn resolve(&self, cart_id: &CartId) -> Vec<DeliveryOption> {
        match self.source.fetch_rates(cart_id).await {
            Ok(payload) => normalize(&payload, &self.currency),
            Err(e) => {
                warn!(error = %e, "Shipping rate lookup failed");
                Vec::new()
            }
        }
    }

    /// Resolve a single method by token.
    pub async fn find(&self, cart_id: &CartId, token: &str) -> Option<DeliveryOption> {
        self.resolve(cart_id)
            .await
            .into_iter()
            .find(|option| option.value == token)
    }
}

impl std::fmt::Debug for DeliveryMethodResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryMethodResolver")
            .field("currency", &self.currency)
            .finish_non_exhaustive()
    }
}

/// Normalise an upstream rate payload.
///
/// Entries without a usable token or with a non-numeric price are skipped.
#[must_use]
pub fn normalize(payload: &Value, default_currency: &CurrencyCode) -> Vec<DeliveryOption> {
    let mut options: Vec<DeliveryOption> = match payload {
        Value::Object(map) if map.contains_key("data") => {
            return map
                .get("data")
                .map(|data| normalize(data, default_currency))
                .unwrap_or_default();
        }
        Value::Object(map) => map
            .iter()
            .filter_map(|(key, entry)| entry.as_object().map(|e| (Some(key.as_str()), e)))
            .filter_map(|(key, entry)| option_from(entry, key, default_currency))
            .collect(),
        Value::Array(entries) => entries
            .iter()
            .filter_map(Value::as_object)
            .filter_map(|entry| option_from(entry, None, default_currency))
            .collect(),
        _ => Vec::new(),
    };

    options.sort_by(|a, b| b.sort_order.cmp(&a.sort_order));
    options
}

fn option_from(
    entry: &Map<String, Value>,
    key: Option<&str>,
    default_currency: &CurrencyCode,
) -> Option<DeliveryOption> {
    let value = first_string(entry, &["value", "id", "code"])
        .or_else(|| key.map(str::to_string))
        .filter(|v| !v.trim().is_empty())?;

    let amount = match first_present(entry, &["amount", "price", "cost"]) {
        None => 0,
        Some(raw) => as_minor_units(raw)?,
    };

    let currency = first_string(entry, &["currency"])
        .and_then(|c| CurrencyCode::parse(&c).ok())
        .unwrap_or_else(|| default_currency.clone());

    let formatted = first_string(entry, &["formatted"])
        .unwrap_or_else(|| Money::new(amount, currency.clone()).formatted());

    Some(DeliveryOption {
        label: first_string(entry, &["label", "name", "title"]).unwrap_or_else(|| value.clone()),
        value,
        amount,
        currency,
        formatted,
        message: first_string(entry, &["message", "description"]),
        sort_order: first_present(entry, &["sort_order", "sortOrder"])
            .and_then(Value::as_i64)
            .unwrap_or(0),
    })
}

fn first_present<'a>(entry: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| entry.get(*k))
        .find(|v| !v.is_null())
}

fn first_string(entry: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    first_present(entry, keys).and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Prices are integers in minor units, as a number, a numeric string, or an
/// `{"amount": ...}` object.
fn as_minor_units(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Object(map) => map.get("amount").and_then(as_minor_units),
        _ => None,
    }
}
