//! Integration test harness for the composable storefront.
//!
//! [`TestApp`] serves the real router over in-memory collaborators: the
//! commerce platform, payment processor and checkout store from
//! `composable_storefront::testing`, and a fixed delivery-rate table. Requests
//! go through `tower::ServiceExt::oneshot`, so no socket is bound. A small
//! cookie jar carries `Set-Cookie` values between requests the way a browser
//! would.

#![allow(clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use secrecy::SecretString;
use serde_json::{Value, json};
use tower::ServiceExt;
use tower_sessions::MemoryStore;

use composable_core::{AccountId, AccountMemberId, Address, CartId, CurrencyCode};
use composable_storefront::checkout::CheckoutSettings;
use composable_storefront::commerce::AccountCredential;
use composable_storefront::config::{CommerceConfig, PaymentsConfig, StorefrontConfig};
use composable_storefront::middleware::session_layer;
use composable_storefront::routes;
use composable_storefront::session::AccountCredentials;
use composable_storefront::session::cookies::names;
use composable_storefront::shipping::{RateSourceError, ShippingRateSource};
use composable_storefront::state::AppState;
use composable_storefront::testing::{FakeProcessor, InMemoryCommerce, MemoryCheckoutStore};

pub use composable_storefront::testing::FailPoint;

/// Delivery methods offered in tests: free standard and $5.99 express.
#[derive(Debug, Default)]
pub struct TableRateSource;

#[async_trait]
impl ShippingRateSource for TableRateSource {
    async fn fetch_rates(&self, _cart_id: &CartId) -> Result<Value, RateSourceError> {
        Ok(json!([
            { "label": "Standard", "value": "standard", "amount": 0, "sort_order": 2 },
            {
                "label": "Express",
                "value": "express",
                "amount": 599,
                "message": "Next business day",
                "sort_order": 1
            }
        ]))
    }
}

/// Configuration pointing at nothing; every collaborator is in memory.
#[must_use]
pub fn test_config() -> StorefrontConfig {
    StorefrontConfig {
        database_url: SecretString::from("postgres://localhost/unused"),
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 3000,
        base_url: "http://localhost:3000".to_string(),
        currency: CurrencyCode::usd(),
        commerce: CommerceConfig {
            api_base_url: "http://commerce.invalid".to_string(),
            client_id: "client".to_string(),
            client_secret: SecretString::from("unused"),
        },
        payments: PaymentsConfig {
            api_base_url: "http://payments.invalid".to_string(),
            secret_key: SecretString::from("unused"),
        },
        shipping_rates_url: None,
        checkout: CheckoutSettings {
            default_gateway: "elastic_path_payments_stripe".to_string(),
            standard_shipping: "standard".to_string(),
            continue_on_processor_error: false,
            return_url: "http://localhost:3000/checkout/confirmation".to_string(),
        },
        sentry_dsn: None,
        sentry_environment: None,
        sentry_sample_rate: 1.0,
        sentry_traces_sample_rate: 0.0,
    }
}

/// A shipping address that passes validation.
#[must_use]
pub fn address() -> Address {
    Address {
        first_name: "Ada".into(),
        last_name: "Lovelace".into(),
        line_1: "1 Main St".into(),
        city: "Springfield".into(),
        postcode: "12345".into(),
        country: "US".into(),
        ..Address::default()
    }
}

/// Address JSON as the browser submits it.
#[must_use]
pub fn address_json() -> Value {
    serde_json::to_value(address()).unwrap()
}

/// A guest checkout form for the given delivery method.
#[must_use]
pub fn guest_form(shipping_method: &str) -> Value {
    json!({
        "identity": { "kind": "guest", "email": "ada@example.com" },
        "shipping_address": address_json(),
        "same_as_shipping": true,
        "shipping_method": shipping_method,
        "payment_method": "ep_payment"
    })
}

/// An account checkout form for the given delivery method.
#[must_use]
pub fn account_form(shipping_method: &str) -> Value {
    json!({
        "identity": { "kind": "account", "email": "ada@example.com", "name": "Ada Lovelace" },
        "shipping_address": address_json(),
        "same_as_shipping": true,
        "shipping_method": shipping_method,
        "payment_method": "ep_payment",
        "card_token": "tok_visa"
    })
}

/// A credential for `acc-1`, valid until 2100.
#[must_use]
pub fn credential() -> AccountCredential {
    AccountCredential {
        account_id: AccountId::new("acc-1"),
        account_name: Some("Analytical Engines".into()),
        member_id: AccountMemberId::new("mem-1"),
        token: SecretString::from("account-token"),
        expires_at: 4_102_444_800,
    }
}

/// Response captured from the router.
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl TestResponse {
    #[must_use]
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// `data` of a success envelope.
    #[must_use]
    pub fn data(&self) -> Value {
        let body = self.json();
        assert_eq!(body["success"], true, "not a success envelope: {body}");
        body["data"].clone()
    }

    /// Value of a cookie set by this response, if any.
    #[must_use]
    pub fn set_cookie(&self, name: &str) -> Option<String> {
        self.headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(parse_set_cookie)
            .find(|(n, _)| n == name)
            .map(|(_, value)| value)
    }
}

fn parse_set_cookie(header: &str) -> Option<(String, String)> {
    let pair = header.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    Some((name.trim().to_string(), value.trim().to_string()))
}

/// The storefront router over in-memory collaborators.
pub struct TestApp {
    pub commerce: Arc<InMemoryCommerce>,
    pub processor: Arc<FakeProcessor>,
    pub store: Arc<MemoryCheckoutStore>,
    router: Router,
    jar: Mutex<BTreeMap<String, String>>,
}

impl TestApp {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    #[must_use]
    pub fn with_config(config: StorefrontConfig) -> Self {
        let commerce = Arc::new(InMemoryCommerce::new());
        let processor = Arc::new(FakeProcessor::new());
        let store = Arc::new(MemoryCheckoutStore::new());
        let secure = config.is_secure();

        let state = AppState::from_parts(
            config,
            commerce.clone(),
            processor.clone(),
            store.clone(),
            Arc::new(TableRateSource),
        );
        let router = routes::app(state).layer(session_layer(MemoryStore::default(), secure));

        Self {
            commerce,
            processor,
            store,
            router,
            jar: Mutex::new(BTreeMap::new()),
        }
    }

    /// Set a browser cookie directly.
    pub fn set_cookie(&self, name: &str, value: &str) {
        self.jar
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
    }

    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.jar.lock().unwrap().get(name).cloned()
    }

    /// Seed a cart of regular items and point the cart cookie at it.
    pub fn start_cart(&self, items: &[(&str, u32, i64)]) -> CartId {
        let cart_id = self.commerce.seed_cart(items);
        self.set_cookie(names::CART, cart_id.as_str());
        cart_id
    }

    pub fn enable_shipping_groups(&self) {
        self.set_cookie(names::SHIPPING_GROUPS, "true");
    }

    /// Sign in as a member of `acc-1`.
    pub fn sign_in(&self) {
        let bundle = AccountCredentials::single(AccountMemberId::new("mem-1"), &credential());
        let json = serde_json::to_string(&bundle).unwrap();
        self.set_cookie(names::ACCOUNT_MEMBER_TOKEN, &urlencoding::encode(&json));
    }

    pub async fn get(&self, uri: &str) -> TestResponse {
        self.request(Method::GET, uri, None).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> TestResponse {
        self.request(Method::POST, uri, Some(body)).await
    }

    pub async fn put(&self, uri: &str, body: Value) -> TestResponse {
        self.request(Method::PUT, uri, Some(body)).await
    }

    pub async fn delete(&self, uri: &str) -> TestResponse {
        self.request(Method::DELETE, uri, None).await
    }

    async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(cookies) = self.cookie_header() {
            builder = builder.header(COOKIE, cookies);
        }
        let body = match body {
            Some(json) => {
                builder = builder.header(CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec();

        self.store_cookies(&headers);
        TestResponse {
            status,
            headers,
            body,
        }
    }

    fn cookie_header(&self) -> Option<String> {
        let jar = self.jar.lock().unwrap();
        (!jar.is_empty()).then(|| {
            jar.iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ")
        })
    }

    fn store_cookies(&self, headers: &HeaderMap) {
        let mut jar = self.jar.lock().unwrap();
        for header in headers.get_all(SET_COOKIE) {
            let Some(raw) = header.to_str().ok() else {
                continue;
            };
            let Some((name, value)) = parse_set_cookie(raw) else {
                continue;
            };
            let removed = raw.to_ascii_lowercase().contains("max-age=0");
            if value.is_empty() || removed {
                jar.remove(&name);
            } else {
                jar.insert(name, value);
            }
        }
    }
}

impl Default for TestApp {
    fn default() -> Self {
        Self::new()
    }
}
