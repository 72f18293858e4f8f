//! HTTP implementation of [`CommerceApi`].
//!
//! Every request carries a client-credentials bearer token, fetched on demand and
//! cached in memory until shortly before it expires. Account-scoped calls (account
//! checkout, saved addresses) add the member's account-management token header.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::instrument;

use composable_core::{
    AccountId, Address, AddressId, CartId, CartItemId, CustomerId, Money, OrderId,
    OrderPaymentStatus, ShippingGroupId, TransactionId, TransactionStatus,
};

use super::{
    Account, AccountAddress, AccountCredential, ApiErrorDetail, Cart, CartItem, CartItemUpdate,
    CheckoutCustomer, CheckoutRequest, CommerceApi, CommerceError, CustomItemInput,
    NewShippingGroup, Order, OrderContact, OrderItem, PaymentRequest, ShippingGroup, Transaction,
};
use crate::config::CommerceConfig;

/// Header carrying a member's account-management token.
pub const ACCOUNT_TOKEN_HEADER: &str = "EP-Account-Management-Authentication-Token";

/// Refresh the platform token this many seconds before it expires.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

/// Commerce platform REST client.
#[derive(Clone)]
pub struct EpClient {
    inner: Arc<EpClientInner>,
}

struct EpClientInner {
    client: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: SecretString,
    /// In-memory token cache
    token: RwLock<Option<AccessToken>>,
}

#[derive(Clone)]
struct AccessToken {
    value: SecretString,
    expires_at: i64,
}

impl AccessToken {
    fn is_fresh(&self, now: i64) -> bool {
        self.expires_at - TOKEN_EXPIRY_MARGIN_SECS > now
    }
}

// =============================================================================
// Wire shapes
// =============================================================================

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Deserialize)]
struct DisplayMeta {
    display_price: DisplayPrice,
}

#[derive(Deserialize)]
struct DisplayPrice {
    with_tax: Money,
}

#[derive(Deserialize)]
struct CartEnvelope {
    data: CartData,
    #[serde(default)]
    included: CartIncluded,
}

#[derive(Deserialize)]
struct CartData {
    id: CartId,
    #[serde(default)]
    name: String,
    #[serde(default)]
    meta: Option<DisplayMeta>,
}

#[derive(Deserialize, Default)]
struct CartIncluded {
    #[serde(default)]
    items: Vec<CartItem>,
}

#[derive(Deserialize)]
struct OrderEnvelope {
    data: OrderData,
    #[serde(default)]
    included: OrderIncluded,
}

#[derive(Deserialize)]
struct OrderData {
    id: OrderId,
    #[serde(default)]
    status: String,
    #[serde(default)]
    payment: OrderPaymentStatus,
    #[serde(default)]
    contact: Option<OrderContact>,
    #[serde(default)]
    customer: Option<OrderContact>,
    #[serde(default)]
    shipping_address: Address,
    #[serde(default)]
    billing_address: Address,
    #[serde(default)]
    meta: Option<DisplayMeta>,
}

#[derive(Deserialize, Default)]
struct OrderIncluded {
    #[serde(default)]
    items: Vec<OrderItem>,
}

#[derive(Deserialize)]
struct TransactionData {
    id: TransactionId,
    #[serde(default)]
    status: TransactionStatus,
    #[serde(default)]
    gateway: String,
    #[serde(default)]
    client_parameters: Option<ClientParameters>,
}

#[derive(Deserialize)]
struct ClientParameters {
    #[serde(default)]
    secret: Option<String>,
}

#[derive(Deserialize)]
struct AccountData {
    id: AccountId,
    #[serde(default)]
    name: String,
    #[serde(default, alias = "stripe_customer_id")]
    processor_customer_id: Option<CustomerId>,
}

impl From<CartEnvelope> for Cart {
    fn from(envelope: CartEnvelope) -> Self {
        Self {
            id: envelope.data.id,
            name: envelope.data.name,
            items: envelope.included.items,
            total: envelope.data.meta.map(|m| m.display_price.with_tax),
        }
    }
}

impl From<OrderEnvelope> for Order {
    fn from(envelope: OrderEnvelope) -> Self {
        let data = envelope.data;
        Self {
            id: data.id,
            status: data.status,
            payment: data.payment,
            contact: data.contact.or(data.customer).unwrap_or_default(),
            shipping_address: data.shipping_address,
            billing_address: data.billing_address,
            total: data.meta.map(|m| m.display_price.with_tax),
            items: envelope.included.items,
        }
    }
}

impl From<TransactionData> for Transaction {
    fn from(data: TransactionData) -> Self {
        Self {
            id: data.id,
            status: data.status,
            gateway: data.gateway,
            client_secret: data.client_parameters.and_then(|p| p.secret),
        }
    }
}

// =============================================================================
// Client
// =============================================================================

impl EpClient {
    /// Create a new commerce platform client.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client fails to build.
    pub fn new(config: &CommerceConfig) -> Result<Self, CommerceError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            inner: Arc::new(EpClientInner {
                client,
                base_url: config.api_base_url.trim_end_matches('/').to_string(),
                client_id: config.client_id.clone(),
                client_secret: config.client_secret.clone(),
                token: RwLock::new(None),
            }),
        })
    }

    /// Get a valid platform token, fetching a new one when the cached token is stale.
    async fn access_token(&self) -> Result<String, CommerceError> {
        let now = chrono::Utc::now().timestamp();

        if let Some(token) = self.inner.token.read().await.as_ref()
            && token.is_fresh(now)
        {
            return Ok(token.value.expose_secret().to_string());
        }

        let token = self.fetch_token(now).await?;
        let value = token.value.expose_secret().to_string();
        *self.inner.token.write().await = Some(token);
        Ok(value)
    }

    #[instrument(skip(self))]
    async fn fetch_token(&self, now: i64) -> Result<AccessToken, CommerceError> {
        let url = format!("{}/oauth/access_token", self.inner.base_url);
        let response = self
            .inner
            .client
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.inner.client_id.as_str()),
                ("client_secret", self.inner.client_secret.expose_secret()),
            ])
            .send()
            .await?;

        let token: TokenResponse = self.handle_response(response).await?;
        tracing::debug!(expires_in = token.expires_in, "Fetched commerce platform token");

        Ok(AccessToken {
            value: SecretString::from(token.access_token),
            expires_at: now + token.expires_in,
        })
    }

    /// Start an authenticated request.
    async fn request(
        &self,
        method: Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, CommerceError> {
        let token = self.access_token().await?;
        let url = format!("{}{path}", self.inner.base_url);
        Ok(self.inner.client.request(method, url).bearer_auth(token))
    }

    /// Start an authenticated request on behalf of an account member.
    async fn account_request(
        &self,
        method: Method,
        path: &str,
        credential: &AccountCredential,
    ) -> Result<reqwest::RequestBuilder, CommerceError> {
        Ok(self
            .request(method, path)
            .await?
            .header(ACCOUNT_TOKEN_HEADER, credential.token.expose_secret()))
    }

    async fn send<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, CommerceError> {
        let response = builder.send().await?;
        self.handle_response(response).await
    }

    async fn send_empty(&self, builder: reqwest::RequestBuilder) -> Result<(), CommerceError> {
        let response = builder.send().await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(self.parse_error(response).await)
    }

    /// Handle API response and parse JSON.
    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, CommerceError> {
        let status = response.status();

        if !status.is_success() {
            return Err(self.parse_error(response).await);
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            tracing::error!(
                error = %e,
                body = %body.chars().take(500).collect::<String>(),
                "Failed to parse commerce platform response"
            );
            CommerceError::Parse(e.to_string())
        })
    }

    /// Parse error response from the platform.
    async fn parse_error(&self, response: reqwest::Response) -> CommerceError {
        let status = response.status().as_u16();

        if status == 429 {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(1);
            return CommerceError::RateLimited(retry_after);
        }

        if status == 401 || status == 403 {
            return CommerceError::Unauthorized;
        }

        if status == 404 {
            return CommerceError::NotFound(response.url().path().to_string());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        let errors = match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(envelope) if !envelope.errors.is_empty() => envelope.errors,
            _ => vec![ApiErrorDetail::new(
                "Error",
                body.chars().take(200).collect::<String>(),
            )],
        };

        tracing::warn!(status, errors = ?errors, "Commerce platform rejected request");
        CommerceError::Api { status, errors }
    }
}

impl std::fmt::Debug for EpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpClient")
            .field("base_url", &self.inner.base_url)
            .field("client_id", &self.inner.client_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CommerceApi for EpClient {
    #[instrument(skip(self), fields(cart_id = %cart_id))]
    async fn get_cart(&self, cart_id: &CartId) -> Result<Cart, CommerceError> {
        let path = format!("/v2/carts/{}?include=items", urlencoding::encode(cart_id.as_str()));
        let envelope: CartEnvelope = self.send(self.request(Method::GET, &path).await?).await?;
        Ok(envelope.into())
    }

    #[instrument(skip(self))]
    async fn create_cart(&self, name: &str) -> Result<Cart, CommerceError> {
        let body = json!({ "data": { "name": name } });
        let builder = self.request(Method::POST, "/v2/carts").await?.json(&body);
        let envelope: DataEnvelope<CartData> = self.send(builder).await?;
        Ok(Cart {
            id: envelope.data.id,
            name: envelope.data.name,
            items: Vec::new(),
            total: envelope.data.meta.map(|m| m.display_price.with_tax),
        })
    }

    #[instrument(skip(self, item), fields(cart_id = %cart_id, sku = %item.sku))]
    async fn add_custom_item(
        &self,
        cart_id: &CartId,
        item: &CustomItemInput,
    ) -> Result<(), CommerceError> {
        let mut data = json!({
            "type": "custom_item",
            "name": item.name,
            "sku": item.sku,
            "quantity": item.quantity,
            "price": { "amount": item.amount, "includes_tax": true },
        });
        if let Some(description) = &item.description {
            data["description"] = json!(description);
        }

        let path = format!("/v2/carts/{}/items", urlencoding::encode(cart_id.as_str()));
        let builder = self
            .request(Method::POST, &path)
            .await?
            .json(&json!({ "data": data }));
        let _: DataEnvelope<Vec<CartItem>> = self.send(builder).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(cart_id = %cart_id, item_id = %item_id))]
    async fn remove_cart_item(
        &self,
        cart_id: &CartId,
        item_id: &CartItemId,
    ) -> Result<(), CommerceError> {
        let path = format!(
            "/v2/carts/{}/items/{}",
            urlencoding::encode(cart_id.as_str()),
            urlencoding::encode(item_id.as_str())
        );
        self.send_empty(self.request(Method::DELETE, &path).await?)
            .await
    }

    #[instrument(skip(self, update), fields(cart_id = %cart_id, item_id = %item_id))]
    async fn update_cart_item(
        &self,
        cart_id: &CartId,
        item_id: &CartItemId,
        update: &CartItemUpdate,
    ) -> Result<CartItem, CommerceError> {
        let body = json!({
            "data": {
                "type": "cart_item",
                "id": item_id,
                "quantity": update.quantity,
                "shipping_group_id": update.shipping_group_id,
            }
        });
        let path = format!(
            "/v2/carts/{}/items/{}",
            urlencoding::encode(cart_id.as_str()),
            urlencoding::encode(item_id.as_str())
        );
        let builder = self.request(Method::PUT, &path).await?.json(&body);
        let envelope: DataEnvelope<Vec<CartItem>> = self.send(builder).await?;

        envelope
            .data
            .into_iter()
            .find(|item| &item.id == item_id)
            .ok_or_else(|| CommerceError::NotFound(format!("Cart item {item_id}")))
    }

    #[instrument(skip(self), fields(cart_id = %cart_id))]
    async fn clear_cart(&self, cart_id: &CartId) -> Result<(), CommerceError> {
        let path = format!("/v2/carts/{}/items", urlencoding::encode(cart_id.as_str()));
        self.send_empty(self.request(Method::DELETE, &path).await?)
            .await
    }

    #[instrument(skip(self), fields(cart_id = %cart_id))]
    async fn list_shipping_groups(
        &self,
        cart_id: &CartId,
    ) -> Result<Vec<ShippingGroup>, CommerceError> {
        let path = format!(
            "/v2/carts/{}/shipping-groups",
            urlencoding::encode(cart_id.as_str())
        );
        let envelope: DataEnvelope<Vec<ShippingGroup>> =
            self.send(self.request(Method::GET, &path).await?).await?;
        Ok(envelope.data)
    }

    #[instrument(skip(self, group), fields(cart_id = %cart_id, shipping_type = %group.shipping_type))]
    async fn create_shipping_group(
        &self,
        cart_id: &CartId,
        group: &NewShippingGroup,
    ) -> Result<ShippingGroup, CommerceError> {
        let mut data =
            serde_json::to_value(group).map_err(|e| CommerceError::Parse(e.to_string()))?;
        data["type"] = json!("shipping_group");

        let path = format!(
            "/v2/carts/{}/shipping-groups",
            urlencoding::encode(cart_id.as_str())
        );
        let builder = self
            .request(Method::POST, &path)
            .await?
            .json(&json!({ "data": data }));
        let envelope: DataEnvelope<ShippingGroup> = self.send(builder).await?;
        Ok(envelope.data)
    }

    #[instrument(skip(self), fields(cart_id = %cart_id, group_id = %group_id))]
    async fn delete_shipping_group(
        &self,
        cart_id: &CartId,
        group_id: &ShippingGroupId,
    ) -> Result<(), CommerceError> {
        let path = format!(
            "/v2/carts/{}/shipping-groups/{}",
            urlencoding::encode(cart_id.as_str()),
            urlencoding::encode(group_id.as_str())
        );
        self.send_empty(self.request(Method::DELETE, &path).await?)
            .await
    }

    #[instrument(skip(self, request, credential), fields(cart_id = %cart_id))]
    async fn checkout(
        &self,
        cart_id: &CartId,
        request: &CheckoutRequest,
        credential: Option<&AccountCredential>,
    ) -> Result<Order, CommerceError> {
        let mut data = match &request.customer {
            CheckoutCustomer::Guest { email, name } => json!({
                "customer": { "email": email, "name": name },
            }),
            CheckoutCustomer::Account {
                account_id,
                member_id,
                email,
                name,
            } => json!({
                "account": { "id": account_id, "member_id": member_id },
                "contact": { "email": email, "name": name },
            }),
        };
        data["billing_address"] = json!(request.billing_address);
        data["shipping_address"] = json!(request.shipping_address);
        if let Some(po) = &request.purchase_order_number {
            data["purchase_order_number"] = json!(po);
        }
        if let Some(quote_id) = &request.quote_id {
            data["quote_id"] = json!(quote_id);
        }
        if let Some(notes) = &request.notes {
            data["notes"] = json!(notes);
        }

        let path = format!(
            "/v2/carts/{}/checkout?include=items",
            urlencoding::encode(cart_id.as_str())
        );
        let builder = match credential {
            Some(credential) => {
                self.account_request(Method::POST, &path, credential)
                    .await?
            }
            None => self.request(Method::POST, &path).await?,
        };
        let envelope: OrderEnvelope = self.send(builder.json(&json!({ "data": data }))).await?;
        Ok(envelope.into())
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    async fn get_order(&self, order_id: &OrderId) -> Result<Order, CommerceError> {
        let path = format!(
            "/v2/orders/{}?include=items",
            urlencoding::encode(order_id.as_str())
        );
        let envelope: OrderEnvelope = self.send(self.request(Method::GET, &path).await?).await?;
        Ok(envelope.into())
    }

    #[instrument(skip(self, request), fields(order_id = %order_id, gateway = %request.gateway))]
    async fn create_payment(
        &self,
        order_id: &OrderId,
        request: &PaymentRequest,
    ) -> Result<Transaction, CommerceError> {
        let path = format!(
            "/v2/orders/{}/payments",
            urlencoding::encode(order_id.as_str())
        );
        let builder = self
            .request(Method::POST, &path)
            .await?
            .json(&json!({ "data": request }));
        let envelope: DataEnvelope<TransactionData> = self.send(builder).await?;
        Ok(envelope.data.into())
    }

    #[instrument(skip(self), fields(order_id = %order_id, transaction_id = %transaction_id))]
    async fn confirm_payment(
        &self,
        order_id: &OrderId,
        transaction_id: &TransactionId,
    ) -> Result<Transaction, CommerceError> {
        let path = format!(
            "/v2/orders/{}/transactions/{}/confirm",
            urlencoding::encode(order_id.as_str()),
            urlencoding::encode(transaction_id.as_str())
        );
        let builder = self
            .request(Method::POST, &path)
            .await?
            .json(&json!({ "data": {} }));
        let envelope: DataEnvelope<TransactionData> = self.send(builder).await?;
        Ok(envelope.data.into())
    }

    #[instrument(skip(self, credential), fields(account_id = %credential.account_id))]
    async fn get_account(&self, credential: &AccountCredential) -> Result<Account, CommerceError> {
        let path = format!(
            "/v2/accounts/{}",
            urlencoding::encode(credential.account_id.as_str())
        );
        let builder = self.account_request(Method::GET, &path, credential).await?;
        let envelope: DataEnvelope<AccountData> = self.send(builder).await?;
        Ok(Account {
            id: envelope.data.id,
            name: envelope.data.name,
            processor_customer_id: envelope.data.processor_customer_id,
        })
    }

    #[instrument(skip(self, credential), fields(account_id = %credential.account_id, address_id = %address_id))]
    async fn get_account_address(
        &self,
        credential: &AccountCredential,
        address_id: &AddressId,
    ) -> Result<AccountAddress, CommerceError> {
        let path = format!(
            "/v2/accounts/{}/addresses/{}",
            urlencoding::encode(credential.account_id.as_str()),
            urlencoding::encode(address_id.as_str())
        );
        let builder = self.account_request(Method::GET, &path, credential).await?;
        let envelope: DataEnvelope<AccountAddress> = self.send(builder).await?;
        Ok(envelope.data)
    }
}
