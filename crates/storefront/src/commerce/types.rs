//! Domain types for the commerce platform API.
//!
//! These types provide a clean, ergonomic API separate from the raw
//! JSON envelopes the platform returns (see `client.rs` for the wire shapes).

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use composable_core::{
    AccountId, AccountMemberId, Address, AddressId, CartId, CartItemId, CustomerId, Email, Money,
    OrderId, OrderPaymentStatus, PaymentMethodId, ShippingGroupId, TransactionId,
    TransactionStatus,
};

// =============================================================================
// Errors
// =============================================================================

/// One entry of the platform's `{"errors": [...]}` response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ApiErrorDetail {
    /// HTTP status echoed by the platform (sometimes a string, sometimes a number).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<serde_json::Value>,
    /// Short error title.
    #[serde(default)]
    pub title: String,
    /// Human readable explanation, suitable for showing to the shopper.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ApiErrorDetail {
    /// Build a detail with only a message.
    #[must_use]
    pub fn new(title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            status: None,
            title: title.into(),
            detail: Some(detail.into()),
        }
    }

    /// The most specific message available.
    #[must_use]
    pub fn message(&self) -> &str {
        self.detail
            .as_deref()
            .filter(|d| !d.is_empty())
            .unwrap_or(&self.title)
    }
}

// =============================================================================
// Cart Types
// =============================================================================

/// Kind of cart or order line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CartItemKind {
    /// Catalog product.
    #[default]
    CartItem,
    /// Synthetic line not backed by a product (shipping, fees).
    CustomItem,
    /// Recurring subscription offering.
    SubscriptionItem,
    /// Promotion/discount line.
    PromotionItem,
    #[serde(other)]
    Unknown,
}

impl CartItemKind {
    /// Whether the line is a physical thing that must be assigned a destination.
    #[must_use]
    pub const fn requires_shipping(self) -> bool {
        !matches!(self, Self::PromotionItem)
    }
}

/// A line item in a cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub id: CartItemId,
    #[serde(rename = "type", default)]
    pub kind: CartItemKind,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    pub quantity: u32,
    pub unit_price: Money,
    /// Shipping group this item is assigned to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipping_group_id: Option<ShippingGroupId>,
}

impl CartItem {
    /// Unit price multiplied by quantity.
    #[must_use]
    pub fn line_total(&self) -> Money {
        Money::new(
            self.unit_price.amount * i64::from(self.quantity),
            self.unit_price.currency.clone(),
        )
    }

    /// Whether the line must be assigned a destination. Promotions and the
    /// shipping line added at checkout never are.
    #[must_use]
    pub fn needs_delivery(&self) -> bool {
        self.kind.requires_shipping() && !crate::checkout::is_shipping_sku(self.sku.as_deref())
    }
}

/// A cart with its items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    pub id: CartId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub items: Vec<CartItem>,
    /// Cart total including tax, as computed by the platform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<Money>,
}

impl Cart {
    /// Find an item by ID.
    #[must_use]
    pub fn item(&self, id: &CartItemId) -> Option<&CartItem> {
        self.items.iter().find(|item| &item.id == id)
    }

    /// Items that must be assigned a shipping destination.
    pub fn shippable_items(&self) -> impl Iterator<Item = &CartItem> {
        self.items.iter().filter(|item| item.needs_delivery())
    }

    /// Whether the cart contains recurring subscription lines.
    #[must_use]
    pub fn has_subscription_items(&self) -> bool {
        self.items
            .iter()
            .any(|item| item.kind == CartItemKind::SubscriptionItem)
    }
}

/// Input for adding a synthetic custom item to a cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CustomItemInput {
    pub name: String,
    pub sku: String,
    pub quantity: u32,
    /// Price in minor units, tax inclusive.
    pub amount: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// =============================================================================
// Shipping Group Types
// =============================================================================

/// Delivery window estimate for a shipping group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DeliveryEstimate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
}

/// Computed shipping price for a group, in minor units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ShippingPrice {
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub base: i64,
    #[serde(default)]
    pub tax: i64,
    #[serde(default)]
    pub fees: i64,
    #[serde(default)]
    pub discount: i64,
}

/// A shipping group as stored on the platform.
///
/// The member items are not part of the record: an item belongs to a group when
/// its `shipping_group_id` equals the group's ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingGroup {
    pub id: ShippingGroupId,
    pub shipping_type: String,
    pub address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_estimate: Option<DeliveryEstimate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipping_price: Option<ShippingPrice>,
}

/// Input for creating a shipping group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewShippingGroup {
    pub shipping_type: String,
    pub address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_estimate: Option<DeliveryEstimate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipping_price: Option<ShippingPrice>,
}

// =============================================================================
// Account Types
// =============================================================================

/// An account-management token for the selected account of a signed-in member.
#[derive(Debug, Clone)]
pub struct AccountCredential {
    pub account_id: AccountId,
    pub account_name: Option<String>,
    pub member_id: AccountMemberId,
    pub token: SecretString,
    /// Unix timestamp (seconds) after which the token is rejected.
    pub expires_at: i64,
}

impl AccountCredential {
    /// Whether the token has expired at `now` (unix seconds).
    #[must_use]
    pub const fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

/// Account record with the processor customer linked to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    #[serde(default)]
    pub name: String,
    /// Payment processor customer used to store cards for reuse.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor_customer_id: Option<CustomerId>,
}

/// Saved address on an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountAddress {
    pub id: AddressId,
    #[serde(flatten)]
    pub address: Address,
}

// =============================================================================
// Order Types
// =============================================================================

/// Who the order is for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckoutCustomer {
    /// Anonymous shopper identified by email only.
    Guest { email: Email, name: String },
    /// Member checking out on behalf of an account.
    Account {
        account_id: AccountId,
        member_id: AccountMemberId,
        email: Email,
        name: String,
    },
}

impl CheckoutCustomer {
    /// Contact email for the order.
    #[must_use]
    pub const fn email(&self) -> &Email {
        match self {
            Self::Guest { email, .. } | Self::Account { email, .. } => email,
        }
    }
}

/// Cart-to-order conversion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub customer: CheckoutCustomer,
    pub shipping_address: Address,
    pub billing_address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purchase_order_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Contact recorded on an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OrderContact {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

/// A line of a placed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: CartItemKind,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    pub quantity: u32,
    pub unit_price: Money,
}

/// An order created from a cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub payment: OrderPaymentStatus,
    #[serde(default)]
    pub contact: OrderContact,
    pub shipping_address: Address,
    pub billing_address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<Money>,
    #[serde(default)]
    pub items: Vec<OrderItem>,
}

impl Order {
    /// Whether any line is a recurring subscription.
    #[must_use]
    pub fn has_subscription_items(&self) -> bool {
        self.items
            .iter()
            .any(|item| item.kind == CartItemKind::SubscriptionItem)
    }
}

// =============================================================================
// Payment Types
// =============================================================================

/// How the gateway should treat the payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentAction {
    /// Capture immediately.
    Purchase,
    /// Reserve funds / defer payment (manual and purchase-order payments).
    Authorize,
}

/// Gateway options attached to a payment request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PaymentOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer: Option<CustomerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<PaymentMethodId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_future_usage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_email: Option<String>,
}

/// Request to pay for an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub gateway: String,
    pub method: PaymentAction,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payment_method_types: Vec<String>,
    #[serde(default)]
    pub options: PaymentOptions,
}

/// A payment transaction recorded against an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    #[serde(default)]
    pub status: TransactionStatus,
    #[serde(default)]
    pub gateway: String,
    /// Secret the processor needs to finish the payment (3-D Secure/SCA).
    #[serde(default, skip_serializing)]
    pub client_secret: Option<String>,
}
