//! In-memory collaborators for tests.
//!
//! [`InMemoryCommerce`] behaves like the commerce platform for the operations the
//! checkout uses, records every call by method name and can be told to fail at
//! specific points. [`FakeProcessor`] and [`MemoryCheckoutStore`] stand in for the
//! payment processor and `PostgreSQL`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use composable_core::{
    AccountId, Address, AddressId, CartId, CartItemId, CheckoutId, CheckoutStage, CurrencyCode,
    CustomerId, Email, Money, OrderId, OrderPaymentStatus, PaymentMethodId, ShippingGroupId,
    TransactionId, TransactionStatus,
};

use crate::checkout::{CheckoutRecord, CheckoutStore, MANUAL_GATEWAY};
use crate::commerce::{
    Account, AccountAddress, AccountCredential, Cart, CartItem, CartItemKind, CartItemUpdate,
    CheckoutCustomer, CheckoutRequest, CommerceApi, CommerceError, CustomItemInput,
    NewShippingGroup, Order, OrderContact, OrderItem, PaymentRequest, ShippingGroup, Transaction,
};
use crate::db::RepositoryError;
use crate::payments::{PaymentProcessor, ProcessorError, ProcessorOutcome};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A point at which [`InMemoryCommerce`] rejects requests until cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailPoint {
    /// Updates to this cart item fail.
    UpdateItem(CartItemId),
    /// Cart checkout fails with the given detail.
    Checkout(String),
    /// Payment creation fails with the given detail.
    CreatePayment(String),
    /// Transaction confirmation fails.
    ConfirmPayment,
}

#[derive(Default)]
struct CommerceState {
    next_id: u64,
    carts: HashMap<CartId, Cart>,
    groups: HashMap<CartId, Vec<ShippingGroup>>,
    orders: HashMap<OrderId, Order>,
    transactions: HashMap<TransactionId, Transaction>,
    accounts: HashMap<AccountId, Account>,
    addresses: HashMap<(AccountId, AddressId), Address>,
    calls: Vec<String>,
    failures: Vec<FailPoint>,
    last_checkout: Option<(CheckoutRequest, Option<String>)>,
    last_payment: Option<PaymentRequest>,
}

impl CommerceState {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn cart_mut(&mut self, cart_id: &CartId) -> Result<&mut Cart, CommerceError> {
        self.carts
            .get_mut(cart_id)
            .ok_or_else(|| CommerceError::NotFound(format!("cart {cart_id}")))
    }

    fn fails(&self, point: &FailPoint) -> bool {
        self.failures.contains(point)
    }

    fn failing_detail(&self, matches: impl Fn(&FailPoint) -> Option<&String>) -> Option<String> {
        self.failures.iter().find_map(|p| matches(p).cloned())
    }
}

/// In-memory commerce platform.
#[derive(Default)]
pub struct InMemoryCommerce {
    state: Mutex<CommerceState>,
}

impl InMemoryCommerce {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CommerceState> {
        lock(&self.state)
    }

    fn record(&self, call: &str) -> MutexGuard<'_, CommerceState> {
        let mut state = self.state();
        state.calls.push(call.to_string());
        state
    }

    /// Create a cart of regular items given as `(id, quantity, unit amount)`.
    pub fn seed_cart(&self, items: &[(&str, u32, i64)]) -> CartId {
        let mut state = self.state();
        let cart_id = CartId::new(state.next("cart"));
        let items = items
            .iter()
            .map(|(id, quantity, amount)| CartItem {
                id: CartItemId::new(*id),
                kind: CartItemKind::CartItem,
                name: (*id).to_string(),
                sku: Some(id.to_uppercase()),
                quantity: *quantity,
                unit_price: Money::new(*amount, CurrencyCode::usd()),
                shipping_group_id: None,
            })
            .collect();
        state.carts.insert(
            cart_id.clone(),
            Cart {
                id: cart_id.clone(),
                name: "Cart".to_string(),
                items,
                total: None,
            },
        );
        cart_id
    }

    /// Add a single-quantity item of any kind.
    pub fn add_item(&self, cart_id: &CartId, id: &str, kind: CartItemKind, amount: i64) {
        if let Some(cart) = self.state().carts.get_mut(cart_id) {
            cart.items.push(CartItem {
                id: CartItemId::new(id),
                kind,
                name: id.to_string(),
                sku: Some(id.to_uppercase()),
                quantity: 1,
                unit_price: Money::new(amount, CurrencyCode::usd()),
                shipping_group_id: None,
            });
        }
    }

    pub fn set_item_sku(&self, cart_id: &CartId, id: &str, sku: &str) {
        let mut state = self.state();
        let item = state
            .carts
            .get_mut(cart_id)
            .and_then(|cart| cart.items.iter_mut().find(|i| i.id.as_str() == id));
        if let Some(item) = item {
            item.sku = Some(sku.to_string());
        }
    }

    /// Remove every item without recording a call.
    pub fn empty_cart(&self, cart_id: &CartId) {
        if let Some(cart) = self.state().carts.get_mut(cart_id) {
            cart.items.clear();
        }
    }

    pub fn seed_account(&self, account_id: &str, name: &str, customer: Option<&str>) {
        let id = AccountId::new(account_id);
        self.state().accounts.insert(
            id.clone(),
            Account {
                id,
                name: name.to_string(),
                processor_customer_id: customer.map(CustomerId::new),
            },
        );
    }

    pub fn seed_account_address(&self, account_id: &str, address_id: &str, address: Address) {
        self.state().addresses.insert(
            (AccountId::new(account_id), AddressId::new(address_id)),
            address,
        );
    }

    pub fn fail_on(&self, point: FailPoint) {
        self.state().failures.push(point);
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Current cart contents, without recording a call.
    #[must_use]
    pub fn cart(&self, cart_id: &CartId) -> Option<Cart> {
        self.state().carts.get(cart_id).cloned()
    }

    #[must_use]
    pub fn groups(&self, cart_id: &CartId) -> Vec<ShippingGroup> {
        self.state().groups.get(cart_id).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn order(&self, order_id: &OrderId) -> Option<Order> {
        self.state().orders.get(order_id).cloned()
    }

    /// Every call so far, by method name.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    #[must_use]
    pub fn calls_named(&self, name: &str) -> usize {
        self.state().calls.iter().filter(|c| *c == name).count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// The last checkout request with the member id it was authenticated as.
    #[must_use]
    pub fn last_checkout(&self) -> Option<(CheckoutRequest, Option<String>)> {
        self.state().last_checkout.clone()
    }

    #[must_use]
    pub fn last_payment(&self) -> Option<PaymentRequest> {
        self.state().last_payment.clone()
    }
}

fn with_total(mut cart: Cart) -> Cart {
    let currency = cart
        .items
        .first()
        .map_or_else(CurrencyCode::usd, |item| item.unit_price.currency.clone());
    let amount = cart.items.iter().map(|item| item.line_total().amount).sum();
    cart.total = Some(Money::new(amount, currency));
    cart
}

#[async_trait]
impl CommerceApi for InMemoryCommerce {
    async fn get_cart(&self, cart_id: &CartId) -> Result<Cart, CommerceError> {
        let mut state = self.record("get_cart");
        state.cart_mut(cart_id).map(|cart| with_total(cart.clone()))
    }

    async fn create_cart(&self, name: &str) -> Result<Cart, CommerceError> {
        let mut state = self.record("create_cart");
        let cart = Cart {
            id: CartId::new(state.next("cart")),
            name: name.to_string(),
            items: Vec::new(),
            total: None,
        };
        state.carts.insert(cart.id.clone(), cart.clone());
        Ok(cart)
    }

    async fn add_custom_item(
        &self,
        cart_id: &CartId,
        item: &CustomItemInput,
    ) -> Result<(), CommerceError> {
        let mut state = self.record("add_custom_item");
        let id = CartItemId::new(state.next("item"));
        state.cart_mut(cart_id)?.items.push(CartItem {
            id,
            kind: CartItemKind::CustomItem,
            name: item.name.clone(),
            sku: Some(item.sku.clone()),
            quantity: item.quantity,
            unit_price: Money::new(item.amount, CurrencyCode::usd()),
            shipping_group_id: None,
        });
        Ok(())
    }

    async fn remove_cart_item(
        &self,
        cart_id: &CartId,
        item_id: &CartItemId,
    ) -> Result<(), CommerceError> {
        let mut state = self.record("remove_cart_item");
        let cart = state.cart_mut(cart_id)?;
        let before = cart.items.len();
        cart.items.retain(|item| &item.id != item_id);
        if cart.items.len() == before {
            return Err(CommerceError::NotFound(format!("item {item_id}")));
        }
        Ok(())
    }

    async fn update_cart_item(
        &self,
        cart_id: &CartId,
        item_id: &CartItemId,
        update: &CartItemUpdate,
    ) -> Result<CartItem, CommerceError> {
        let mut state = self.record("update_cart_item");
        if state.fails(&FailPoint::UpdateItem(item_id.clone())) {
            return Err(CommerceError::api(422, "Item could not be updated"));
        }
        let item = state
            .cart_mut(cart_id)?
            .items
            .iter_mut()
            .find(|item| &item.id == item_id)
            .ok_or_else(|| CommerceError::NotFound(format!("item {item_id}")))?;
        item.quantity = update.quantity;
        item.shipping_group_id.clone_from(&update.shipping_group_id);
        Ok(item.clone())
    }

    async fn clear_cart(&self, cart_id: &CartId) -> Result<(), CommerceError> {
        let mut state = self.record("clear_cart");
        state.cart_mut(cart_id)?.items.clear();
        Ok(())
    }

    async fn list_shipping_groups(
        &self,
        cart_id: &CartId,
    ) -> Result<Vec<ShippingGroup>, CommerceError> {
        let state = self.record("list_shipping_groups");
        Ok(state.groups.get(cart_id).cloned().unwrap_or_default())
    }

    async fn create_shipping_group(
        &self,
        cart_id: &CartId,
        group: &NewShippingGroup,
    ) -> Result<ShippingGroup, CommerceError> {
        let mut state = self.record("create_shipping_group");
        state.cart_mut(cart_id)?;
        let group = ShippingGroup {
            id: ShippingGroupId::new(state.next("sg")),
            shipping_type: group.shipping_type.clone(),
            address: group.address.clone(),
            delivery_estimate: group.delivery_estimate.clone(),
            shipping_price: group.shipping_price.clone(),
        };
        state
            .groups
            .entry(cart_id.clone())
            .or_default()
            .push(group.clone());
        Ok(group)
    }

    async fn delete_shipping_group(
        &self,
        cart_id: &CartId,
        group_id: &ShippingGroupId,
    ) -> Result<(), CommerceError> {
        let mut state = self.record("delete_shipping_group");
        let groups = state.groups.entry(cart_id.clone()).or_default();
        let before = groups.len();
        groups.retain(|g| &g.id != group_id);
        if groups.len() == before {
            return Err(CommerceError::NotFound(format!("shipping group {group_id}")));
        }
        Ok(())
    }

    async fn checkout(
        &self,
        cart_id: &CartId,
        request: &CheckoutRequest,
        credential: Option<&AccountCredential>,
    ) -> Result<Order, CommerceError> {
        let mut state = self.record("checkout");
        if let Some(detail) = state.failing_detail(|p| match p {
            FailPoint::Checkout(detail) => Some(detail),
            _ => None,
        }) {
            return Err(CommerceError::api(400, detail));
        }
        if matches!(request.customer, CheckoutCustomer::Account { .. }) && credential.is_none() {
            return Err(CommerceError::Unauthorized);
        }

        let cart = with_total(state.cart_mut(cart_id)?.clone());
        if cart.items.is_empty() {
            return Err(CommerceError::api(400, "Cart is empty"));
        }

        let name = match &request.customer {
            CheckoutCustomer::Guest { name, .. } | CheckoutCustomer::Account { name, .. } => {
                name.clone()
            }
        };
        let order = Order {
            id: OrderId::new(state.next("order")),
            status: "incomplete".to_string(),
            payment: OrderPaymentStatus::Unpaid,
            contact: OrderContact {
                name,
                email: request.customer.email().to_string(),
            },
            shipping_address: request.shipping_address.clone(),
            billing_address: request.billing_address.clone(),
            total: cart.total.clone(),
            items: cart
                .items
                .iter()
                .map(|item| OrderItem {
                    id: item.id.to_string(),
                    kind: item.kind,
                    name: item.name.clone(),
                    sku: item.sku.clone(),
                    quantity: item.quantity,
                    unit_price: item.unit_price.clone(),
                })
                .collect(),
        };

        state.last_checkout = Some((
            request.clone(),
            credential.map(|c| c.member_id.to_string()),
        ));
        state.orders.insert(order.id.clone(), order.clone());
        Ok(order)
    }

    async fn get_order(&self, order_id: &OrderId) -> Result<Order, CommerceError> {
        let state = self.record("get_order");
        state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| CommerceError::NotFound(format!("order {order_id}")))
    }

    async fn create_payment(
        &self,
        order_id: &OrderId,
        request: &PaymentRequest,
    ) -> Result<Transaction, CommerceError> {
        let mut state = self.record("create_payment");
        if let Some(detail) = state.failing_detail(|p| match p {
            FailPoint::CreatePayment(detail) => Some(detail),
            _ => None,
        }) {
            return Err(CommerceError::api(400, detail));
        }
        if !state.orders.contains_key(order_id) {
            return Err(CommerceError::NotFound(format!("order {order_id}")));
        }

        let id = state.next("tx");
        let transaction = Transaction {
            id: TransactionId::new(id.clone()),
            status: TransactionStatus::Pending,
            gateway: request.gateway.clone(),
            client_secret: (request.gateway != MANUAL_GATEWAY)
                .then(|| format!("pi_{}_secret_test", id.replace('-', ""))),
        };
        if let Some(order) = state.orders.get_mut(order_id) {
            order.payment = if request.gateway == MANUAL_GATEWAY {
                OrderPaymentStatus::Authorized
            } else {
                OrderPaymentStatus::Unpaid
            };
        }
        state.last_payment = Some(request.clone());
        state
            .transactions
            .insert(transaction.id.clone(), transaction.clone());
        Ok(transaction)
    }

    async fn confirm_payment(
        &self,
        order_id: &OrderId,
        transaction_id: &TransactionId,
    ) -> Result<Transaction, CommerceError> {
        let mut state = self.record("confirm_payment");
        if state.fails(&FailPoint::ConfirmPayment) {
            return Err(CommerceError::api(409, "Transaction could not be confirmed"));
        }

        let transaction = state
            .transactions
            .get_mut(transaction_id)
            .ok_or_else(|| CommerceError::NotFound(format!("transaction {transaction_id}")))?;
        transaction.status = TransactionStatus::Complete;
        let transaction = transaction.clone();

        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| CommerceError::NotFound(format!("order {order_id}")))?;
        order.payment = OrderPaymentStatus::Paid;
        order.status = "complete".to_string();
        Ok(transaction)
    }

    async fn get_account(&self, credential: &AccountCredential) -> Result<Account, CommerceError> {
        let state = self.record("get_account");
        state
            .accounts
            .get(&credential.account_id)
            .cloned()
            .ok_or_else(|| CommerceError::NotFound(format!("account {}", credential.account_id)))
    }

    async fn get_account_address(
        &self,
        credential: &AccountCredential,
        address_id: &AddressId,
    ) -> Result<AccountAddress, CommerceError> {
        let state = self.record("get_account_address");
        state
            .addresses
            .get(&(credential.account_id.clone(), address_id.clone()))
            .cloned()
            .map(|address| AccountAddress {
                id: address_id.clone(),
                address,
            })
            .ok_or_else(|| CommerceError::NotFound(format!("address {address_id}")))
    }
}

#[derive(Debug, Clone, Default)]
enum ProcessorMode {
    #[default]
    Succeed,
    RequireAction(String),
    Fail(String),
}

#[derive(Debug, Default)]
struct ProcessorState {
    mode: ProcessorMode,
    next_id: u64,
    confirmations: usize,
    status_checks: usize,
    tokenised: Vec<String>,
    confirmed_with: Vec<Option<PaymentMethodId>>,
    attached: Vec<(PaymentMethodId, CustomerId)>,
}

impl ProcessorState {
    fn outcome(&self) -> Result<ProcessorOutcome, ProcessorError> {
        match &self.mode {
            ProcessorMode::Succeed => Ok(ProcessorOutcome::Succeeded),
            ProcessorMode::RequireAction(url) => Ok(ProcessorOutcome::RequiresAction {
                redirect_url: Some(url.clone()),
            }),
            ProcessorMode::Fail(message) => Err(ProcessorError::Api {
                status: 402,
                message: message.clone(),
            }),
        }
    }
}

/// Scriptable payment processor. Succeeds unless told otherwise.
#[derive(Debug, Default)]
pub struct FakeProcessor {
    state: Mutex<ProcessorState>,
}

impl FakeProcessor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn succeed(&self) {
        lock(&self.state).mode = ProcessorMode::Succeed;
    }

    pub fn require_action(&self, redirect_url: &str) {
        lock(&self.state).mode = ProcessorMode::RequireAction(redirect_url.to_string());
    }

    pub fn fail_with(&self, message: &str) {
        lock(&self.state).mode = ProcessorMode::Fail(message.to_string());
    }

    #[must_use]
    pub fn confirmations(&self) -> usize {
        lock(&self.state).confirmations
    }

    #[must_use]
    pub fn status_checks(&self) -> usize {
        lock(&self.state).status_checks
    }

    /// Card tokens turned into payment methods, in order.
    #[must_use]
    pub fn tokenised(&self) -> Vec<String> {
        lock(&self.state).tokenised.clone()
    }

    /// Payment method passed to each confirmation, in order.
    #[must_use]
    pub fn confirmed_with(&self) -> Vec<Option<PaymentMethodId>> {
        lock(&self.state).confirmed_with.clone()
    }

    #[must_use]
    pub fn attached(&self) -> Vec<(PaymentMethodId, CustomerId)> {
        lock(&self.state).attached.clone()
    }
}

#[async_trait]
impl PaymentProcessor for FakeProcessor {
    async fn create_payment_method(
        &self,
        card_token: &str,
        _billing: &Address,
        _email: &Email,
    ) -> Result<PaymentMethodId, ProcessorError> {
        let mut state = lock(&self.state);
        if state.tokenised.iter().any(|used| used == card_token) {
            return Err(ProcessorError::Api {
                status: 400,
                message: "Card token already used".to_string(),
            });
        }
        state.tokenised.push(card_token.to_string());
        state.next_id += 1;
        Ok(PaymentMethodId::new(format!("pm_test_{}", state.next_id)))
    }

    async fn attach_payment_method(
        &self,
        payment_method: &PaymentMethodId,
        customer: &CustomerId,
    ) -> Result<(), ProcessorError> {
        lock(&self.state)
            .attached
            .push((payment_method.clone(), customer.clone()));
        Ok(())
    }

    async fn confirm_payment(
        &self,
        _client_secret: &str,
        payment_method: Option<&PaymentMethodId>,
        _return_url: &str,
    ) -> Result<ProcessorOutcome, ProcessorError> {
        let mut state = lock(&self.state);
        state.confirmations += 1;
        state.confirmed_with.push(payment_method.cloned());
        state.outcome()
    }

    async fn payment_status(&self, _client_secret: &str) -> Result<ProcessorOutcome, ProcessorError> {
        // Suspend once so concurrent runners interleave as they would over the network.
        tokio::task::yield_now().await;
        let mut state = lock(&self.state);
        state.status_checks += 1;
        state.outcome()
    }
}

/// Checkout store backed by a map.
#[derive(Debug, Default)]
pub struct MemoryCheckoutStore {
    records: Mutex<HashMap<CheckoutId, CheckoutRecord>>,
}

impl MemoryCheckoutStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The single stored record, if exactly one exists.
    #[must_use]
    pub fn only(&self) -> Option<CheckoutRecord> {
        let records = lock(&self.records);
        if records.len() == 1 {
            records.values().next().cloned()
        } else {
            None
        }
    }
}

#[async_trait]
impl CheckoutStore for MemoryCheckoutStore {
    async fn insert(&self, record: &CheckoutRecord) -> Result<(), RepositoryError> {
        let mut records = lock(&self.records);
        if records.contains_key(&record.id) {
            return Err(RepositoryError::Conflict(format!(
                "checkout {} already exists",
                record.id
            )));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn update(&self, record: &CheckoutRecord) -> Result<(), RepositoryError> {
        let mut records = lock(&self.records);
        let stored = records.get_mut(&record.id).ok_or(RepositoryError::NotFound)?;
        if stored.version != record.version {
            return Err(RepositoryError::Conflict(format!(
                "checkout {} changed since version {}",
                record.id, record.version
            )));
        }
        *stored = CheckoutRecord {
            version: record.version + 1,
            ..record.clone()
        };
        Ok(())
    }

    async fn get(&self, id: CheckoutId) -> Result<Option<CheckoutRecord>, RepositoryError> {
        Ok(lock(&self.records).get(&id).cloned())
    }

    async fn list_stalled(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CheckoutRecord>, RepositoryError> {
        let mut stalled: Vec<_> = lock(&self.records)
            .values()
            .filter(|r| r.stage != CheckoutStage::Fulfilled && r.updated_at < older_than)
            .cloned()
            .collect();
        stalled.sort_by_key(|r| r.updated_at);
        stalled.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(stalled)
    }
}
