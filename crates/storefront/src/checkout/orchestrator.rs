//! Payment completion orchestrator.
//!
//! Drives a checkout run through its stages:
//!
//! ```text
//! Started --(shipping line, order)--> Created --(payment)--> Paid
//!     --(confirm transaction)--> Confirmed --(new cart)--> Fulfilled
//! ```
//!
//! The record is persisted after every transition and every step checks what it
//! already produced, so [`CheckoutOrchestrator::resume`] picks up where a run
//! stopped without creating a second order or payment. A run is claimed for the
//! duration of a drive; a second runner gets [`CheckoutError::InProgress`].

use std::sync::Arc;

use chrono::{Duration, Utc};
use thiserror::Error;
use tracing::{info, instrument, warn};

use composable_core::{
    CartId, CheckoutId, CheckoutStage, CurrencyCode, CustomerId, Money, PaymentMethodId,
    StageTransitionError,
};

use crate::commerce::{
    AccountCredential, Cart, CartCache, CheckoutCustomer, CheckoutRequest, CommerceApi,
    CommerceError, CustomItemInput,
};
use crate::db::RepositoryError;
use crate::payments::{PaymentProcessor, ProcessorError, ProcessorOutcome};
use crate::shipping::{DeliveryMethodResolver, DeliveryOption, DeliveryProgress};

use super::confirmation::OrderConfirmation;
use super::form::{CheckoutForm, CheckoutFormInput, FormError, Identity, PaymentMethodKind};
use super::payment::{build_payment_request, needs_processor_confirmation};
use super::store::{CheckoutRecord, CheckoutStore};
use super::{SHIPPING_ITEM_NAME, is_shipping_sku, shipping_sku};

/// Name given to carts issued after an order is placed.
const NEW_CART_NAME: &str = "Cart";

/// How long a claim on a run outlives a runner that died mid-drive.
const CLAIM_LEASE_SECS: i64 = 120;

/// Errors that can occur while running a checkout.
#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error(transparent)]
    Form(#[from] FormError),

    #[error("{count} cart items have no shipping group")]
    UnassignedItems { count: usize },

    #[error("unknown shipping method: {0}")]
    UnknownShippingMethod(String),

    #[error("cart is empty")]
    EmptyCart,

    #[error("commerce platform error: {0}")]
    Commerce(#[from] CommerceError),

    #[error("payment declined: {0}")]
    Declined(String),

    #[error("payment processor error: {0}")]
    Processor(#[from] ProcessorError),

    #[error("checkout belongs to another session")]
    SessionMismatch,

    #[error("checkout not found")]
    NotFound,

    #[error("checkout is being processed by another request")]
    InProgress,

    #[error("account credential required")]
    CredentialRequired,

    #[error("checkout record is missing {0}")]
    Incomplete(&'static str),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Stage(#[from] StageTransitionError),
}

impl CheckoutError {
    /// The message to show the shopper.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Form(e) => e.summary(),
            Self::UnassignedItems { count: 1 } => {
                "1 item still needs a delivery address".to_string()
            }
            Self::UnassignedItems { count } => {
                format!("{count} items still need a delivery address")
            }
            Self::UnknownShippingMethod(_) => {
                "The selected shipping method is no longer available".to_string()
            }
            Self::EmptyCart => "Your cart is empty".to_string(),
            Self::Commerce(e) => e.user_message(),
            Self::Declined(message) => message.clone(),
            Self::Processor(e) => e.user_message(),
            Self::SessionMismatch | Self::NotFound => "Checkout not found".to_string(),
            Self::InProgress => {
                "This checkout is already being processed, please wait a moment".to_string()
            }
            Self::CredentialRequired => "Please sign in to continue".to_string(),
            Self::Incomplete(_) | Self::Repository(_) | Self::Stage(_) => {
                "Checkout could not be completed, please try again".to_string()
            }
        }
    }
}

/// Checkout behaviour settings.
#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    /// Gateway used for card payments.
    pub default_gateway: String,
    /// Delivery method token that never adds a shipping line.
    pub standard_shipping: String,
    /// Log processor confirmation errors and continue instead of halting.
    pub continue_on_processor_error: bool,
    /// Where the processor sends the shopper after authentication.
    pub return_url: String,
}

/// Session data a checkout runs with.
#[derive(Debug, Clone)]
pub struct CheckoutContext {
    pub cart_id: CartId,
    pub credential: Option<AccountCredential>,
    /// Every shippable item must be in a shipping group.
    pub shipping_groups_enabled: bool,
}

/// Who is resuming a checkout.
#[derive(Debug, Clone)]
pub enum Caller {
    /// The shopper's browser session.
    Session {
        cart_id: CartId,
        credential: Option<AccountCredential>,
    },
    /// An operator recovering a stalled run. Has no account credential.
    Operator,
}

/// Result of driving a checkout.
#[derive(Debug, Clone)]
pub enum CheckoutOutcome {
    Completed(Box<OrderConfirmation>),
    /// The processor needs the shopper to authenticate; resume afterwards.
    ActionRequired {
        checkout_id: CheckoutId,
        redirect_url: Option<String>,
    },
}

enum Step {
    Advance(CheckoutStage),
    Pause { redirect_url: Option<String> },
}

/// Coordinates the commerce platform, the payment processor and the checkout store.
#[derive(Clone)]
pub struct CheckoutOrchestrator {
    commerce: Arc<dyn CommerceApi>,
    processor: Arc<dyn PaymentProcessor>,
    store: Arc<dyn CheckoutStore>,
    delivery: DeliveryMethodResolver,
    carts: CartCache,
    settings: CheckoutSettings,
}

impl CheckoutOrchestrator {
    #[must_use]
    pub fn new(
        commerce: Arc<dyn CommerceApi>,
        processor: Arc<dyn PaymentProcessor>,
        store: Arc<dyn CheckoutStore>,
        delivery: DeliveryMethodResolver,
        carts: CartCache,
        settings: CheckoutSettings,
    ) -> Self {
        Self {
            commerce,
            processor,
            store,
            delivery,
            carts,
            settings,
        }
    }

    #[must_use]
    pub const fn settings(&self) -> &CheckoutSettings {
        &self.settings
    }

    /// Validate a submitted form and run the checkout.
    ///
    /// Nothing is sent upstream when validation or the delivery gate fails.
    ///
    /// # Errors
    ///
    /// Returns the first step that failed. Failures after the record is created are
    /// also stored on the record.
    #[instrument(skip(self, context, input), fields(cart_id = %context.cart_id))]
    pub async fn run(
        &self,
        context: &CheckoutContext,
        input: CheckoutFormInput,
    ) -> Result<CheckoutOutcome, CheckoutError> {
        let form = input.validate(context.credential.is_some())?;

        let cart = self.commerce.get_cart(&context.cart_id).await?;
        if cart
            .items
            .iter()
            .all(|item| is_shipping_sku(item.sku.as_deref()))
        {
            return Err(CheckoutError::EmptyCart);
        }

        if context.shipping_groups_enabled {
            let progress = DeliveryProgress::from_items(&cart.items);
            if !progress.can_continue {
                return Err(CheckoutError::UnassignedItems {
                    count: progress.unassigned_items,
                });
            }
        }

        let shipping = self
            .resolve_shipping(&cart, &form.shipping_method)
            .await?;

        let record = CheckoutRecord::new(
            context.cart_id.clone(),
            context.credential.as_ref().map(|c| c.account_id.clone()),
            form,
            shipping,
        );
        self.store.insert(&record).await?;
        info!(checkout_id = %record.id, "Checkout started");

        self.drive(record, context.credential.as_ref()).await
    }

    /// Continue a checkout from its stored stage.
    ///
    /// A finished checkout returns its confirmation again.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError::NotFound`] for an unknown id and
    /// [`CheckoutError::SessionMismatch`] when the session does not own the run.
    #[instrument(skip(self, caller), fields(checkout_id = %checkout_id))]
    pub async fn resume(
        &self,
        checkout_id: CheckoutId,
        caller: Caller,
    ) -> Result<CheckoutOutcome, CheckoutError> {
        let record = self
            .store
            .get(checkout_id)
            .await?
            .ok_or(CheckoutError::NotFound)?;

        let credential = match caller {
            Caller::Session {
                cart_id,
                credential,
            } => {
                let owns_cart =
                    record.cart_id == cart_id || record.new_cart_id.as_ref() == Some(&cart_id);
                let same_account = record.account_id.as_ref()
                    == credential.as_ref().map(|c| &c.account_id)
                    || record.account_id.is_none();
                if !owns_cart || !same_account {
                    return Err(CheckoutError::SessionMismatch);
                }
                credential
            }
            Caller::Operator => None,
        };

        info!(stage = %record.stage, "Resuming checkout");
        match self.drive(record, credential.as_ref()).await {
            Err(CheckoutError::InProgress) => {
                // Another runner may have finished the run since it was loaded.
                let latest = self
                    .store
                    .get(checkout_id)
                    .await?
                    .ok_or(CheckoutError::NotFound)?;
                if latest.stage == CheckoutStage::Fulfilled {
                    let confirmation = self.confirmation(&latest).await?;
                    Ok(CheckoutOutcome::Completed(Box::new(confirmation)))
                } else {
                    Err(CheckoutError::InProgress)
                }
            }
            outcome => outcome,
        }
    }

    async fn resolve_shipping(
        &self,
        cart: &Cart,
        token: &str,
    ) -> Result<DeliveryOption, CheckoutError> {
        if let Some(option) = self.delivery.find(&cart.id, token).await {
            return Ok(option);
        }

        if token == self.settings.standard_shipping {
            let currency = cart
                .items
                .first()
                .map_or_else(CurrencyCode::usd, |item| item.unit_price.currency.clone());
            let formatted = Money::zero(currency.clone()).formatted();
            return Ok(DeliveryOption {
                label: "Standard shipping".to_string(),
                value: token.to_string(),
                amount: 0,
                currency,
                formatted,
                message: None,
                sort_order: 0,
            });
        }

        Err(CheckoutError::UnknownShippingMethod(token.to_string()))
    }

    async fn drive(
        &self,
        mut record: CheckoutRecord,
        credential: Option<&AccountCredential>,
    ) -> Result<CheckoutOutcome, CheckoutError> {
        if record.stage != CheckoutStage::Fulfilled {
            self.claim(&mut record).await?;
        }

        loop {
            let step = match record.stage {
                CheckoutStage::Started => self.create_order(&mut record, credential).await,
                CheckoutStage::Created => self.take_payment(&mut record, credential).await,
                CheckoutStage::Paid => self.confirm_order(&record).await,
                CheckoutStage::Confirmed => self.replace_cart(&mut record).await,
                CheckoutStage::Fulfilled => {
                    let confirmation = self.confirmation(&record).await?;
                    return Ok(CheckoutOutcome::Completed(Box::new(confirmation)));
                }
            };

            match step {
                Ok(Step::Advance(next)) => {
                    record.stage = record.stage.advance_to(next)?;
                    record.awaiting_action = false;
                    record.last_error = None;
                    if record.stage == CheckoutStage::Fulfilled {
                        record.claimed_until = None;
                    }
                    self.save(&mut record).await?;
                    info!(checkout_id = %record.id, stage = %record.stage, "Checkout advanced");
                }
                Ok(Step::Pause { redirect_url }) => {
                    record.awaiting_action = true;
                    record.last_error = None;
                    record.claimed_until = None;
                    self.save(&mut record).await?;
                    info!(checkout_id = %record.id, "Checkout awaiting shopper action");
                    return Ok(CheckoutOutcome::ActionRequired {
                        checkout_id: record.id,
                        redirect_url,
                    });
                }
                Err(CheckoutError::InProgress) => {
                    warn!(checkout_id = %record.id, "Checkout claimed by another runner, stopping");
                    return Err(CheckoutError::InProgress);
                }
                Err(e) => {
                    warn!(checkout_id = %record.id, stage = %record.stage, error = %e, "Checkout step failed");
                    record.last_error = Some(e.to_string());
                    record.claimed_until = None;
                    if let Err(save_error) = self.save(&mut record).await {
                        warn!(checkout_id = %record.id, "Failed to record checkout error: {save_error}");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Take the run for this runner.
    async fn claim(&self, record: &mut CheckoutRecord) -> Result<(), CheckoutError> {
        let now = Utc::now();
        if record.is_claimed(now) {
            return Err(CheckoutError::InProgress);
        }
        record.claimed_until = Some(now + Duration::seconds(CLAIM_LEASE_SECS));
        self.save(record).await
    }

    /// Compare-and-set write. Losing the race means another runner owns the run.
    async fn save(&self, record: &mut CheckoutRecord) -> Result<(), CheckoutError> {
        record.updated_at = Utc::now();
        match self.store.update(record).await {
            Ok(()) => {
                record.version += 1;
                Ok(())
            }
            Err(RepositoryError::Conflict(_)) => Err(CheckoutError::InProgress),
            Err(e) => Err(e.into()),
        }
    }

    /// Started -> Created.
    #[instrument(skip_all, fields(checkout_id = %record.id))]
    async fn create_order(
        &self,
        record: &mut CheckoutRecord,
        credential: Option<&AccountCredential>,
    ) -> Result<Step, CheckoutError> {
        self.materialize_shipping(record).await?;

        let customer = checkout_customer(&record.form, credential)?;
        let request = CheckoutRequest {
            customer,
            shipping_address: record.form.shipping_address.clone(),
            billing_address: record.form.effective_billing_address().clone(),
            purchase_order_number: record.form.purchase_order_number.clone(),
            quote_id: record.form.quote_id.clone(),
            notes: record.form.notes.clone(),
        };
        let account_credential = credential.filter(|_| record.form.identity.is_account());

        let order = self
            .commerce
            .checkout(&record.cart_id, &request, account_credential)
            .await?;
        self.carts.invalidate(&record.cart_id).await;

        info!(order_id = %order.id, "Order created");
        record.subscription_order = order.has_subscription_items();
        record.order_id = Some(order.id);
        Ok(Step::Advance(CheckoutStage::Created))
    }

    /// Make the cart carry exactly the shipping line for the chosen method.
    async fn materialize_shipping(&self, record: &CheckoutRecord) -> Result<(), CheckoutError> {
        let cart = self.commerce.get_cart(&record.cart_id).await?;
        let wanted = (record.shipping.value != self.settings.standard_shipping)
            .then(|| shipping_sku(&record.shipping.value));

        let mut present = false;
        for item in cart
            .items
            .iter()
            .filter(|item| is_shipping_sku(item.sku.as_deref()))
        {
            let current = wanted.is_some()
                && item.sku == wanted
                && item.quantity == 1
                && item.unit_price.amount == record.shipping.amount
                && !present;
            if current {
                present = true;
            } else {
                self.commerce
                    .remove_cart_item(&record.cart_id, &item.id)
                    .await?;
            }
        }

        if let (Some(sku), false) = (wanted, present) {
            let item = CustomItemInput {
                name: SHIPPING_ITEM_NAME.to_string(),
                sku,
                quantity: 1,
                amount: record.shipping.amount,
                description: Some(record.shipping.label.clone()),
            };
            self.commerce
                .add_custom_item(&record.cart_id, &item)
                .await?;
        }

        self.carts.invalidate(&record.cart_id).await;
        Ok(())
    }

    /// Created -> Paid, or a pause while the shopper authenticates.
    #[instrument(skip_all, fields(checkout_id = %record.id))]
    async fn take_payment(
        &self,
        record: &mut CheckoutRecord,
        credential: Option<&AccountCredential>,
    ) -> Result<Step, CheckoutError> {
        let order_id = record
            .order_id
            .clone()
            .ok_or(CheckoutError::Incomplete("order id"))?;

        if record.transaction_id.is_none() {
            let customer = self.processor_customer(record, credential).await?;
            if let Some(payment_method) = self.tokenise_card(record).await? {
                record.payment_method = Some(payment_method.clone());
                self.save(record).await?;
                if let Some(customer) = &customer {
                    self.processor
                        .attach_payment_method(&payment_method, customer)
                        .await?;
                }
            }

            let request = build_payment_request(
                &record.form,
                &self.settings.default_gateway,
                customer.as_ref(),
                record.payment_method.as_ref(),
            );

            let transaction = self.commerce.create_payment(&order_id, &request).await?;
            info!(transaction_id = %transaction.id, gateway = %transaction.gateway, "Payment created");

            if transaction.status.is_declined() {
                return Err(CheckoutError::Declined(
                    "Your payment was declined".to_string(),
                ));
            }

            let needs_confirmation =
                needs_processor_confirmation(&record.form, &transaction, record.subscription_order);
            record.transaction_id = Some(transaction.id);
            record.client_secret = transaction.client_secret.filter(|_| needs_confirmation);
            self.save(record).await?;
        }

        let Some(client_secret) = record.client_secret.clone() else {
            return Ok(Step::Advance(CheckoutStage::Paid));
        };

        let outcome = if record.awaiting_action {
            self.processor.payment_status(&client_secret).await
        } else {
            let return_url = format!("{}?checkout={}", self.settings.return_url, record.id);
            let payment_method = record
                .form
                .saved_card_id
                .as_ref()
                .or(record.payment_method.as_ref());
            self.processor
                .confirm_payment(&client_secret, payment_method, &return_url)
                .await
        };

        match outcome {
            Ok(ProcessorOutcome::Succeeded | ProcessorOutcome::Processing) => {
                record.client_secret = None;
                Ok(Step::Advance(CheckoutStage::Paid))
            }
            Ok(ProcessorOutcome::RequiresAction { redirect_url }) => Ok(Step::Pause { redirect_url }),
            Ok(ProcessorOutcome::Failed { message }) => {
                self.processor_failure(record, CheckoutError::Declined(message))
            }
            Err(e) => self.processor_failure(record, CheckoutError::Processor(e)),
        }
    }

    fn processor_failure(
        &self,
        record: &mut CheckoutRecord,
        error: CheckoutError,
    ) -> Result<Step, CheckoutError> {
        if self.settings.continue_on_processor_error {
            warn!(
                checkout_id = %record.id,
                error = %error,
                "Processor confirmation failed, continuing"
            );
            record.client_secret = None;
            Ok(Step::Advance(CheckoutStage::Paid))
        } else {
            Err(error)
        }
    }

    /// Processor customer of the signed-in account paying by card, if it has one.
    async fn processor_customer(
        &self,
        record: &CheckoutRecord,
        credential: Option<&AccountCredential>,
    ) -> Result<Option<CustomerId>, CheckoutError> {
        let form = &record.form;
        if form.payment_method != PaymentMethodKind::EpPayment {
            return Ok(None);
        }
        let Some(credential) = credential.filter(|_| form.identity.is_account()) else {
            return Ok(None);
        };

        let account = self.commerce.get_account(credential).await?;
        Ok(account.processor_customer_id)
    }

    /// Turn the submitted card token into a payment method. Card tokens are single
    /// use, so a run tokenises at most once.
    async fn tokenise_card(
        &self,
        record: &CheckoutRecord,
    ) -> Result<Option<PaymentMethodId>, CheckoutError> {
        let form = &record.form;
        let card_token = match (&form.saved_card_id, &form.card_token) {
            (None, Some(card_token))
                if form.payment_method == PaymentMethodKind::EpPayment
                    && record.payment_method.is_none() =>
            {
                card_token
            }
            _ => return Ok(None),
        };

        let payment_method = self
            .processor
            .create_payment_method(
                card_token,
                form.effective_billing_address(),
                form.identity.email(),
            )
            .await?;
        info!(payment_method = %payment_method, "Card tokenised");
        Ok(Some(payment_method))
    }

    /// Paid -> Confirmed.
    #[instrument(skip_all, fields(checkout_id = %record.id))]
    async fn confirm_order(&self, record: &CheckoutRecord) -> Result<Step, CheckoutError> {
        let order_id = record
            .order_id
            .as_ref()
            .ok_or(CheckoutError::Incomplete("order id"))?;
        let transaction_id = record
            .transaction_id
            .as_ref()
            .ok_or(CheckoutError::Incomplete("transaction id"))?;

        self.commerce
            .confirm_payment(order_id, transaction_id)
            .await?;
        info!(order_id = %order_id, "Order confirmed");
        Ok(Step::Advance(CheckoutStage::Confirmed))
    }

    /// Confirmed -> Fulfilled.
    #[instrument(skip_all, fields(checkout_id = %record.id))]
    async fn replace_cart(&self, record: &mut CheckoutRecord) -> Result<Step, CheckoutError> {
        if record.cart_snapshot.is_none() {
            record.cart_snapshot = Some(self.commerce.get_cart(&record.cart_id).await?);
            self.save(record).await?;
        }

        self.commerce.clear_cart(&record.cart_id).await?;

        if record.new_cart_id.is_none() {
            let cart = self.commerce.create_cart(NEW_CART_NAME).await?;
            info!(new_cart_id = %cart.id, "Issued new cart");
            record.new_cart_id = Some(cart.id);
        }

        self.carts.invalidate_all();
        Ok(Step::Advance(CheckoutStage::Fulfilled))
    }

    async fn confirmation(&self, record: &CheckoutRecord) -> Result<OrderConfirmation, CheckoutError> {
        let order_id = record
            .order_id
            .as_ref()
            .ok_or(CheckoutError::Incomplete("order id"))?;
        let new_cart_id = record
            .new_cart_id
            .clone()
            .ok_or(CheckoutError::Incomplete("new cart id"))?;
        let order = self.commerce.get_order(order_id).await?;

        Ok(OrderConfirmation {
            checkout_id: record.id,
            order,
            transaction_id: record.transaction_id.clone(),
            payment_method: record.form.payment_method,
            shipping: record.shipping.clone(),
            cart: record.cart_snapshot.clone(),
            new_cart_id,
        })
    }
}

impl std::fmt::Debug for CheckoutOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckoutOrchestrator")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn checkout_customer(
    form: &CheckoutForm,
    credential: Option<&AccountCredential>,
) -> Result<CheckoutCustomer, CheckoutError> {
    match &form.identity {
        Identity::Guest { email } => Ok(CheckoutCustomer::Guest {
            email: email.clone(),
            name: form.contact_name(),
        }),
        Identity::Account { email, name } => {
            let credential = credential.ok_or(CheckoutError::CredentialRequired)?;
            Ok(CheckoutCustomer::Account {
                account_id: credential.account_id.clone(),
                member_id: credential.member_id.clone(),
                email: email.clone(),
                name: name.clone(),
            })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use composable_core::{AccountId, AccountMemberId, Address, Email};
    use secrecy::SecretString;

    use super::*;
    use crate::checkout::form::IdentityInput;
    use crate::commerce::{CartItemKind, PaymentAction};
    use crate::shipping::StaticRateSource;
    use crate::testing::{FailPoint, FakeProcessor, InMemoryCommerce, MemoryCheckoutStore};

    struct Harness {
        commerce: Arc<InMemoryCommerce>,
        processor: Arc<FakeProcessor>,
        store: Arc<MemoryCheckoutStore>,
        orchestrator: CheckoutOrchestrator,
        cart_id: CartId,
    }

    fn settings(continue_on_processor_error: bool) -> CheckoutSettings {
        CheckoutSettings {
            default_gateway: "elastic_path_payments_stripe".into(),
            standard_shipping: "standard".into(),
            continue_on_processor_error,
            return_url: "https://shop.test/checkout/confirmation".into(),
        }
    }

    fn harness_with(settings: CheckoutSettings) -> Harness {
        let commerce = Arc::new(InMemoryCommerce::new());
        let processor = Arc::new(FakeProcessor::new());
        let store = Arc::new(MemoryCheckoutStore::new());
        let cart_id = commerce.seed_cart(&[("i1", 2, 1000), ("i2", 1, 500)]);
        let orchestrator = CheckoutOrchestrator::new(
            commerce.clone(),
            processor.clone(),
            store.clone(),
            DeliveryMethodResolver::new(Arc::new(StaticRateSource), CurrencyCode::usd()),
            CartCache::new(),
            settings,
        );
        Harness {
            commerce,
            processor,
            store,
            orchestrator,
            cart_id,
        }
    }

    fn harness() -> Harness {
        harness_with(settings(false))
    }

    fn address() -> Address {
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

    fn guest_form(shipping_method: &str) -> CheckoutFormInput {
        let mut input = CheckoutFormInput::defaults(None, "standard");
        input.identity = IdentityInput::Guest {
            email: "ada@example.com".into(),
        };
        input.shipping_address = address();
        input.shipping_method = shipping_method.into();
        input
    }

    fn guest(h: &Harness) -> CheckoutContext {
        CheckoutContext {
            cart_id: h.cart_id.clone(),
            credential: None,
            shipping_groups_enabled: false,
        }
    }

    fn credential() -> AccountCredential {
        AccountCredential {
            account_id: AccountId::new("acc-1"),
            account_name: Some("Analytical Engines".into()),
            member_id: AccountMemberId::new("mem-1"),
            token: SecretString::from("token"),
            expires_at: i64::MAX,
        }
    }

    fn completed(outcome: CheckoutOutcome) -> OrderConfirmation {
        match outcome {
            CheckoutOutcome::Completed(confirmation) => *confirmation,
            CheckoutOutcome::ActionRequired { .. } => panic!("checkout paused"),
        }
    }

    #[tokio::test]
    async fn test_guest_standard_checkout_completes() {
        let h = harness();
        let outcome = h
            .orchestrator
            .run(&guest(&h), guest_form("standard"))
            .await
            .unwrap();
        let confirmation = completed(outcome);

        assert_eq!(confirmation.order.contact.email, "ada@example.com");
        assert!(
            confirmation
                .order
                .items
                .iter()
                .all(|i| i.kind != CartItemKind::CustomItem)
        );
        assert_ne!(confirmation.new_cart_id, h.cart_id);
        assert!(h.commerce.cart(&h.cart_id).unwrap().items.is_empty());
        assert!(h.commerce.cart(&confirmation.new_cart_id).is_some());
        assert_eq!(confirmation.cart.unwrap().items.len(), 2);

        let calls = h.commerce.calls();
        let order = ["checkout", "create_payment", "confirm_payment", "clear_cart", "create_cart"];
        let positions: Vec<_> = order
            .iter()
            .map(|name| calls.iter().position(|c| c == name).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(h.processor.confirmations(), 1);

        let record = h.store.get(confirmation.checkout_id).await.unwrap().unwrap();
        assert_eq!(record.stage, CheckoutStage::Fulfilled);
        assert!(record.last_error.is_none());
        assert!(record.client_secret.is_none());
    }

    #[tokio::test]
    async fn test_non_standard_method_adds_one_shipping_line() {
        let h = harness();
        let confirmation = completed(
            h.orchestrator
                .run(&guest(&h), guest_form("express"))
                .await
                .unwrap(),
        );

        let shipping: Vec<_> = confirmation
            .order
            .items
            .iter()
            .filter(|i| i.kind == CartItemKind::CustomItem)
            .collect();
        assert_eq!(shipping.len(), 1);
        assert_eq!(shipping[0].name, "Shipping");
        assert_eq!(shipping[0].unit_price.amount, 1200);
        assert_eq!(shipping[0].sku.as_deref(), Some("__shipping_express"));
    }

    #[tokio::test]
    async fn test_stale_shipping_line_replaced() {
        let h = harness();
        h.commerce.add_item(&h.cart_id, "old-ship", CartItemKind::CustomItem, 999);
        h.commerce.set_item_sku(&h.cart_id, "old-ship", "__shipping_overnight");

        let confirmation = completed(
            h.orchestrator
                .run(&guest(&h), guest_form("standard"))
                .await
                .unwrap(),
        );
        assert!(
            confirmation
                .order
                .items
                .iter()
                .all(|i| i.kind != CartItemKind::CustomItem)
        );
    }

    #[tokio::test]
    async fn test_account_checkout_with_saved_customer() {
        let h = harness();
        h.commerce.seed_account("acc-1", "Analytical Engines", Some("cus_1"));
        let mut input = guest_form("express");
        input.identity = IdentityInput::Account {
            email: "ada@example.com".into(),
            name: "Ada Lovelace".into(),
        };
        input.card_token = Some("tok_visa".into());
        let context = CheckoutContext {
            credential: Some(credential()),
            ..guest(&h)
        };

        completed(h.orchestrator.run(&context, input).await.unwrap());

        let (request, member) = h.commerce.last_checkout().unwrap();
        assert!(matches!(request.customer, CheckoutCustomer::Account { .. }));
        assert_eq!(member.as_deref(), Some("mem-1"));

        let payment = h.commerce.last_payment().unwrap();
        assert_eq!(payment.method, PaymentAction::Purchase);
        assert_eq!(payment.options.customer, Some(CustomerId::new("cus_1")));
        assert_eq!(
            payment.options.setup_future_usage.as_deref(),
            Some("off_session")
        );
        let pm = payment.options.payment_method.unwrap();
        assert_eq!(h.processor.attached(), vec![(pm, CustomerId::new("cus_1"))]);
    }

    #[tokio::test]
    async fn test_guest_card_reaches_payment_and_processor() {
        let h = harness();
        let mut input = guest_form("standard");
        input.card_token = Some("tok_visa".into());

        completed(h.orchestrator.run(&guest(&h), input).await.unwrap());

        assert_eq!(h.processor.tokenised(), ["tok_visa"]);
        let payment = h.commerce.last_payment().unwrap();
        let pm = payment.options.payment_method.unwrap();
        assert!(payment.options.customer.is_none());
        assert!(payment.options.setup_future_usage.is_none());
        assert_eq!(h.processor.confirmed_with(), vec![Some(pm)]);
        assert!(h.processor.attached().is_empty());
    }

    #[tokio::test]
    async fn test_account_without_customer_still_charges_card() {
        let h = harness();
        h.commerce.seed_account("acc-1", "Analytical Engines", None);
        let mut input = guest_form("standard");
        input.identity = IdentityInput::Account {
            email: "ada@example.com".into(),
            name: "Ada Lovelace".into(),
        };
        input.card_token = Some("tok_visa".into());
        let context = CheckoutContext {
            credential: Some(credential()),
            ..guest(&h)
        };

        completed(h.orchestrator.run(&context, input).await.unwrap());

        let payment = h.commerce.last_payment().unwrap();
        assert!(payment.options.customer.is_none());
        assert!(payment.options.payment_method.is_some());
        assert!(h.processor.attached().is_empty());
        assert!(h.processor.confirmed_with()[0].is_some());
    }

    #[tokio::test]
    async fn test_card_tokenised_once_across_retries() {
        let h = harness();
        h.commerce.fail_on(FailPoint::CreatePayment("Gateway timeout".into()));
        let mut input = guest_form("standard");
        input.card_token = Some("tok_visa".into());

        h.orchestrator.run(&guest(&h), input).await.unwrap_err();
        let record = h.store.only().unwrap();
        assert!(record.payment_method.is_some());

        h.commerce.clear_failures();
        completed(
            h.orchestrator
                .resume(record.id, Caller::Operator)
                .await
                .unwrap(),
        );
        assert_eq!(h.processor.tokenised().len(), 1);
        assert_eq!(
            h.commerce.last_payment().unwrap().options.payment_method,
            record.payment_method
        );
    }

    #[tokio::test]
    async fn test_identity_must_match_session() {
        let h = harness();
        let context = CheckoutContext {
            credential: Some(credential()),
            ..guest(&h)
        };
        let err = h
            .orchestrator
            .run(&context, guest_form("standard"))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::Form(_)));
        assert!(h.commerce.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unassigned_items_block_checkout() {
        let h = harness();
        let context = CheckoutContext {
            shipping_groups_enabled: true,
            ..guest(&h)
        };
        let err = h
            .orchestrator
            .run(&context, guest_form("standard"))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::UnassignedItems { count: 2 }));
        assert_eq!(err.user_message(), "2 items still need a delivery address");
        assert_eq!(h.commerce.calls_named("checkout"), 0);
    }

    #[tokio::test]
    async fn test_unknown_shipping_method() {
        let h = harness();
        let err = h
            .orchestrator
            .run(&guest(&h), guest_form("teleport"))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::UnknownShippingMethod(_)));
        assert_eq!(h.commerce.calls_named("checkout"), 0);
    }

    #[tokio::test]
    async fn test_declined_payment_stops_before_confirmation() {
        let h = harness();
        h.commerce.fail_on(FailPoint::CreatePayment("Card declined".into()));

        let err = h
            .orchestrator
            .run(&guest(&h), guest_form("standard"))
            .await
            .unwrap_err();
        assert!(err.user_message().contains("Card declined"));
        assert_eq!(h.commerce.calls_named("confirm_payment"), 0);
        assert_eq!(h.commerce.calls_named("clear_cart"), 0);

        let record = h.store.only().unwrap();
        assert_eq!(record.stage, CheckoutStage::Created);
        assert!(record.order_id.is_some());
        assert!(record.last_error.unwrap().contains("Card declined"));
    }

    #[tokio::test]
    async fn test_processor_error_halts_by_default() {
        let h = harness();
        h.processor.fail_with("card_error");

        let err = h
            .orchestrator
            .run(&guest(&h), guest_form("standard"))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::Processor(_)));
        assert_eq!(h.commerce.calls_named("confirm_payment"), 0);
        assert_eq!(h.store.only().unwrap().stage, CheckoutStage::Created);
    }

    #[tokio::test]
    async fn test_processor_error_continues_when_enabled() {
        let h = harness_with(settings(true));
        h.processor.fail_with("card_error");

        completed(
            h.orchestrator
                .run(&guest(&h), guest_form("standard"))
                .await
                .unwrap(),
        );
        assert_eq!(h.commerce.calls_named("confirm_payment"), 1);
    }

    #[tokio::test]
    async fn test_manual_payment_skips_processor() {
        let h = harness();
        let mut input = guest_form("standard");
        input.payment_method = PaymentMethodKind::Manual;
        input.purchase_order_number = Some("PO-42".into());

        completed(h.orchestrator.run(&guest(&h), input).await.unwrap());

        let payment = h.commerce.last_payment().unwrap();
        assert_eq!(payment.gateway, "manual");
        assert_eq!(payment.method, PaymentAction::Authorize);
        let (request, _) = h.commerce.last_checkout().unwrap();
        assert_eq!(request.purchase_order_number.as_deref(), Some("PO-42"));
        assert_eq!(h.processor.confirmations(), 0);
    }

    #[tokio::test]
    async fn test_subscription_orders_skip_processor() {
        let h = harness();
        h.commerce.add_item(&h.cart_id, "sub-1", CartItemKind::SubscriptionItem, 900);

        completed(
            h.orchestrator
                .run(&guest(&h), guest_form("standard"))
                .await
                .unwrap(),
        );
        assert_eq!(h.processor.confirmations(), 0);
        assert_eq!(h.commerce.calls_named("confirm_payment"), 1);
    }

    #[tokio::test]
    async fn test_requires_action_pauses_then_resumes() {
        let h = harness();
        h.processor.require_action("https://bank.test/3ds");

        let outcome = h
            .orchestrator
            .run(&guest(&h), guest_form("express"))
            .await
            .unwrap();
        let CheckoutOutcome::ActionRequired {
            checkout_id,
            redirect_url,
        } = outcome
        else {
            panic!("expected pause");
        };
        assert_eq!(redirect_url.as_deref(), Some("https://bank.test/3ds"));
        let record = h.store.get(checkout_id).await.unwrap().unwrap();
        assert_eq!(record.stage, CheckoutStage::Created);
        assert!(record.awaiting_action);

        h.processor.succeed();
        let caller = Caller::Session {
            cart_id: h.cart_id.clone(),
            credential: None,
        };
        completed(h.orchestrator.resume(checkout_id, caller).await.unwrap());

        assert_eq!(h.commerce.calls_named("checkout"), 1);
        assert_eq!(h.commerce.calls_named("create_payment"), 1);
        assert_eq!(h.commerce.calls_named("add_custom_item"), 1);
        assert_eq!(h.processor.status_checks(), 1);
    }

    #[tokio::test]
    async fn test_resume_after_failure_does_not_recreate_order() {
        let h = harness();
        h.commerce.fail_on(FailPoint::ConfirmPayment);

        let err = h
            .orchestrator
            .run(&guest(&h), guest_form("standard"))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::Commerce(_)));
        let record = h.store.only().unwrap();
        assert_eq!(record.stage, CheckoutStage::Paid);

        h.commerce.clear_failures();
        let confirmation = completed(
            h.orchestrator
                .resume(record.id, Caller::Operator)
                .await
                .unwrap(),
        );
        assert_eq!(Some(&confirmation.order.id), record.order_id.as_ref());
        assert_eq!(h.commerce.calls_named("checkout"), 1);
        assert_eq!(h.commerce.calls_named("create_payment"), 1);

        let again = completed(
            h.orchestrator
                .resume(record.id, Caller::Operator)
                .await
                .unwrap(),
        );
        assert_eq!(again.new_cart_id, confirmation.new_cart_id);
        assert_eq!(h.commerce.calls_named("create_cart"), 1);
    }

    #[tokio::test]
    async fn test_overlapping_resumes_complete_once() {
        let h = harness();
        h.processor.require_action("https://bank.test/3ds");
        let outcome = h
            .orchestrator
            .run(&guest(&h), guest_form("standard"))
            .await
            .unwrap();
        let CheckoutOutcome::ActionRequired { checkout_id, .. } = outcome else {
            panic!("expected pause");
        };
        h.processor.succeed();

        let (first, second) = tokio::join!(
            h.orchestrator.resume(checkout_id, Caller::Operator),
            h.orchestrator.resume(checkout_id, Caller::Operator),
        );

        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(CheckoutError::InProgress)))
        );
        assert_eq!(h.processor.status_checks(), 1);
        assert_eq!(h.commerce.calls_named("confirm_payment"), 1);
        assert_eq!(h.commerce.calls_named("create_cart"), 1);

        let record = h.store.get(checkout_id).await.unwrap().unwrap();
        assert_eq!(record.stage, CheckoutStage::Fulfilled);
        assert!(record.claimed_until.is_none());
    }

    #[tokio::test]
    async fn test_stale_runner_stops_without_side_effects() {
        let h = harness();
        h.commerce.fail_on(FailPoint::ConfirmPayment);
        h.orchestrator
            .run(&guest(&h), guest_form("standard"))
            .await
            .unwrap_err();
        let stale = h.store.only().unwrap();
        h.commerce.clear_failures();

        completed(
            h.orchestrator
                .resume(stale.id, Caller::Operator)
                .await
                .unwrap(),
        );

        let err = h.store.update(&stale).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        h.commerce.clear_calls();
        let err = h.orchestrator.drive(stale, None).await.unwrap_err();
        assert!(matches!(err, CheckoutError::InProgress));
        assert!(h.commerce.calls().is_empty());
        assert_eq!(
            h.store.only().unwrap().stage,
            CheckoutStage::Fulfilled
        );
    }

    #[tokio::test]
    async fn test_expired_claim_can_be_taken_over() {
        let h = harness();
        h.commerce.fail_on(FailPoint::ConfirmPayment);
        h.orchestrator
            .run(&guest(&h), guest_form("standard"))
            .await
            .unwrap_err();
        h.commerce.clear_failures();
        h.commerce.clear_calls();

        let mut record = h.store.only().unwrap();
        record.claimed_until = Some(Utc::now() + Duration::minutes(5));
        h.store.update(&record).await.unwrap();
        let err = h
            .orchestrator
            .resume(record.id, Caller::Operator)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::InProgress));
        assert_eq!(h.commerce.calls_named("confirm_payment"), 0);

        let mut record = h.store.only().unwrap();
        record.claimed_until = Some(Utc::now() - Duration::minutes(1));
        h.store.update(&record).await.unwrap();
        completed(
            h.orchestrator
                .resume(record.id, Caller::Operator)
                .await
                .unwrap(),
        );
    }

    #[tokio::test]
    async fn test_resume_checks_session() {
        let h = harness();
        h.commerce.fail_on(FailPoint::ConfirmPayment);
        let _ = h.orchestrator.run(&guest(&h), guest_form("standard")).await;
        let record = h.store.only().unwrap();

        let stranger = Caller::Session {
            cart_id: CartId::new("someone-else"),
            credential: None,
        };
        let err = h.orchestrator.resume(record.id, stranger).await.unwrap_err();
        assert!(matches!(err, CheckoutError::SessionMismatch));

        let err = h
            .orchestrator
            .resume(CheckoutId::generate(), Caller::Operator)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::NotFound));
    }

    #[tokio::test]
    async fn test_operator_cannot_create_account_order() {
        let h = harness();
        let record = CheckoutRecord::new(
            h.cart_id.clone(),
            Some(AccountId::new("acc-1")),
            guest_form("standard")
                .validate(false)
                .map(|mut form| {
                    form.identity = Identity::Account {
                        email: Email::parse("ada@example.com").unwrap(),
                        name: "Ada".into(),
                    };
                    form
                })
                .unwrap(),
            h.orchestrator
                .resolve_shipping(&h.commerce.cart(&h.cart_id).unwrap(), "standard")
                .await
                .unwrap(),
        );
        h.store.insert(&record).await.unwrap();

        let err = h
            .orchestrator
            .resume(record.id, Caller::Operator)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::CredentialRequired));
        assert_eq!(h.commerce.calls_named("checkout"), 0);
    }

    #[tokio::test]
    async fn test_empty_cart_rejected() {
        let h = harness();
        h.commerce.empty_cart(&h.cart_id);
        let err = h
            .orchestrator
            .run(&guest(&h), guest_form("standard"))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::EmptyCart));
    }
}
