//! Checkout record persistence.
//!
//! A record is written when a checkout run starts and rewritten after every stage
//! transition, so a run interrupted by a crash, a processor redirect or an upstream
//! failure can be resumed from its last completed stage.
//!
//! Writes are compare-and-set on [`CheckoutRecord::version`]. A runner claims a
//! record (sets `claimed_until`) before driving it, so two resumes of the same
//! run never call the platform side by side.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

use composable_core::{
    AccountId, CartId, CheckoutId, CheckoutStage, OrderId, PaymentMethodId, TransactionId,
};

use crate::commerce::Cart;
use crate::db::RepositoryError;
use crate::shipping::DeliveryOption;

use super::form::CheckoutForm;

/// One checkout run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRecord {
    pub id: CheckoutId,
    pub cart_id: CartId,
    /// Selected account of the member who started the run.
    pub account_id: Option<AccountId>,
    pub stage: CheckoutStage,
    pub form: CheckoutForm,
    /// Resolved delivery method.
    pub shipping: DeliveryOption,
    pub order_id: Option<OrderId>,
    pub transaction_id: Option<TransactionId>,
    /// Card charged for the payment, tokenised once per run.
    pub payment_method: Option<PaymentMethodId>,
    /// Processor secret of the payment intent, kept until the payment settles.
    pub client_secret: Option<String>,
    /// The processor asked the shopper to authenticate.
    pub awaiting_action: bool,
    pub subscription_order: bool,
    /// Cart contents at the moment it was cleared.
    pub cart_snapshot: Option<Cart>,
    pub new_cart_id: Option<CartId>,
    pub last_error: Option<String>,
    /// Bumped by every successful write.
    pub version: i64,
    /// A runner is driving the record until this instant.
    pub claimed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CheckoutRecord {
    /// A fresh record at [`CheckoutStage::Started`].
    #[must_use]
    pub fn new(
        cart_id: CartId,
        account_id: Option<AccountId>,
        form: CheckoutForm,
        shipping: DeliveryOption,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: CheckoutId::generate(),
            cart_id,
            account_id,
            stage: CheckoutStage::Started,
            form,
            shipping,
            order_id: None,
            transaction_id: None,
            payment_method: None,
            client_secret: None,
            awaiting_action: false,
            subscription_order: false,
            cart_snapshot: None,
            new_cart_id: None,
            last_error: None,
            version: 0,
            claimed_until: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a runner holds the record at `now`.
    #[must_use]
    pub fn is_claimed(&self, now: DateTime<Utc>) -> bool {
        self.claimed_until.is_some_and(|until| until > now)
    }
}

/// Storage for checkout records.
#[async_trait]
pub trait CheckoutStore: Send + Sync {
    /// Persist a new record.
    ///
    /// Fails with [`RepositoryError::Conflict`] when the id is taken.
    async fn insert(&self, record: &CheckoutRecord) -> Result<(), RepositoryError>;

    /// Overwrite an existing record if it is still at `record.version`, storing
    /// it at `record.version + 1`.
    ///
    /// Fails with [`RepositoryError::Conflict`] when another write got there
    /// first and [`RepositoryError::NotFound`] when no record has the id.
    async fn update(&self, record: &CheckoutRecord) -> Result<(), RepositoryError>;

    /// Load a record.
    async fn get(&self, id: CheckoutId) -> Result<Option<CheckoutRecord>, RepositoryError>;

    /// Unfinished records not touched since `older_than`, oldest first.
    async fn list_stalled(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CheckoutRecord>, RepositoryError>;

    /// Check that the backing storage is reachable.
    async fn ping(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

/// Record fields without a column of their own.
#[derive(Debug, Serialize, Deserialize)]
struct CheckoutPayload {
    form: CheckoutForm,
    shipping: DeliveryOption,
    #[serde(default)]
    payment_method: Option<PaymentMethodId>,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    awaiting_action: bool,
    #[serde(default)]
    subscription_order: bool,
    #[serde(default)]
    cart_snapshot: Option<Cart>,
    #[serde(default)]
    new_cart_id: Option<CartId>,
}

#[derive(Debug, sqlx::FromRow)]
struct CheckoutRow {
    id: Uuid,
    cart_id: String,
    account_id: Option<String>,
    stage: String,
    order_id: Option<String>,
    transaction_id: Option<String>,
    payload: serde_json::Value,
    last_error: Option<String>,
    version: i64,
    claimed_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CheckoutRow> for CheckoutRecord {
    type Error = RepositoryError;

    fn try_from(row: CheckoutRow) -> Result<Self, Self::Error> {
        let stage = row
            .stage
            .parse()
            .map_err(|e: String| RepositoryError::DataCorruption(format!("checkout {}: {e}", row.id)))?;
        let payload: CheckoutPayload = serde_json::from_value(row.payload).map_err(|e| {
            RepositoryError::DataCorruption(format!("checkout {} payload: {e}", row.id))
        })?;

        Ok(Self {
            id: CheckoutId::from_uuid(row.id),
            cart_id: CartId::new(row.cart_id),
            account_id: row.account_id.map(AccountId::new),
            stage,
            form: payload.form,
            shipping: payload.shipping,
            order_id: row.order_id.map(OrderId::new),
            transaction_id: row.transaction_id.map(TransactionId::new),
            payment_method: payload.payment_method,
            client_secret: payload.client_secret,
            awaiting_action: payload.awaiting_action,
            subscription_order: payload.subscription_order,
            cart_snapshot: payload.cart_snapshot,
            new_cart_id: payload.new_cart_id,
            last_error: row.last_error,
            version: row.version,
            claimed_until: row.claimed_until,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn payload_of(record: &CheckoutRecord) -> Result<serde_json::Value, RepositoryError> {
    serde_json::to_value(CheckoutPayload {
        form: record.form.clone(),
        shipping: record.shipping.clone(),
        payment_method: record.payment_method.clone(),
        client_secret: record.client_secret.clone(),
        awaiting_action: record.awaiting_action,
        subscription_order: record.subscription_order,
        cart_snapshot: record.cart_snapshot.clone(),
        new_cart_id: record.new_cart_id.clone(),
    })
    .map_err(|e| RepositoryError::DataCorruption(format!("checkout {} payload: {e}", record.id)))
}

const SELECT_COLUMNS: &str = r"
    SELECT id, cart_id, account_id, stage, order_id, transaction_id,
           payload, last_error, version, claimed_until, created_at, updated_at
    FROM storefront.checkout
";

/// `PostgreSQL`-backed checkout store (`storefront.checkout`).
#[derive(Debug, Clone)]
pub struct PgCheckoutStore {
    pool: PgPool,
}

impl PgCheckoutStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckoutStore for PgCheckoutStore {
    #[instrument(skip(self, record), fields(checkout_id = %record.id))]
    async fn insert(&self, record: &CheckoutRecord) -> Result<(), RepositoryError> {
        let payload = payload_of(record)?;

        sqlx::query(
            r"
            INSERT INTO storefront.checkout (
                id, cart_id, account_id, stage, order_id, transaction_id,
                payload, last_error, version, claimed_until, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ",
        )
        .bind(record.id.as_uuid())
        .bind(record.cart_id.as_str())
        .bind(record.account_id.as_ref().map(AccountId::as_str))
        .bind(record.stage.as_str())
        .bind(record.order_id.as_ref().map(OrderId::as_str))
        .bind(record.transaction_id.as_ref().map(TransactionId::as_str))
        .bind(payload)
        .bind(record.last_error.as_deref())
        .bind(record.version)
        .bind(record.claimed_until)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("checkout {} already exists", record.id))
            }
            other => RepositoryError::Database(other),
        })?;

        Ok(())
    }

    #[instrument(skip(self, record), fields(checkout_id = %record.id, stage = %record.stage))]
    async fn update(&self, record: &CheckoutRecord) -> Result<(), RepositoryError> {
        let payload = payload_of(record)?;

        let result = sqlx::query(
            r"
            UPDATE storefront.checkout
            SET stage = $3, order_id = $4, transaction_id = $5, payload = $6,
                last_error = $7, claimed_until = $8, updated_at = $9,
                version = version + 1
            WHERE id = $1 AND version = $2
            ",
        )
        .bind(record.id.as_uuid())
        .bind(record.version)
        .bind(record.stage.as_str())
        .bind(record.order_id.as_ref().map(OrderId::as_str))
        .bind(record.transaction_id.as_ref().map(TransactionId::as_str))
        .bind(payload)
        .bind(record.last_error.as_deref())
        .bind(record.claimed_until)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM storefront.checkout WHERE id = $1)")
                    .bind(record.id.as_uuid())
                    .fetch_one(&self.pool)
                    .await?;
            return Err(if exists {
                RepositoryError::Conflict(format!(
                    "checkout {} changed since version {}",
                    record.id, record.version
                ))
            } else {
                RepositoryError::NotFound
            });
        }

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, id: CheckoutId) -> Result<Option<CheckoutRecord>, RepositoryError> {
        let row: Option<CheckoutRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(CheckoutRecord::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn list_stalled(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CheckoutRecord>, RepositoryError> {
        let rows: Vec<CheckoutRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE stage <> 'fulfilled' AND updated_at < $1 \
             ORDER BY updated_at ASC LIMIT $2"
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CheckoutRecord::try_from).collect()
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
