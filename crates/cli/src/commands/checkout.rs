//! Checkout recovery commands.
//!
//! ```bash
//! # Unfinished checkouts idle for at least 30 minutes
//! composable-cli checkout list-stalled --idle-minutes 30
//!
//! # Drive one of them forward
//! composable-cli checkout resume 7f0c6f3e-0d55-4d0e-9a7e-5a1de3c1b2a4
//! ```
//!
//! Resuming runs as an operator: it has no shopper credential, so an account
//! checkout that has not created its order yet cannot be resumed here.

use composable_core::CheckoutId;
use composable_storefront::checkout::{
    Caller, CheckoutOutcome, CheckoutRecord, CheckoutStore, PgCheckoutStore,
};
use composable_storefront::config::StorefrontConfig;
use composable_storefront::db;
use composable_storefront::state::AppState;

use super::{CommandError, database_url};

/// Print unfinished checkouts not updated for `idle_minutes`.
pub async fn list_stalled(idle_minutes: i64, limit: i64) -> Result<(), CommandError> {
    let pool = db::create_pool(&database_url()?).await?;
    let store = PgCheckoutStore::new(pool);

    let older_than = chrono::Utc::now() - chrono::Duration::minutes(idle_minutes);
    let records = store.list_stalled(older_than, limit).await?;

    if records.is_empty() {
        tracing::info!("No stalled checkouts");
        return Ok(());
    }

    #[allow(clippy::print_stdout)]
    for record in &records {
        println!("{}", summary(record));
    }
    Ok(())
}

/// Resume one checkout from its last completed stage.
pub async fn resume(checkout_id: CheckoutId) -> Result<(), CommandError> {
    let config = StorefrontConfig::from_env()?;
    let pool = db::create_pool(&config.database_url).await?;
    let state = AppState::new(config, pool)?;

    let outcome = state.checkout().resume(checkout_id, Caller::Operator).await?;

    match outcome {
        CheckoutOutcome::Completed(confirmation) => tracing::info!(
            checkout_id = %checkout_id,
            order_id = %confirmation.order.id,
            "Checkout completed"
        ),
        CheckoutOutcome::ActionRequired { .. } => tracing::warn!(
            checkout_id = %checkout_id,
            "Checkout is waiting for the shopper to authenticate the payment"
        ),
    }
    Ok(())
}

fn summary(record: &CheckoutRecord) -> String {
    format!(
        "{id}  {stage:<9}  cart={cart}  order={order}  updated={updated}  error={error}",
        id = record.id,
        stage = record.stage.as_str(),
        cart = record.cart_id,
        order = record.order_id.as_ref().map_or("-", |id| id.as_str()),
        updated = record.updated_at.format("%Y-%m-%d %H:%M:%S"),
        error = record.last_error.as_deref().unwrap_or("-"),
    )
}
