//! Database migration command.
//!
//! ```bash
//! composable-cli migrate
//! ```
//!
//! Applies `crates/storefront/migrations/` to the database named by
//! `STOREFRONT_DATABASE_URL` (or `DATABASE_URL`). The server never migrates on
//! startup.

use composable_storefront::db;

use super::{CommandError, database_url};

/// Run storefront database migrations.
pub async fn run() -> Result<(), CommandError> {
    let database_url = database_url()?;

    tracing::info!("Connecting to storefront database...");
    let pool = db::create_pool(&database_url).await?;

    tracing::info!("Running storefront migrations...");
    sqlx::migrate!("../storefront/migrations").run(&pool).await?;

    tracing::info!("Storefront migrations complete");
    Ok(())
}
