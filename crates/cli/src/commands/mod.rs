//! CLI subcommand implementations.

pub mod checkout;
pub mod migrate;

use secrecy::SecretString;

/// Errors shared by the subcommands.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(&'static str),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Repository error: {0}")]
    Repository(#[from] composable_storefront::db::RepositoryError),

    #[error("Configuration error: {0}")]
    Config(#[from] composable_storefront::config::ConfigError),

    #[error("Startup error: {0}")]
    State(#[from] composable_storefront::state::StateError),

    #[error("Checkout error: {0}")]
    Checkout(#[from] composable_storefront::checkout::CheckoutError),
}

/// Storefront database URL, with the same `DATABASE_URL` fallback as the server.
fn database_url() -> Result<SecretString, CommandError> {
    let _ = dotenvy::dotenv();
    std::env::var("STOREFRONT_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .map(SecretString::from)
        .map_err(|_| CommandError::MissingEnvVar("STOREFRONT_DATABASE_URL"))
}
