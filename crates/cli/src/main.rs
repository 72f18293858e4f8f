//! Composable storefront CLI - migrations and checkout recovery.
//!
//! # Usage
//!
//! ```bash
//! # Run storefront database migrations
//! composable-cli migrate
//!
//! # List unfinished checkouts idle for 30+ minutes
//! composable-cli checkout list-stalled
//!
//! # Resume a stalled checkout from its last completed stage
//! composable-cli checkout resume <CHECKOUT_ID>
//! ```

#![cfg_attr(not(test), forbid(unsafe_code))]

use clap::{Parser, Subcommand};

use composable_core::CheckoutId;

mod commands;

#[derive(Parser)]
#[command(name = "composable-cli")]
#[command(author, version, about = "Composable storefront CLI tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run storefront database migrations
    Migrate,
    /// Inspect and recover checkout runs
    Checkout {
        #[command(subcommand)]
        action: CheckoutAction,
    },
}

#[derive(Subcommand)]
enum CheckoutAction {
    /// List unfinished checkouts that have not progressed recently
    ListStalled {
        /// Minimum idle time in minutes
        #[arg(long, default_value_t = 30)]
        idle_minutes: i64,

        /// Maximum number of checkouts to list
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Resume a checkout from its last completed stage
    Resume {
        /// Checkout ID (UUID)
        checkout_id: CheckoutId,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        tracing::error!("Command failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), commands::CommandError> {
    match cli.command {
        Commands::Migrate => commands::migrate::run().await?,
        Commands::Checkout { action } => match action {
            CheckoutAction::ListStalled {
                idle_minutes,
                limit,
            } => commands::checkout::list_stalled(idle_minutes, limit).await?,
            CheckoutAction::Resume { checkout_id } => {
                commands::checkout::resume(checkout_id).await?;
            }
        },
    }
    Ok(())
}
