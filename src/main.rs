//! # Booster Server
//!
//! Campaign engine for Solana token boosters: volume, rank and holder
//! campaigns run through pools of short-lived "puppet" wallets, with every
//! lamport they hold tracked until it is back in the owner's work wallet.
//!
//! ## Architecture
//! - `server`: runtime wiring, background daemons and the HTTP router
//! - `config`: environment variable configuration
//! - `booster`: campaign and puppet state machines, registries, salvage
//! - `services`: Solana ledger, Jupiter swaps, Jito bundles, tip floor,
//!   SOL price feed and the notification outbox
//! - `database`: Postgres pool, row models, migrations
//! - `routes`: HTTP handlers
//!
//! ## Environment Setup
//! ```bash
//! cp .env.example .env
//! ```
//!
//! ## Health Check
//! ```bash
//! curl http://localhost:3000/ping
//! ```

mod booster;
mod config;
mod database;
mod routes;
mod server;
mod services;

#[cfg(test)]
mod test_support;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false) // Don't show module targets for cleaner output
                .compact(),
        )
        .init();

    tracing::info!("🏁 Starting booster server...");
    tracing::info!("📦 Package: {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    tracing::info!("🏗️  Build profile: {}", if cfg!(debug_assertions) { "debug" } else { "release" });

    if let Err(e) = server::start().await {
        tracing::error!("❌ Server stopped: {:#}", e);
        std::process::exit(1);
    }
}
