//! # Server Module
//!
//! Wires the booster runtime to its collaborators, starts the background
//! daemons and serves the HTTP API.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::commitment_config::CommitmentConfig;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

use crate::booster::{BoosterRuntime, RuntimeParams};
use crate::config::CONFIG;
use crate::database::{DatabaseConfig, DatabaseConnection};
use crate::routes::health::{health, ping};
use crate::services::bundler::{BundleStatusChecker, JitoBundler, JitoClient, STATUS_CHECK_INTERVAL};
use crate::services::ledger::{PRIORITY_FEE_LAMPORTS, SolanaLedger};
use crate::services::notifier::Outbox;
use crate::services::price_feed::PriceFeed;
use crate::services::swap_engine::JupiterSwapEngine;
use crate::services::tip_feed::TipFeed;

/// Application state shared across all route handlers
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<BoosterRuntime>,
    pub outbox: Arc<Outbox>,
    pub db: Arc<DatabaseConnection>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::ORIGIN,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
        ])
        .expose_headers([axum::http::header::CONTENT_TYPE]);

    Router::new()
        .route("/ping", get(ping))
        .route("/health", get(health))
        .merge(crate::routes::boosters::create_routes())
        .merge(crate::routes::owners::create_routes())
        .layer(ServiceBuilder::new().layer(cors))
        .with_state(state)
}

/// Starts the booster HTTP server and its background daemons.
///
/// Runs until the listener fails or the process is terminated.
pub async fn start() -> Result<()> {
    let config = &*CONFIG;
    let params = RuntimeParams::from_config(config);

    let db_config = DatabaseConfig::from_url(&config.database.url, config.database.max_connections)?;
    let db = Arc::new(DatabaseConnection::new(db_config).await?);
    db.migrate().await?;

    let tips = Arc::new(TipFeed::new(&config.jito_tip_floor_url)?);
    let prices = Arc::new(PriceFeed::new(&config.price_feed_url)?);
    let jito = Arc::new(JitoClient::new(&config.block_engine_url)?);
    let checker = Arc::new(BundleStatusChecker::new(jito.clone(), STATUS_CHECK_INTERVAL));

    let rpc = Arc::new(RpcClient::new_with_commitment(
        config.http_rpc_url.clone(),
        CommitmentConfig::confirmed(),
    ));
    let swaps = JupiterSwapEngine::new(&config.jupiter_api_url, PRIORITY_FEE_LAMPORTS)?;
    let ledger = Arc::new(SolanaLedger::new(&config.http_rpc_url, swaps, params.transfer_policy));
    let bundler = Arc::new(JitoBundler::new(jito.clone(), rpc, tips.clone(), checker.clone()));
    let outbox = Arc::new(Outbox::new());

    let runtime = Arc::new(BoosterRuntime::new(
        ledger,
        bundler,
        db.clone(),
        outbox.clone(),
        tips.clone(),
        prices.clone(),
        params,
    ));

    tokio::spawn(tips.run(jito));
    tokio::spawn(prices.run());
    tokio::spawn(checker.run());

    let app = router(AppState { runtime, outbox, db });

    let host: std::net::IpAddr = config
        .server
        .host
        .parse()
        .with_context(|| format!("Invalid SERVER_HOST {:?}", config.server.host))?;
    let addr = std::net::SocketAddr::from((host, config.server.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {} - port may already be in use", addr))?;

    tracing::info!("🚀 Booster server starting...");
    tracing::info!("📡 Listening on http://{}", addr);
    tracing::info!("🏥 Health check available at http://{}/ping", addr);
    tracing::info!("📊 Booster endpoints available at http://{}/api/v1/boosters", addr);
    tracing::info!("👤 Owner endpoints available at http://{}/api/v1/owners/*", addr);
    if config.test_mode {
        tracing::info!("🧪 Test mode: shortened pacing and bundle timeouts");
    }

    axum::serve(listener, app).await.context("HTTP server failed")?;
    Ok(())
}
