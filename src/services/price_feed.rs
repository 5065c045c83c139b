//! SOL/USD price poller used to express campaign volume in dollars.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use tokio::time::interval;
use tracing::{debug, info, warn};

pub const PRICE_REFRESH: Duration = Duration::from_secs(60);
pub const DEFAULT_SOL_PRICE_USD: f64 = 150.0;

#[derive(Debug, Deserialize)]
struct SimplePriceResponse {
    solana: UsdQuote,
}

#[derive(Debug, Deserialize)]
struct UsdQuote {
    usd: f64,
}

pub struct PriceFeed {
    client: Client,
    url: String,
    sol_usd: RwLock<f64>,
}

impl PriceFeed {
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            url: url.to_string(),
            sol_usd: RwLock::new(DEFAULT_SOL_PRICE_USD),
        })
    }

    pub fn sol_usd(&self) -> f64 {
        *self.sol_usd.read()
    }

    pub fn set_sol_usd(&self, price: f64) {
        if price.is_finite() && price > 0.0 {
            *self.sol_usd.write() = price;
        }
    }

    pub async fn refresh(&self) -> Result<f64> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await
            .context("Failed to fetch SOL price")?
            .text()
            .await
            .context("Failed to read SOL price response")?;
        let price = parse_sol_price(&body)?;
        self.set_sol_usd(price);
        debug!("SOL price updated: ${:.2}", price);
        Ok(price)
    }

    pub async fn run(self: Arc<Self>) {
        info!("💵 Starting SOL price feed");
        let mut ticker = interval(PRICE_REFRESH);
        loop {
            ticker.tick().await;
            if let Err(e) = self.refresh().await {
                warn!("SOL price refresh failed, keeping ${:.2}: {:#}", self.sol_usd(), e);
            }
        }
    }
}

fn parse_sol_price(body: &str) -> Result<f64> {
    let response: SimplePriceResponse = serde_json::from_str(body).context("Unexpected SOL price payload")?;
    Ok(response.solana.usd)
}
