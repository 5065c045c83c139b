//! Jito tip-floor daemon: landed-tip percentiles and the current tip accounts.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use solana_sdk::{native_token::LAMPORTS_PER_SOL, pubkey::Pubkey};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::booster::types::{TipPercentile, TipSetting};
use crate::services::bundler::JitoClient;

pub const TIP_FLOOR_REFRESH: Duration = Duration::from_secs(30);
pub const TIP_ACCOUNTS_REFRESH: Duration = Duration::from_secs(120);
const OVER_99_INCREMENT_FACTOR: f64 = 1.3;
/// Lower bound for `auto` tips
pub const MIN_AUTO_TIP_LAMPORTS: u64 = 500_000;
/// Smallest tip the relay accepts
pub const MIN_TIP_LAMPORTS: u64 = 1_000;

const DEFAULT_TIP_ACCOUNTS: [&str; 8] = [
    "96gYZGLnJYVFmbjzopPSU6QiEV5fGqZNyN9nmNhvrZU5",
    "HFqU5x63VTqvQss8hp11i4wVV8bD44PvwucfZ2bU7gRe",
    "Cw8CFyM9FkoMi7K7Crf6HNQqf4uEMzpKw6QNghXLvLkY",
    "ADaUMid9yfUytqMBgopwjb2DTLSokTSzL1zt6iGPaS49",
    "DfXygSm4jCyNCybVYYK6DwvWqjKee8pbDmJGcLWNDXjh",
    "ADuUkR4vqLUMWXxW9gh6D6L8pMSawimctcNZ5pGwDcEt",
    "DttWaMuVvTiduZRnguLF7jNxTgiMBZ1hyAumKUiL2KRL",
    "3AVi9Tg9Uo68tJfuvoKvqKNWKkC5wPdSSdeBnizKZ6jT",
];

/// Landed-tip percentiles in lamports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TipFloor {
    pub p25: u64,
    pub p50: u64,
    pub p75: u64,
    pub p95: u64,
    pub p99: u64,
    pub over_99: u64,
}

/// One entry of the tip-floor API response (values in SOL)
#[derive(Debug, Deserialize)]
struct TipFloorEntry {
    landed_tips_25th_percentile: f64,
    landed_tips_50th_percentile: f64,
    landed_tips_75th_percentile: f64,
    landed_tips_95th_percentile: f64,
    landed_tips_99th_percentile: f64,
}

fn sol_to_lamports(sol: f64) -> u64 {
    (sol * LAMPORTS_PER_SOL as f64).round().max(0.0) as u64
}

impl From<&TipFloorEntry> for TipFloor {
    fn from(entry: &TipFloorEntry) -> Self {
        Self {
            p25: sol_to_lamports(entry.landed_tips_25th_percentile),
            p50: sol_to_lamports(entry.landed_tips_50th_percentile),
            p75: sol_to_lamports(entry.landed_tips_75th_percentile),
            p95: sol_to_lamports(entry.landed_tips_95th_percentile),
            p99: sol_to_lamports(entry.landed_tips_99th_percentile),
            over_99: sol_to_lamports(entry.landed_tips_99th_percentile * OVER_99_INCREMENT_FACTOR),
        }
    }
}

pub struct TipFeed {
    client: Client,
    floor_url: String,
    floor: RwLock<TipFloor>,
    accounts: RwLock<Vec<Pubkey>>,
}

impl TipFeed {
    pub fn new(floor_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;
        let accounts = DEFAULT_TIP_ACCOUNTS
            .iter()
            .filter_map(|a| Pubkey::from_str(a).ok())
            .collect();
        Ok(Self {
            client,
            floor_url: floor_url.to_string(),
            floor: RwLock::new(TipFloor::default()),
            accounts: RwLock::new(accounts),
        })
    }

    pub fn floor(&self) -> TipFloor {
        *self.floor.read()
    }

    pub fn set_floor(&self, floor: TipFloor) {
        *self.floor.write() = floor;
    }

    /// Resolve an owner's tip preference to lamports.
    pub fn tip_for(&self, setting: &TipSetting) -> u64 {
        let floor = self.floor();
        match setting {
            TipSetting::Auto => floor.p75.max(MIN_AUTO_TIP_LAMPORTS),
            TipSetting::Percentile(p) => match p {
                TipPercentile::P25 => floor.p25,
                TipPercentile::P50 => floor.p50,
                TipPercentile::P75 => floor.p75,
                TipPercentile::P95 => floor.p95,
                TipPercentile::P99 => floor.p99,
                TipPercentile::Over99 => floor.over_99,
            }
            .max(MIN_TIP_LAMPORTS),
            TipSetting::Lamports(lamports) => *lamports,
        }
    }

    pub fn random_tip_account(&self) -> Option<Pubkey> {
        self.accounts.read().choose(&mut rand::thread_rng()).copied()
    }

    pub async fn refresh_floor(&self) -> Result<TipFloor> {
        let entries: Vec<TipFloorEntry> = self
            .client
            .get(&self.floor_url)
            .send()
            .await
            .context("Failed to fetch tip floor")?
            .json()
            .await
            .context("Failed to parse tip floor response")?;
        let entry = entries.first().context("Tip floor response was empty")?;
        let floor = TipFloor::from(entry);
        self.set_floor(floor);
        debug!("Tip floor updated: {:?}", floor);
        Ok(floor)
    }

    pub async fn refresh_accounts(&self, jito: &JitoClient) -> Result<usize> {
        let accounts = jito.tip_accounts().await?;
        if accounts.is_empty() {
            return Ok(0);
        }
        let count = accounts.len();
        *self.accounts.write() = accounts;
        Ok(count)
    }

    /// Background refresh loop for both floor and tip accounts.
    pub async fn run(self: Arc<Self>, jito: Arc<JitoClient>) {
        info!("💰 Starting Jito tip daemon");
        let mut floor_tick = interval(TIP_FLOOR_REFRESH);
        let mut accounts_tick = interval(TIP_ACCOUNTS_REFRESH);
        loop {
            tokio::select! {
                _ = floor_tick.tick() => {
                    if let Err(e) = self.refresh_floor().await {
                        warn!("Tip floor refresh failed: {:#}", e);
                    }
                }
                _ = accounts_tick.tick() => {
                    if let Err(e) = self.refresh_accounts(&jito).await {
                        warn!("Tip account refresh failed: {:#}", e);
                    }
                }
            }
        }
    }
}
