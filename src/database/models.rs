// Database Models
//
// Tokio-postgres row models for owners, settings, boosters and puppets.

use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use solana_sdk::signature::{Keypair, Signer};
use tokio_postgres::Row;
use uuid::Uuid;

use crate::booster::types::{BoosterKind, Settings, TipSetting};

/// Trait for converting from tokio-postgres Row
pub trait FromRow {
    fn from_row(row: &Row) -> Result<Self> where Self: Sized;
}

/// Decode a base58 secret key into a keypair
pub fn keypair_from_base58(secret: &str) -> Result<Keypair> {
    let bytes = bs58::decode(secret)
        .into_vec()
        .context("Failed to decode private key")?;
    Keypair::from_bytes(&bytes).map_err(|e| anyhow!("Invalid keypair bytes: {}", e))
}

pub fn keypair_to_base58(keypair: &Keypair) -> String {
    bs58::encode(keypair.to_bytes()).into_string()
}

// ============================================================================
// OWNER MODELS
// ============================================================================

/// Bot user with its work wallet and rental window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerAccount {
    pub owner_id: String,
    #[serde(skip_serializing)]
    pub wallet_secret: String,
    pub wallet_pubkey: String,
    /// Where a withdrawal sends the work-wallet balance
    pub withdraw_address: Option<String>,
    pub usage_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl OwnerAccount {
    /// New owner with a freshly generated work wallet and an already
    /// expired usage window.
    pub fn generate(owner_id: &str) -> Self {
        let keypair = Keypair::new();
        let now = Utc::now();
        Self {
            owner_id: owner_id.to_string(),
            wallet_secret: keypair_to_base58(&keypair),
            wallet_pubkey: keypair.pubkey().to_string(),
            withdraw_address: None,
            usage_expires_at: now,
            created_at: now,
        }
    }

    pub fn keypair(&self) -> Result<Keypair> {
        keypair_from_base58(&self.wallet_secret)
    }

    pub fn usage_expired(&self, now: DateTime<Utc>) -> bool {
        self.usage_expires_at <= now
    }
}

impl FromRow for OwnerAccount {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            owner_id: row.try_get("owner_id")?,
            wallet_secret: row.try_get("wallet_secret")?,
            wallet_pubkey: row.try_get("wallet_pubkey")?,
            withdraw_address: row.try_get("withdraw_address")?,
            usage_expires_at: row.try_get("usage_expires_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl FromRow for Settings {
    fn from_row(row: &Row) -> Result<Self> {
        let speed: i16 = row.try_get("volume_speed")?;
        let duration: i64 = row.try_get("volume_duration_secs")?;
        let volume_wallets: i32 = row.try_get("volume_parallel_wallets")?;
        let rank_wallets: i32 = row.try_get("rank_parallel_wallets")?;
        let rotate: i32 = row.try_get("rank_rotate_every_n_tx")?;
        let holders: i32 = row.try_get("holders_new_holders")?;
        let tip: String = row.try_get("jito_tip")?;

        Ok(Settings {
            volume_speed: speed.max(0) as u8,
            volume_duration_secs: duration.max(0) as u64,
            volume_parallel_wallets: volume_wallets.max(0) as u32,
            rank_parallel_wallets: rank_wallets.max(0) as u32,
            rank_rotate_every_n_tx: rotate.max(0) as u32,
            holders_new_holders: holders.max(0) as u32,
            jito_tip: TipSetting::from_str(&tip).map_err(|e| anyhow!(e))?,
            selected_token: row.try_get("selected_token")?,
        }
        .sanitized())
    }
}

// ============================================================================
// BOOSTER & PUPPET MODELS
// ============================================================================

/// Mirror row of a live (or not yet cleaned up) booster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoosterRecord {
    pub id: Uuid,
    pub owner_id: String,
    pub token_address: String,
    pub kind: BoosterKind,
    pub created_at: DateTime<Utc>,
}

impl FromRow for BoosterRecord {
    fn from_row(row: &Row) -> Result<Self> {
        let kind: String = row.try_get("kind")?;
        Ok(Self {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            token_address: row.try_get("token_address")?,
            kind: BoosterKind::from_str(&kind).map_err(|e| anyhow!(e))?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// A funded-but-not-yet-reconciled puppet wallet.
///
/// The row is the only durable copy of the puppet's key; it is removed once
/// the wallet's funds are confirmed back with the booster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PuppetRecord {
    pub id: Uuid,
    pub owner_id: String,
    pub booster_id: Uuid,
    pub pubkey: String,
    #[serde(skip_serializing)]
    pub secret_key: String,
    pub created_at: DateTime<Utc>,
}

impl PuppetRecord {
    pub fn new(owner_id: &str, booster_id: Uuid, keypair: &Keypair) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            booster_id,
            pubkey: keypair.pubkey().to_string(),
            secret_key: keypair_to_base58(keypair),
            created_at: Utc::now(),
        }
    }

    pub fn keypair(&self) -> Result<Keypair> {
        keypair_from_base58(&self.secret_key)
    }
}

impl FromRow for PuppetRecord {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            booster_id: row.try_get("booster_id")?,
            pubkey: row.try_get("pubkey")?,
            secret_key: row.try_get("secret_key")?,
            created_at: row.try_get("created_at")?,
        })
    }
}
