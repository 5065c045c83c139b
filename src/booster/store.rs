//! Persistence seam for owners, settings and booster/puppet mirror rows.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::booster::types::{BoosterKind, Settings};
use crate::database::models::{BoosterRecord, OwnerAccount, PuppetRecord};

#[async_trait]
pub trait BoosterStore: Send + Sync {
    async fn get_owner(&self, owner_id: &str) -> Result<Option<OwnerAccount>>;

    async fn create_owner(&self, account: &OwnerAccount) -> Result<()>;

    async fn extend_usage(&self, owner_id: &str, until: DateTime<Utc>) -> Result<u64>;

    async fn set_withdraw_address(&self, owner_id: &str, address: &str) -> Result<u64>;

    /// Stored settings, or defaults for owners who never changed any.
    async fn get_settings(&self, owner_id: &str) -> Result<Settings>;

    async fn save_settings(&self, owner_id: &str, settings: &Settings) -> Result<()>;

    async fn insert_booster(&self, record: &BoosterRecord) -> Result<()>;

    /// Returns the number of rows removed; zero is not an error.
    async fn delete_booster(&self, id: Uuid) -> Result<u64>;

    async fn find_boosters(&self, owner_id: &str, token_address: &str, kind: BoosterKind) -> Result<Vec<BoosterRecord>>;

    async fn insert_puppet(&self, record: &PuppetRecord) -> Result<()>;

    async fn delete_puppet(&self, pubkey: &str) -> Result<u64>;

    async fn puppets_for_owner(&self, owner_id: &str) -> Result<Vec<PuppetRecord>>;
}
