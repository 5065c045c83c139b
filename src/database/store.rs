// Postgres-backed BoosterStore
//
// Owners, settings and booster/puppet mirror rows over the deadpool pool.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::booster::store::BoosterStore;
use crate::booster::types::{BoosterKind, Settings};
use crate::database::connection::DatabaseConnection;
use crate::database::models::{BoosterRecord, FromRow, OwnerAccount, PuppetRecord};

#[async_trait]
impl BoosterStore for DatabaseConnection {
    async fn get_owner(&self, owner_id: &str) -> Result<Option<OwnerAccount>> {
        let client = self.pool().get().await.context("Failed to get DB connection")?;
        let row = client
            .query_opt("SELECT * FROM owners WHERE owner_id = $1", &[&owner_id])
            .await
            .context("Failed to query owner")?;
        row.map(|r| OwnerAccount::from_row(&r)).transpose()
    }

    async fn create_owner(&self, account: &OwnerAccount) -> Result<()> {
        let client = self.pool().get().await.context("Failed to get DB connection")?;
        client
            .execute(
                "INSERT INTO owners (owner_id, wallet_secret, wallet_pubkey, withdraw_address, usage_expires_at, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (owner_id) DO NOTHING",
                &[
                    &account.owner_id,
                    &account.wallet_secret,
                    &account.wallet_pubkey,
                    &account.withdraw_address,
                    &account.usage_expires_at,
                    &account.created_at,
                ],
            )
            .await
            .context("Failed to insert owner")?;
        Ok(())
    }

    async fn extend_usage(&self, owner_id: &str, until: DateTime<Utc>) -> Result<u64> {
        let client = self.pool().get().await.context("Failed to get DB connection")?;
        let n = client
            .execute(
                "UPDATE owners SET usage_expires_at = $1 WHERE owner_id = $2",
                &[&until, &owner_id],
            )
            .await
            .context("Failed to extend usage window")?;
        Ok(n)
    }

    async fn set_withdraw_address(&self, owner_id: &str, address: &str) -> Result<u64> {
        let client = self.pool().get().await.context("Failed to get DB connection")?;
        let n = client
            .execute(
                "UPDATE owners SET withdraw_address = $1 WHERE owner_id = $2",
                &[&address, &owner_id],
            )
            .await
            .context("Failed to set withdrawal address")?;
        Ok(n)
    }

    async fn get_settings(&self, owner_id: &str) -> Result<Settings> {
        let client = self.pool().get().await.context("Failed to get DB connection")?;
        let row = client
            .query_opt("SELECT * FROM settings WHERE owner_id = $1", &[&owner_id])
            .await
            .context("Failed to query settings")?;
        match row {
            Some(r) => Settings::from_row(&r),
            None => Ok(Settings::default()),
        }
    }

    async fn save_settings(&self, owner_id: &str, settings: &Settings) -> Result<()> {
        let client = self.pool().get().await.context("Failed to get DB connection")?;
        let speed = settings.volume_speed as i16;
        let duration = settings.volume_duration_secs.min(i64::MAX as u64) as i64;
        let volume_wallets = settings.volume_parallel_wallets as i32;
        let rank_wallets = settings.rank_parallel_wallets as i32;
        let rotate = settings.rank_rotate_every_n_tx as i32;
        let holders = settings.holders_new_holders as i32;
        let tip = settings.jito_tip.to_string();
        client
            .execute(
                "INSERT INTO settings (owner_id, volume_speed, volume_duration_secs, volume_parallel_wallets,
                    rank_parallel_wallets, rank_rotate_every_n_tx, holders_new_holders, jito_tip, selected_token)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 ON CONFLICT (owner_id) DO UPDATE SET
                    volume_speed = EXCLUDED.volume_speed,
                    volume_duration_secs = EXCLUDED.volume_duration_secs,
                    volume_parallel_wallets = EXCLUDED.volume_parallel_wallets,
                    rank_parallel_wallets = EXCLUDED.rank_parallel_wallets,
                    rank_rotate_every_n_tx = EXCLUDED.rank_rotate_every_n_tx,
                    holders_new_holders = EXCLUDED.holders_new_holders,
                    jito_tip = EXCLUDED.jito_tip,
                    selected_token = EXCLUDED.selected_token,
                    updated_at = NOW()",
                &[
                    &owner_id,
                    &speed,
                    &duration,
                    &volume_wallets,
                    &rank_wallets,
                    &rotate,
                    &holders,
                    &tip,
                    &settings.selected_token,
                ],
            )
            .await
            .context("Failed to save settings")?;
        Ok(())
    }

    async fn insert_booster(&self, record: &BoosterRecord) -> Result<()> {
        let client = self.pool().get().await.context("Failed to get DB connection")?;
        client
            .execute(
                "INSERT INTO boosters (id, owner_id, token_address, kind, created_at) VALUES ($1, $2, $3, $4, $5)",
                &[
                    &record.id,
                    &record.owner_id,
                    &record.token_address,
                    &record.kind.as_str(),
                    &record.created_at,
                ],
            )
            .await
            .context("Failed to insert booster")?;
        Ok(())
    }

    async fn delete_booster(&self, id: Uuid) -> Result<u64> {
        let client = self.pool().get().await.context("Failed to get DB connection")?;
        let n = client
            .execute("DELETE FROM boosters WHERE id = $1", &[&id])
            .await
            .context("Failed to delete booster")?;
        Ok(n)
    }

    async fn find_boosters(&self, owner_id: &str, token_address: &str, kind: BoosterKind) -> Result<Vec<BoosterRecord>> {
        let client = self.pool().get().await.context("Failed to get DB connection")?;
        let rows = client
            .query(
                "SELECT * FROM boosters WHERE owner_id = $1 AND token_address = $2 AND kind = $3",
                &[&owner_id, &token_address, &kind.as_str()],
            )
            .await
            .context("Failed to query boosters")?;
        rows.iter().map(BoosterRecord::from_row).collect()
    }

    async fn insert_puppet(&self, record: &PuppetRecord) -> Result<()> {
        let client = self.pool().get().await.context("Failed to get DB connection")?;
        client
            .execute(
                "INSERT INTO puppets (id, owner_id, booster_id, pubkey, secret_key, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (pubkey) DO NOTHING",
                &[
                    &record.id,
                    &record.owner_id,
                    &record.booster_id,
                    &record.pubkey,
                    &record.secret_key,
                    &record.created_at,
                ],
            )
            .await
            .context("Failed to insert puppet")?;
        Ok(())
    }

    async fn delete_puppet(&self, pubkey: &str) -> Result<u64> {
        let client = self.pool().get().await.context("Failed to get DB connection")?;
        let n = client
            .execute("DELETE FROM puppets WHERE pubkey = $1", &[&pubkey])
            .await
            .context("Failed to delete puppet")?;
        Ok(n)
    }

    async fn puppets_for_owner(&self, owner_id: &str) -> Result<Vec<PuppetRecord>> {
        let client = self.pool().get().await.context("Failed to get DB connection")?;
        let rows = client
            .query(
                "SELECT * FROM puppets WHERE owner_id = $1 ORDER BY created_at",
                &[&owner_id],
            )
            .await
            .context("Failed to query puppets")?;
        rows.iter().map(PuppetRecord::from_row).collect()
    }
}
