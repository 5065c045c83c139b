//! The application-scoped booster runtime.
//!
//! Owns both registries and every collaborator a booster or puppet needs, so
//! each test can build an isolated world of its own.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use solana_sdk::{native_token::lamports_to_sol, pubkey::Pubkey, signature::Signer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::booster::campaign::Booster;
use crate::booster::policy::{RetryPolicy, WITHDRAW_RESERVE_LAMPORTS, reserved_floor};
use crate::booster::registry::{BoosterRegistry, PuppetRegistry};
use crate::booster::store::BoosterStore;
use crate::booster::types::{BoosterKind, Settings, StartRejection, WithdrawRejection};
use crate::config::Config;
use crate::database::models::{BoosterRecord, OwnerAccount};
use crate::services::bundler::BundleSubmitter;
use crate::services::ledger::{DEFAULT_SOLANA_FEE_LAMPORTS, Ledger, PRIORITY_FEE_LAMPORTS, wait_for_balance_at_most};
use crate::services::notifier::Notifier;
use crate::services::price_feed::PriceFeed;
use crate::services::tip_feed::TipFeed;

/// Every timing knob of the booster core.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeParams {
    /// How often a running booster re-evaluates its stop condition
    pub status_poll_interval: Duration,
    /// Upper bound on waiting for puppets to finish during `Stopping`
    pub puppet_stop_timeout: Duration,
    pub puppet_stop_poll: Duration,
    /// Funding transfers, confirmed on the receiving side
    pub transfer_policy: RetryPolicy,
    /// Salvage transfers, confirmed on the sending side
    pub balance_policy: RetryPolicy,
    pub bundle_timeout: Duration,
    pub retry_delay: Duration,
    /// One pacing unit; trade pauses are multiples of it
    pub pacing_unit: Duration,
    /// Longest uninterrupted sleep before stop flags are re-checked
    pub pacing_slice: Duration,
}

impl Default for RuntimeParams {
    fn default() -> Self {
        Self {
            status_poll_interval: Duration::from_secs(5),
            puppet_stop_timeout: Duration::from_secs(120),
            puppet_stop_poll: Duration::from_secs(2),
            transfer_policy: RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(90)),
            balance_policy: RetryPolicy::new(1, Duration::from_secs(1), Duration::from_secs(45)),
            bundle_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(1),
            pacing_unit: Duration::from_secs(1),
            pacing_slice: Duration::from_secs(5),
        }
    }
}

impl RuntimeParams {
    pub fn from_config(config: &Config) -> Self {
        let defaults = Self::default();
        let params = Self {
            status_poll_interval: Duration::from_secs(config.status_poll_interval_secs.max(1)),
            puppet_stop_timeout: Duration::from_secs(config.worker_stop_timeout_secs),
            ..defaults
        };
        if config.test_mode {
            Self {
                pacing_unit: Duration::from_millis(100),
                bundle_timeout: Duration::from_secs(10),
                ..params
            }
        } else {
            params
        }
    }
}

pub struct BoosterRuntime {
    pub ledger: Arc<dyn Ledger>,
    pub bundler: Arc<dyn BundleSubmitter>,
    pub store: Arc<dyn BoosterStore>,
    pub notifier: Arc<dyn Notifier>,
    pub tips: Arc<TipFeed>,
    pub prices: Arc<PriceFeed>,
    pub boosters: BoosterRegistry,
    pub puppets: PuppetRegistry,
    pub params: RuntimeParams,
}

fn unavailable(e: anyhow::Error) -> StartRejection {
    warn!("Booster start failed on a collaborator: {:#}", e);
    StartRejection::Unavailable(e.to_string())
}

fn withdraw_unavailable(e: anyhow::Error) -> WithdrawRejection {
    warn!("Withdrawal failed on a collaborator: {:#}", e);
    WithdrawRejection::Unavailable(e.to_string())
}

/// A confirmed work-wallet withdrawal.
#[derive(Debug, Clone, Serialize)]
pub struct Withdrawal {
    pub destination: String,
    pub lamports: u64,
    pub signature: String,
}

impl BoosterRuntime {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        bundler: Arc<dyn BundleSubmitter>,
        store: Arc<dyn BoosterStore>,
        notifier: Arc<dyn Notifier>,
        tips: Arc<TipFeed>,
        prices: Arc<PriceFeed>,
        params: RuntimeParams,
    ) -> Self {
        Self {
            ledger,
            bundler,
            store,
            notifier,
            tips,
            prices,
            boosters: BoosterRegistry::new(),
            puppets: PuppetRegistry::new(),
            params,
        }
    }

    /// Validate, register and launch a booster. Every rejection is also
    /// delivered to the owner as a notification.
    pub async fn start_booster(
        self: &Arc<Self>,
        owner_id: &str,
        kind: BoosterKind,
        token: Pubkey,
        settings: Option<Settings>,
    ) -> Result<Arc<Booster>, StartRejection> {
        match self.prepare_start(owner_id, kind, token, settings).await {
            Ok(booster) => {
                info!("🚀 Starting {} booster {} for {} on {}", kind, booster.id, owner_id, token);
                tokio::spawn(booster.clone().run(self.clone()));
                Ok(booster)
            }
            Err(rejection) => {
                info!("🙅 {} booster for {} rejected: {}", kind, owner_id, rejection);
                self.notifier.notify(owner_id, format!("❌ {}", rejection));
                Err(rejection)
            }
        }
    }

    async fn prepare_start(
        &self,
        owner_id: &str,
        kind: BoosterKind,
        token: Pubkey,
        settings: Option<Settings>,
    ) -> Result<Arc<Booster>, StartRejection> {
        let owner = self
            .store
            .get_owner(owner_id)
            .await
            .map_err(unavailable)?
            .ok_or_else(|| StartRejection::UnknownOwner(owner_id.to_string()))?;

        if owner.usage_expired(Utc::now()) {
            return Err(StartRejection::UsageExpired);
        }
        self.boosters.check_vacancy(owner_id, &token, kind)?;

        let settings = match settings {
            Some(settings) => {
                let settings = settings.sanitized();
                self.store.save_settings(owner_id, &settings).await.map_err(unavailable)?;
                settings
            }
            None => self.store.get_settings(owner_id).await.map_err(unavailable)?,
        };
        let keypair = owner.keypair().map_err(unavailable)?;

        let floor = reserved_floor(kind);
        if floor > 0 {
            let total = self.owner_total_balance(&owner).await.map_err(unavailable)?;
            if total < floor {
                return Err(StartRejection::InsufficientBalance {
                    have_sol: lamports_to_sol(total),
                    need_sol: lamports_to_sol(floor),
                });
            }
        }

        // rows for this key that no live booster backs are leftovers of a crash
        let token_address = token.to_string();
        let stale = self
            .store
            .find_boosters(owner_id, &token_address, kind)
            .await
            .map_err(unavailable)?;
        for record in stale.iter().filter(|r| self.boosters.get(&r.id).is_none()) {
            info!("🧹 Removing stale {} booster row {}", kind, record.id);
            self.store.delete_booster(record.id).await.map_err(unavailable)?;
        }

        let record = BoosterRecord {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            token_address,
            kind,
            created_at: Utc::now(),
        };
        self.store.insert_booster(&record).await.map_err(unavailable)?;

        let booster = Arc::new(Booster::new(record.id, owner_id, token, kind, keypair, settings));
        if let Err(rejection) = self.boosters.insert(booster.clone()) {
            if let Err(e) = self.store.delete_booster(record.id).await {
                warn!("Failed to remove booster row {} after a lost race: {:#}", record.id, e);
            }
            return Err(rejection);
        }
        Ok(booster)
    }

    /// Ask a booster to stop; takes effect at its next stop check.
    pub fn request_stop(&self, booster_id: &Uuid) -> Option<Arc<Booster>> {
        let booster = self.boosters.get(booster_id)?;
        booster.request_stop();
        info!("🛑 Stop requested for {} booster {}", booster.kind, booster.id);
        Some(booster)
    }

    pub fn booster(&self, booster_id: &Uuid) -> Option<Arc<Booster>> {
        self.boosters.get(booster_id)
    }

    pub fn find_booster(&self, owner_id: &str, token: &Pubkey, kind: BoosterKind) -> Option<Arc<Booster>> {
        self.boosters.find(owner_id, token, kind)
    }

    pub fn any_active_for(&self, owner_id: &str) -> Option<Arc<Booster>> {
        self.boosters.any_active_for(owner_id)
    }

    pub async fn get_or_create_owner(&self, owner_id: &str) -> Result<OwnerAccount> {
        if let Some(owner) = self.store.get_owner(owner_id).await? {
            return Ok(owner);
        }
        let owner = OwnerAccount::generate(owner_id);
        self.store.create_owner(&owner).await?;
        info!("👤 Created work wallet {} for {}", owner.wallet_pubkey, owner_id);
        Ok(owner)
    }

    /// Push the owner's usage window out by `by`, counting from now when it
    /// already lapsed. `None` for unknown owners.
    pub async fn extend_usage(&self, owner_id: &str, by: chrono::Duration) -> Result<Option<DateTime<Utc>>> {
        let Some(owner) = self.store.get_owner(owner_id).await? else {
            return Ok(None);
        };
        let until = owner.usage_expires_at.max(Utc::now()) + by;
        if self.store.extend_usage(owner_id, until).await? == 0 {
            return Ok(None);
        }
        info!("⏳ Usage window of {} extended until {}", owner_id, until);
        Ok(Some(until))
    }

    /// `false` for unknown owners.
    pub async fn set_withdraw_address(&self, owner_id: &str, address: &Pubkey) -> Result<bool> {
        let updated = self.store.set_withdraw_address(owner_id, &address.to_string()).await? > 0;
        if updated {
            info!("🏦 Withdrawal address of {} set to {}", owner_id, address);
        }
        Ok(updated)
    }

    /// Send the whole work-wallet balance to the owner's withdrawal address.
    ///
    /// Refused while any booster of the owner is live, and when the wallet
    /// holds no more than `WITHDRAW_RESERVE_LAMPORTS`. Confirmed once the
    /// work wallet is drained.
    pub async fn withdraw(&self, owner_id: &str) -> Result<Withdrawal, WithdrawRejection> {
        let owner = self
            .store
            .get_owner(owner_id)
            .await
            .map_err(withdraw_unavailable)?
            .ok_or_else(|| WithdrawRejection::UnknownOwner(owner_id.to_string()))?;
        let destination: Pubkey = owner
            .withdraw_address
            .as_deref()
            .and_then(|address| address.parse().ok())
            .ok_or(WithdrawRejection::NoAddress)?;
        if let Some(active) = self.any_active_for(owner_id) {
            return Err(WithdrawRejection::BoosterActive { kind: active.kind });
        }

        let keypair = owner.keypair().map_err(withdraw_unavailable)?;
        let wallet = keypair.pubkey();
        let balance = self.ledger.get_balance(&wallet).await.map_err(withdraw_unavailable)?;
        if balance <= WITHDRAW_RESERVE_LAMPORTS {
            return Err(WithdrawRejection::NothingToWithdraw { have_sol: lamports_to_sol(balance) });
        }

        let (signature, lamports) = self
            .ledger
            .transfer_all(&keypair, &destination)
            .await
            .map_err(withdraw_unavailable)?;
        let dust = DEFAULT_SOLANA_FEE_LAMPORTS + PRIORITY_FEE_LAMPORTS;
        if wait_for_balance_at_most(self.ledger.as_ref(), &wallet, dust, self.params.balance_policy)
            .await
            .is_none()
        {
            warn!("Withdrawal {} of {} not confirmed", signature, owner_id);
            return Err(WithdrawRejection::Unconfirmed(destination.to_string()));
        }

        info!("🏦 {} withdrew {:.6} SOL to {}", owner_id, lamports_to_sol(lamports), destination);
        self.notifier.notify(
            owner_id,
            format!("✅ Withdrawal successful! Withdrew {:.4} SOL", lamports_to_sol(lamports)),
        );
        Ok(Withdrawal {
            destination: destination.to_string(),
            lamports,
            signature: signature.to_string(),
        })
    }

    /// Work-wallet balance plus whatever sits in the owner's persisted
    /// puppet wallets.
    pub async fn owner_total_balance(&self, owner: &OwnerAccount) -> Result<u64> {
        let wallet = owner.keypair()?.pubkey();
        let mut total = self.ledger.get_balance(&wallet).await?;

        for record in self.store.puppets_for_owner(&owner.owner_id).await? {
            let Ok(pubkey) = record.pubkey.parse::<Pubkey>() else {
                warn!("Skipping puppet row {} with a malformed pubkey", record.id);
                continue;
            };
            match self.ledger.get_balance(&pubkey).await {
                Ok(balance) => total += balance,
                Err(e) => warn!("Could not read puppet {} balance: {:#}", pubkey, e),
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booster::types::StopReason;
    use crate::test_support::{Harness, wait_until};

    #[tokio::test]
    async fn test_unknown_and_expired_owners_are_rejected() {
        let h = Harness::new();
        let token = Pubkey::new_unique();

        let unknown = h.runtime.start_booster("nobody", BoosterKind::Volume, token, None).await;
        assert_eq!(unknown.err(), Some(StartRejection::UnknownOwner("nobody".to_string())));

        h.runtime.get_or_create_owner("7").await.unwrap();
        let expired = h.runtime.start_booster("7", BoosterKind::Volume, token, None).await;
        assert_eq!(expired.err(), Some(StartRejection::UsageExpired));

        let notes = h.notifier.messages_for("7");
        assert_eq!(notes.len(), 1);
        assert!(notes[0].contains("expired"));
    }

    #[tokio::test]
    async fn test_active_booster_blocks_owner() {
        let h = Harness::new();
        let owner = h.owner("7", 1_000_000_000).await;
        let token = Pubkey::new_unique();
        let running = h.booster(&owner, BoosterKind::Volume, token, Settings::default());
        h.runtime.boosters.insert(running).unwrap();

        let duplicate = h.runtime.start_booster("7", BoosterKind::Volume, token, None).await;
        assert_eq!(duplicate.err(), Some(StartRejection::DuplicateActive { kind: BoosterKind::Volume }));

        let other_token = h.runtime.start_booster("7", BoosterKind::Rank, Pubkey::new_unique(), None).await;
        assert!(matches!(other_token, Err(StartRejection::OwnerBusy { kind: BoosterKind::Volume, .. })));
        assert!(h.store.booster_rows().is_empty());
    }

    #[tokio::test]
    async fn test_withdraw_drains_the_work_wallet() {
        let h = Harness::new();
        let owner = h.owner("7", 50_000_000).await;
        let wallet = owner.keypair().unwrap().pubkey();
        let destination = Pubkey::new_unique();

        assert_eq!(h.runtime.withdraw("7").await.err(), Some(WithdrawRejection::NoAddress));
        assert!(h.runtime.set_withdraw_address("7", &destination).await.unwrap());

        let withdrawal = h.runtime.withdraw("7").await.unwrap();
        assert_eq!(withdrawal.destination, destination.to_string());
        assert_eq!(h.ledger.balance(&wallet), 0);
        assert_eq!(h.ledger.balance(&destination), withdrawal.lamports);
        assert!(h.notifier.messages_for("7").iter().any(|m| m.contains("Withdrawal successful")));
    }

    #[tokio::test]
    async fn test_withdraw_refused_while_a_booster_runs_or_below_reserve() {
        let h = Harness::new();
        let owner = h.owner("7", 50_000_000).await;
        h.runtime.set_withdraw_address("7", &Pubkey::new_unique()).await.unwrap();
        let running = h.booster(&owner, BoosterKind::Rank, Pubkey::new_unique(), Settings::default());
        h.runtime.boosters.insert(running.clone()).unwrap();

        assert_eq!(
            h.runtime.withdraw("7").await.err(),
            Some(WithdrawRejection::BoosterActive { kind: BoosterKind::Rank })
        );
        assert!(h.ledger.transfers().is_empty());

        h.runtime.boosters.remove(&running.id);
        h.ledger.set_balance(&owner.keypair().unwrap().pubkey(), WITHDRAW_RESERVE_LAMPORTS);
        assert!(matches!(
            h.runtime.withdraw("7").await,
            Err(WithdrawRejection::NothingToWithdraw { .. })
        ));
        assert!(h.ledger.transfers().is_empty());
        assert_eq!(h.runtime.withdraw("nobody").await.err(), Some(WithdrawRejection::UnknownOwner("nobody".into())));
    }

    #[tokio::test]
    async fn test_insufficient_total_balance_is_rejected() {
        let h = Harness::new();
        h.owner("7", 10_000_000).await;

        let rejected = h.runtime.start_booster("7", BoosterKind::Rank, Pubkey::new_unique(), None).await;
        assert!(matches!(rejected, Err(StartRejection::InsufficientBalance { .. })));
        assert!(h.notifier.messages_for("7")[0].contains("0.0150 SOL required"));
    }

    #[tokio::test]
    async fn test_parked_puppet_funds_count_toward_the_floor() {
        let h = Harness::new();
        let owner = h.owner("7", 10_000_000).await;
        h.orphan(&owner, 10_000_000).await;

        assert_eq!(h.runtime.owner_total_balance(&owner).await.unwrap(), 20_000_000);
    }

    #[tokio::test]
    async fn test_stale_rows_are_replaced_on_start() {
        let h = Harness::new();
        h.owner("7", 20_000_000).await;
        let token = Pubkey::new_unique();
        let stale = BoosterRecord {
            id: Uuid::new_v4(),
            owner_id: "7".to_string(),
            token_address: token.to_string(),
            kind: BoosterKind::Volume,
            created_at: Utc::now(),
        };
        h.store.insert_booster(&stale).await.unwrap();

        let booster = h.runtime.start_booster("7", BoosterKind::Volume, token, None).await.unwrap();
        assert!(h.store.deleted_boosters().contains(&stale.id));

        // 0.02 SOL cannot fund the default pool, so the run aborts on its own
        assert!(wait_until(|| h.runtime.booster(&booster.id).is_none()).await);
        assert_eq!(booster.stop_reason(), Some(StopReason::StartAborted));
        assert!(h.store.booster_rows().is_empty());
    }

    #[tokio::test]
    async fn test_extend_usage_counts_from_now_when_lapsed() {
        let h = Harness::new();
        h.runtime.get_or_create_owner("7").await.unwrap();
        assert!(h.runtime.extend_usage("nobody", chrono::Duration::days(1)).await.unwrap().is_none());

        let before = Utc::now();
        let until = h.runtime.extend_usage("7", chrono::Duration::days(1)).await.unwrap().unwrap();
        assert!(until >= before + chrono::Duration::days(1));

        let later = h.runtime.extend_usage("7", chrono::Duration::days(1)).await.unwrap().unwrap();
        assert_eq!(later, until + chrono::Duration::days(1));
        let owner = h.store.get_owner("7").await.unwrap().unwrap();
        assert!(!owner.usage_expired(Utc::now()));
    }
}
