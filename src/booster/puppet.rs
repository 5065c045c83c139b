//! Puppet (worker) state machine.
//!
//! `Spawned → Funded → Running → Exiting(rotate | salvage) → Gone`. A puppet
//! is registered live from the moment it is spawned until it is dropped; its
//! persisted row outlives it until its funds are confirmed reclaimed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use solana_sdk::{
    native_token::lamports_to_sol,
    pubkey::Pubkey,
    signature::{Keypair, Signer},
};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::booster::behavior::{PuppetBehavior, PuppetExit, behavior_for};
use crate::booster::campaign::Booster;
use crate::booster::policy::RESERVED_PUPPET_BALANCE;
use crate::booster::registry::PuppetControl;
use crate::booster::runtime::BoosterRuntime;
use crate::booster::types::{BoosterKind, Settings};
use crate::database::models::PuppetRecord;
use crate::services::bundler::submit_atomic;
use crate::services::ledger::{
    DEFAULT_SOLANA_FEE_LAMPORTS, Ledger, PRIORITY_FEE_LAMPORTS, close_asset_account_instructions,
    wait_for_balance_at_most, wait_for_balance_change,
};

/// Consecutive balance read failures before a puppet gives up trading.
const MAX_BALANCE_FAILURES: usize = 5;

pub struct Puppet {
    keypair: Keypair,
    runtime: Arc<BoosterRuntime>,
    booster: Weak<Booster>,
    pub booster_id: Uuid,
    owner_id: String,
    /// The booster wallet funds return to
    home: Pubkey,
    token: Pubkey,
    kind: BoosterKind,
    control: Arc<PuppetControl>,
    last_balance: AtomicU64,
    token_account: Mutex<Option<Pubkey>>,
}

impl Puppet {
    /// A fresh wallet, registered live and attached to `booster`.
    pub fn spawn(rt: &Arc<BoosterRuntime>, booster: &Arc<Booster>) -> Self {
        loop {
            if let Some(puppet) = Self::bind(rt, booster, Keypair::new()) {
                return puppet;
            }
        }
    }

    /// Take over a wallet recovered from a persisted row. `None` if some
    /// other task already holds it.
    pub fn adopt(rt: &Arc<BoosterRuntime>, booster: &Arc<Booster>, keypair: Keypair) -> Option<Self> {
        Self::bind(rt, booster, keypair)
    }

    fn bind(rt: &Arc<BoosterRuntime>, booster: &Arc<Booster>, keypair: Keypair) -> Option<Self> {
        let pubkey = keypair.pubkey();
        let control = rt.puppets.claim(pubkey, booster.id)?;
        booster.attach(pubkey);
        Some(Self {
            keypair,
            runtime: rt.clone(),
            booster: Arc::downgrade(booster),
            booster_id: booster.id,
            owner_id: booster.owner_id.clone(),
            home: booster.pubkey(),
            token: booster.token,
            kind: booster.kind,
            control,
            last_balance: AtomicU64::new(0),
            token_account: Mutex::new(None),
        })
    }

    pub fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    pub(crate) fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub(crate) fn ledger(&self) -> &dyn Ledger {
        self.runtime.ledger.as_ref()
    }

    pub fn token(&self) -> Pubkey {
        self.token
    }

    pub fn last_balance(&self) -> u64 {
        self.last_balance.load(Ordering::SeqCst)
    }

    /// The puppet's account for the target asset, resolved lazily and
    /// cached once it exists.
    pub(crate) async fn token_account(&self) -> anyhow::Result<Option<Pubkey>> {
        if let Some(account) = *self.token_account.lock() {
            return Ok(Some(account));
        }
        let account = self.ledger().get_asset_account(&self.pubkey(), &self.token).await?;
        if account.is_some() {
            *self.token_account.lock() = account;
        }
        Ok(account)
    }

    async fn refresh_balance(&self) -> Option<u64> {
        match self.ledger().get_balance(&self.pubkey()).await {
            Ok(balance) => {
                self.last_balance.store(balance, Ordering::SeqCst);
                Some(balance)
            }
            Err(e) => {
                debug!("[puppet:{}] balance fetch failed: {:#}", self.pubkey(), e);
                None
            }
        }
    }

    fn settings(&self) -> Settings {
        self.booster.upgrade().map(|b| b.settings()).unwrap_or_default()
    }

    fn should_stop(&self) -> bool {
        self.control.stop_requested() || self.booster.upgrade().is_none_or(|b| b.winding_down())
    }

    /// Persist the puppet, then have the booster fund it. The row goes first
    /// so a funding that lands late is still recoverable by a sweep.
    pub async fn fund(&self, lamports: u64) -> bool {
        let rt = &self.runtime;
        let Some(booster) = self.booster.upgrade() else {
            return false;
        };
        let record = PuppetRecord::new(&self.owner_id, self.booster_id, &self.keypair);
        if let Err(e) = rt.store.insert_puppet(&record).await {
            warn!("[puppet:{}] could not persist before funding: {:#}", self.pubkey(), e);
            return false;
        }

        if booster.send_funds(rt, &self.pubkey(), lamports).await {
            self.refresh_balance().await;
            return true;
        }
        match self.ledger().get_balance(&self.pubkey()).await {
            Ok(0) => self.forget().await,
            Ok(balance) => warn!(
                "[puppet:{}] funding unconfirmed but {} lamports arrived; keeping row",
                self.pubkey(),
                balance
            ),
            Err(e) => warn!("[puppet:{}] funding unconfirmed, keeping row: {:#}", self.pubkey(), e),
        }
        false
    }

    /// Drive the puppet to completion. Boxed so a rotation can spawn its
    /// successor's run from inside this one.
    pub fn run(self) -> BoxFuture<'static, ()> {
        async move {
            let Some(mut behavior) = behavior_for(self.kind) else {
                warn!("[puppet:{}] {} boosters do not run puppets", self.pubkey(), self.kind);
                self.reclaim(&self.home, true).await;
                return;
            };
            let exit = self.trade(behavior.as_mut()).await;
            info!("[puppet:{}] leaving trade loop: {:?}", self.pubkey(), exit);

            match exit {
                PuppetExit::RotationDue => self.rotate().await,
                _ => {
                    self.reclaim(&self.home, true).await;
                }
            }
        }
        .boxed()
    }

    async fn trade(&self, behavior: &mut dyn PuppetBehavior) -> PuppetExit {
        let rt = self.runtime.clone();
        let mut balance_failures = 0;
        loop {
            if self.should_stop() {
                return PuppetExit::StopRequested;
            }
            let settings = self.settings();
            let balance = match self.refresh_balance().await {
                Some(balance) => {
                    balance_failures = 0;
                    balance
                }
                None => {
                    balance_failures += 1;
                    if balance_failures >= MAX_BALANCE_FAILURES {
                        return PuppetExit::BalanceUnavailable;
                    }
                    tokio::time::sleep(rt.params.retry_delay).await;
                    continue;
                }
            };
            if balance < RESERVED_PUPPET_BALANCE {
                return PuppetExit::OutOfFunds;
            }
            if let Some(exit) = behavior.local_stop(balance, &settings) {
                return exit;
            }

            let operation = match behavior.build_atomic_operation(self, balance).await {
                Ok(operation) => operation,
                Err(e) => {
                    warn!("[puppet:{}] could not build operation: {:#}", self.pubkey(), e);
                    tokio::time::sleep(rt.params.retry_delay).await;
                    continue;
                }
            };
            let effect = operation.effect;
            let tip = rt.tips.tip_for(&settings.jito_tip);
            let landed = submit_atomic(
                rt.bundler.as_ref(),
                operation.transactions,
                &self.keypair,
                tip,
                rt.params.bundle_timeout,
            )
            .await;

            if let Some(booster) = self.booster.upgrade() {
                if landed {
                    booster.record(&effect);
                } else {
                    booster.record_failure(&effect);
                }
            }
            if landed {
                behavior.on_landed(&effect);
                self.pace(behavior.pause(&settings, rt.params.pacing_unit)).await;
            } else {
                tokio::time::sleep(rt.params.retry_delay).await;
            }
        }
    }

    /// Sleep in short slices so a stop request is noticed mid-pause.
    async fn pace(&self, pause: Duration) {
        if pause.is_zero() {
            tokio::task::yield_now().await;
            return;
        }
        let deadline = Instant::now() + pause;
        let slice = self.runtime.params.pacing_slice;
        while !self.should_stop() {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            tokio::time::sleep((deadline - now).min(slice)).await;
        }
    }

    /// Hand the whole balance to a fresh successor and start it without
    /// waiting on it. Falls back to salvaging home if the hand-off fails.
    async fn rotate(self) {
        let rt = self.runtime.clone();
        let Some(booster) = self.booster.upgrade() else {
            // nobody to rotate for; the row stays for the next sweep
            return;
        };
        let successor = Puppet::spawn(&rt, &booster);
        let record = PuppetRecord::new(&self.owner_id, self.booster_id, &successor.keypair);
        if let Err(e) = rt.store.insert_puppet(&record).await {
            warn!("[puppet:{}] could not persist successor: {:#}", self.pubkey(), e);
            drop(successor);
            self.reclaim(&self.home, true).await;
            return;
        }

        if self.reclaim(&successor.pubkey(), true).await {
            booster.with_metrics(|m| m.unique_wallets += 1);
            info!("🔄 [puppet:{}] rotated into {}", self.pubkey(), successor.pubkey());
            tokio::spawn(successor.run());
            return;
        }

        warn!("[puppet:{}] rotation failed, salvaging home", self.pubkey());
        match rt.ledger.get_balance(&successor.pubkey()).await {
            Ok(0) => successor.forget().await,
            _ => debug!("[puppet:{}] successor row kept for the next sweep", successor.pubkey()),
        }
        drop(successor);
        self.reclaim(&self.home, true).await;
    }

    /// Move everything this wallet holds to `dest`: the target asset first
    /// (closing its account), then all native balance. With `delete_record`
    /// the persisted row is removed once the wallet is confirmed drained.
    pub async fn reclaim(&self, dest: &Pubkey, delete_record: bool) -> bool {
        let pubkey = self.pubkey();
        let rt = &self.runtime;

        let mut balance = match self.refresh_balance().await {
            Some(balance) => balance,
            None => {
                tokio::time::sleep(rt.params.retry_delay).await;
                match self.refresh_balance().await {
                    Some(balance) => balance,
                    None => {
                        warn!("[puppet:{}] balance unavailable, salvage postponed", pubkey);
                        return false;
                    }
                }
            }
        };

        match self.token_account().await {
            Ok(Some(account)) => {
                if !self.close_token_account(&account, balance).await {
                    warn!("[puppet:{}] token account {} not closed, keeping row", pubkey, account);
                    return false;
                }
                // rent comes back to this wallet; fall back to the old balance if it is slow
                balance = wait_for_balance_change(rt.ledger.as_ref(), &pubkey, balance, rt.params.balance_policy)
                    .await
                    .unwrap_or(balance);
            }
            Ok(None) => {}
            Err(e) => {
                warn!("[puppet:{}] token account lookup failed, keeping row: {:#}", pubkey, e);
                return false;
            }
        }

        let dust = DEFAULT_SOLANA_FEE_LAMPORTS + PRIORITY_FEE_LAMPORTS;
        if balance <= dust {
            debug!("[puppet:{}] {} lamports left, nothing worth moving", pubkey, balance);
            if delete_record {
                self.forget().await;
            }
            return true;
        }

        let amount = match rt.ledger.transfer_all(&self.keypair, dest).await {
            Ok((_, amount)) => amount,
            Err(e) => {
                warn!("[puppet:{}] salvage transfer failed, keeping row: {:#}", pubkey, e);
                return false;
            }
        };
        // only a drained wallet counts; any late credit keeps the row
        match wait_for_balance_at_most(rt.ledger.as_ref(), &pubkey, dust, rt.params.balance_policy).await {
            Some(_) => {
                info!("♻️ [puppet:{}] moved {:.6} SOL to {}", pubkey, lamports_to_sol(amount), dest);
                if delete_record {
                    self.forget().await;
                }
                true
            }
            None => {
                warn!("[puppet:{}] salvage to {} unconfirmed, keeping row", pubkey, dest);
                false
            }
        }
    }

    async fn close_token_account(&self, account: &Pubkey, balance: u64) -> bool {
        let rt = &self.runtime;
        let held = match rt.ledger.get_asset_balance(account).await {
            Ok(held) => held,
            Err(e) => {
                warn!("[puppet:{}] token balance unavailable: {:#}", self.pubkey(), e);
                return false;
            }
        };
        // tokens always go home; only native balance follows a rotation
        let instructions = match close_asset_account_instructions(&self.pubkey(), &self.home, &self.token, held) {
            Ok(instructions) => instructions,
            Err(e) => {
                warn!("[puppet:{}] could not build close instructions: {:#}", self.pubkey(), e);
                return false;
            }
        };
        let transaction = match rt.ledger.compile(&self.keypair, &instructions).await {
            Ok(transaction) => transaction,
            Err(e) => {
                warn!("[puppet:{}] could not compile close transaction: {:#}", self.pubkey(), e);
                return false;
            }
        };
        let tip = rt.tips.tip_for(&self.settings().jito_tip);
        if tip >= balance {
            warn!("[puppet:{}] cannot afford the tip to close its token account", self.pubkey());
            return false;
        }
        let closed = submit_atomic(rt.bundler.as_ref(), vec![transaction], &self.keypair, tip, rt.params.bundle_timeout).await;
        if closed {
            *self.token_account.lock() = None;
            debug!("[puppet:{}] closed token account {} ({} units home)", self.pubkey(), account, held);
        }
        closed
    }

    /// Delete the persisted row: the wallet is reconciled.
    async fn forget(&self) {
        match self.runtime.store.delete_puppet(&self.pubkey().to_string()).await {
            Ok(_) => debug!("[puppet:{}] row deleted", self.pubkey()),
            Err(e) => warn!("[puppet:{}] row delete failed, a later sweep will retry: {:#}", self.pubkey(), e),
        }
    }
}

impl Drop for Puppet {
    fn drop(&mut self) {
        let pubkey = self.keypair.pubkey();
        self.runtime.puppets.release(&pubkey);
        if let Some(booster) = self.booster.upgrade() {
            booster.detach(&pubkey);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booster::store::BoosterStore;
    use crate::booster::types::TipSetting;
    use crate::test_support::{Harness, wait_until};

    const START: u64 = 20_000_000;

    async fn rank_puppet(h: &Harness, settings: Settings) -> (Arc<Booster>, Puppet) {
        puppet_of(h, BoosterKind::Rank, settings).await
    }

    async fn puppet_of(h: &Harness, kind: BoosterKind, settings: Settings) -> (Arc<Booster>, Puppet) {
        let owner = h.owner("7", 1_000_000_000).await;
        let booster = h.booster(&owner, kind, Pubkey::new_unique(), settings);
        h.runtime.boosters.insert(booster.clone()).unwrap();
        let puppet = Puppet::spawn(&h.runtime, &booster);
        h.store
            .insert_puppet(&PuppetRecord::new("7", booster.id, puppet.keypair()))
            .await
            .unwrap();
        h.ledger.set_balance(&puppet.pubkey(), START);
        (booster, puppet)
    }

    #[tokio::test]
    async fn test_rotation_hands_balance_to_successor() {
        let h = Harness::new();
        let settings = Settings {
            rank_rotate_every_n_tx: 4,
            jito_tip: TipSetting::Lamports(1_000),
            ..Settings::default()
        };
        let (booster, puppet) = rank_puppet(&h, settings).await;
        let first = puppet.pubkey();

        puppet.run().await;
        // the successor has been spawned but not yet polled
        booster.request_stop();

        let outgoing: Vec<_> = h.ledger.transfers().into_iter().filter(|(from, _, _)| *from == first).collect();
        assert_eq!(outgoing.len(), 1);
        let successor = outgoing[0].1;
        assert_ne!(successor, booster.pubkey());
        assert_eq!(booster.metrics().unique_wallets, 1);
        // the drained predecessor's row goes as soon as the hand-off lands
        let rows: Vec<_> = h.store.puppet_rows().into_iter().map(|r| r.pubkey).collect();
        assert!(!rows.contains(&first.to_string()));
        assert!(rows.contains(&successor.to_string()));
        assert_eq!(h.store.deleted_puppets(), vec![first.to_string()]);

        assert!(wait_until(|| !h.runtime.puppets.is_live(&successor)).await);
        assert!(h.store.deleted_puppets().contains(&successor.to_string()));
    }

    #[tokio::test]
    async fn test_out_of_funds_salvages_to_booster() {
        let h = Harness::new();
        let settings = Settings {
            rank_rotate_every_n_tx: 1_000,
            jito_tip: TipSetting::Lamports(8_000_000),
            ..Settings::default()
        };
        let (booster, puppet) = rank_puppet(&h, settings).await;
        let pubkey = puppet.pubkey();

        puppet.run().await;

        let outgoing: Vec<_> = h.ledger.transfers().into_iter().filter(|(from, _, _)| *from == pubkey).collect();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].1, booster.pubkey());
        assert_eq!(h.store.deleted_puppets(), vec![pubkey.to_string()]);
        assert!(!h.runtime.puppets.is_live(&pubkey));
        assert_eq!(booster.live_puppets(), 0);
    }

    #[tokio::test]
    async fn test_volume_puppet_opens_account_then_trades_until_empty() {
        let h = Harness::new();
        let settings = Settings {
            volume_speed: 5,
            jito_tip: TipSetting::Lamports(3_000_000),
            ..Settings::default()
        };
        let (booster, puppet) = puppet_of(&h, BoosterKind::Volume, settings).await;
        h.ledger.credit_tokens_on_buy(&booster.token, 1_000);
        let pubkey = puppet.pubkey();

        puppet.run().await;

        // opening buy, four buy/buy/sell cycles, then the account close
        let sizes: Vec<usize> = h.bundler.submissions().iter().map(|(_, txs, _)| *txs).collect();
        assert_eq!(sizes, vec![1, 3, 3, 3, 3, 1]);
        let metrics = booster.metrics();
        assert_eq!((metrics.buys, metrics.sells, metrics.txs), (9, 4, 13));
        assert_eq!(h.ledger.balance(&pubkey), 0);
        assert_eq!(h.store.deleted_puppets(), vec![pubkey.to_string()]);
    }

    #[tokio::test]
    async fn test_unconfirmed_salvage_keeps_the_row() {
        let h = Harness::new();
        let (booster, puppet) = rank_puppet(&h, Settings::default()).await;
        h.ledger.stall_transfers_from(&puppet.pubkey());

        assert!(!puppet.reclaim(&booster.pubkey(), true).await);
        assert!(h.store.deleted_puppets().is_empty());
        assert_eq!(h.store.puppet_rows().len(), 1);
    }

    #[tokio::test]
    async fn test_credit_during_unconfirmed_salvage_keeps_the_row() {
        let h = Harness::new();
        let (booster, puppet) = rank_puppet(&h, Settings::default()).await;
        let pubkey = puppet.pubkey();
        h.ledger.stall_transfers_from(&pubkey);

        let ledger = h.ledger.clone();
        let credit = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            ledger.set_balance(&pubkey, START + 1_000_000);
        });

        assert!(!puppet.reclaim(&booster.pubkey(), true).await);
        credit.await.unwrap();
        assert!(h.store.deleted_puppets().is_empty());
        assert_eq!(h.store.puppet_rows().len(), 1);
        assert_eq!(h.ledger.balance(&pubkey), START + 1_000_000);
    }

    #[tokio::test]
    async fn test_confirmed_salvage_deletes_exactly_once() {
        let h = Harness::new();
        let (booster, puppet) = rank_puppet(&h, Settings::default()).await;

        assert!(puppet.reclaim(&booster.pubkey(), true).await);
        // a second pass finds an empty wallet and must not delete again
        assert!(puppet.reclaim(&booster.pubkey(), false).await);

        assert_eq!(h.store.deleted_puppets(), vec![puppet.pubkey().to_string()]);
        assert_eq!(h.ledger.balance(&puppet.pubkey()), 0);
    }

    #[tokio::test]
    async fn test_token_holdings_go_home_before_native_balance() {
        let h = Harness::new();
        let (booster, puppet) = rank_puppet(&h, Settings { jito_tip: TipSetting::Lamports(1_000), ..Settings::default() }).await;
        h.ledger.set_tokens(&puppet.pubkey(), &booster.token, 5_000);

        assert!(puppet.reclaim(&booster.pubkey(), true).await);

        let bundles = h.bundler.submissions();
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].0, puppet.pubkey());
        assert_eq!(h.ledger.balance(&puppet.pubkey()), 0);
    }

    #[tokio::test]
    async fn test_dropping_a_puppet_deregisters_it() {
        let h = Harness::new();
        let (booster, puppet) = rank_puppet(&h, Settings::default()).await;
        let pubkey = puppet.pubkey();
        assert!(h.runtime.puppets.is_live(&pubkey));
        assert_eq!(booster.live_puppets(), 1);

        drop(puppet);
        assert!(!h.runtime.puppets.is_live(&pubkey));
        assert_eq!(booster.live_puppets(), 0);
    }
}
