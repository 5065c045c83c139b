//! Booster (campaign) state machine.
//!
//! `Created → Starting → Running → Stopping → Terminated`. A booster owns the
//! owner's work wallet for the duration of one run, funds and tracks its
//! puppet pool (pooled kinds) or trades directly (holders), and reconciles
//! everything before it removes itself from the registry.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use solana_sdk::{
    native_token::lamports_to_sol,
    pubkey::Pubkey,
    signature::{Keypair, Signer},
};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::booster::behavior::OperationEffect;
use crate::booster::policy::{
    DUST_HOLDINGS_VALUE, MAX_SPAWN_RETRIES, MIN_NEW_PUPPET_BUDGET, PUPPET_GAS_RESERVE, SWAP_SLIPPAGE_BPS,
    StopProbe, evaluate_stop, plan_pool_budget, reserved_floor,
};
use crate::booster::puppet::Puppet;
use crate::booster::runtime::BoosterRuntime;
use crate::booster::types::{BoosterKind, BoosterStatus, Metrics, Settings, StopReason};
use crate::booster::{holders, salvage};
use crate::services::bundler::submit_atomic;
use crate::services::ledger::{WatchSide, send_confirmed};

pub struct Booster {
    pub id: Uuid,
    pub owner_id: String,
    pub token: Pubkey,
    pub kind: BoosterKind,
    keypair: Keypair,
    pub started_at: DateTime<Utc>,
    started: Instant,
    status: Mutex<BoosterStatus>,
    stop_requested: AtomicBool,
    last_balance: AtomicU64,
    settings: RwLock<Settings>,
    metrics: Mutex<Metrics>,
    puppets: Mutex<HashSet<Pubkey>>,
    /// Pool slots still trying to fund a puppet
    pending_spawns: AtomicUsize,
    holder_goal: AtomicU64,
    terminated: AtomicBool,
    stop_reason: Mutex<Option<StopReason>>,
}

/// Read-only snapshot handed to the front-end.
#[derive(Debug, Clone, Serialize)]
pub struct BoosterView {
    pub id: Uuid,
    pub owner_id: String,
    pub token: String,
    pub kind: BoosterKind,
    pub status: BoosterStatus,
    pub stop_requested: bool,
    pub stop_reason: Option<StopReason>,
    pub started_at: DateTime<Utc>,
    pub wallet: String,
    pub balance_lamports: u64,
    pub live_puppets: usize,
    pub metrics: Metrics,
    pub buy_volume_usd: f64,
    pub sell_volume_usd: f64,
}

impl Booster {
    pub fn new(id: Uuid, owner_id: &str, token: Pubkey, kind: BoosterKind, keypair: Keypair, settings: Settings) -> Self {
        let holder_goal = settings.holders_new_holders as u64;
        Self {
            id,
            owner_id: owner_id.to_string(),
            token,
            kind,
            keypair,
            started_at: Utc::now(),
            started: Instant::now(),
            status: Mutex::new(BoosterStatus::Created),
            stop_requested: AtomicBool::new(false),
            last_balance: AtomicU64::new(0),
            settings: RwLock::new(settings),
            metrics: Mutex::new(Metrics::default()),
            puppets: Mutex::new(HashSet::new()),
            pending_spawns: AtomicUsize::new(0),
            holder_goal: AtomicU64::new(holder_goal),
            terminated: AtomicBool::new(false),
            stop_reason: Mutex::new(None),
        }
    }

    pub fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    pub(crate) fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn floor(&self) -> u64 {
        reserved_floor(self.kind)
    }

    pub fn status(&self) -> BoosterStatus {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, status: BoosterStatus) {
        let mut current = self.status.lock();
        if *current != status {
            debug!("[booster:{}] {:?} -> {:?}", self.id, *current, status);
            *current = status;
        }
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// True once the booster no longer wants its puppets to trade.
    pub fn winding_down(&self) -> bool {
        self.stop_requested() || matches!(self.status(), BoosterStatus::Stopping | BoosterStatus::Terminated)
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        *self.stop_reason.lock()
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.lock().clone()
    }

    pub(crate) fn with_metrics(&self, update: impl FnOnce(&mut Metrics)) {
        update(&mut self.metrics.lock());
    }

    pub(crate) fn record(&self, effect: &OperationEffect) {
        self.with_metrics(|m| {
            m.txs += effect.txs;
            m.buys += effect.buys;
            m.sells += effect.sells;
            m.buy_volume_lamports += effect.buy_volume;
            m.sell_volume_lamports += effect.sell_volume;
        });
    }

    pub(crate) fn record_failure(&self, effect: &OperationEffect) {
        self.with_metrics(|m| m.txs_failed += effect.txs);
    }

    pub fn last_balance(&self) -> u64 {
        self.last_balance.load(Ordering::SeqCst)
    }

    pub(crate) fn attach(&self, puppet: Pubkey) {
        self.puppets.lock().insert(puppet);
    }

    pub(crate) fn detach(&self, puppet: &Pubkey) {
        self.puppets.lock().remove(puppet);
    }

    pub fn live_puppets(&self) -> usize {
        self.puppets.lock().len()
    }

    /// Fetch the wallet balance and cache it.
    pub(crate) async fn refresh_balance(&self, rt: &BoosterRuntime) -> Option<u64> {
        match rt.ledger.get_balance(&self.pubkey()).await {
            Ok(balance) => {
                self.last_balance.store(balance, Ordering::SeqCst);
                Some(balance)
            }
            Err(e) => {
                warn!("[booster:{}] balance fetch failed: {:#}", self.id, e);
                None
            }
        }
    }

    async fn refresh_settings(&self, rt: &BoosterRuntime) {
        match rt.store.get_settings(&self.owner_id).await {
            Ok(settings) => *self.settings.write() = settings,
            Err(e) => debug!("[booster:{}] keeping cached settings: {:#}", self.id, e),
        }
    }

    pub fn stop_probe(&self, balance: u64) -> StopProbe {
        let settings = self.settings.read();
        StopProbe {
            stop_requested: self.stop_requested(),
            balance,
            floor: self.floor(),
            elapsed: self.started.elapsed(),
            duration_limit: Duration::from_secs(settings.volume_duration_secs),
            live_puppets: self.live_puppets() + self.pending_spawns.load(Ordering::SeqCst),
            holders_added: self.metrics.lock().unique_wallets,
            holder_goal: self.holder_goal.load(Ordering::SeqCst),
        }
    }

    pub fn view(&self, sol_usd: f64) -> BoosterView {
        let metrics = self.metrics();
        BoosterView {
            id: self.id,
            owner_id: self.owner_id.clone(),
            token: self.token.to_string(),
            kind: self.kind,
            status: self.status(),
            stop_requested: self.stop_requested(),
            stop_reason: self.stop_reason(),
            started_at: self.started_at,
            wallet: self.pubkey().to_string(),
            balance_lamports: self.last_balance(),
            live_puppets: self.live_puppets(),
            buy_volume_usd: lamports_to_sol(metrics.buy_volume_lamports) * sol_usd,
            sell_volume_usd: lamports_to_sol(metrics.sell_volume_lamports) * sol_usd,
            metrics,
        }
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    pub async fn run(self: Arc<Self>, rt: Arc<BoosterRuntime>) {
        self.set_status(BoosterStatus::Starting);
        info!("🏁 {} booster {} starting for {}", self.kind, self.id, self.owner_id);

        let reason = match self.kind {
            BoosterKind::Volume | BoosterKind::Rank => self.run_pooled(&rt).await,
            BoosterKind::Holders => holders::run_holders(&self, &rt).await,
            BoosterKind::Salvage => salvage::run_salvage(&self, &rt).await,
        };
        self.terminate(&rt, reason).await;
    }

    async fn run_pooled(self: &Arc<Self>, rt: &Arc<BoosterRuntime>) -> Option<StopReason> {
        match salvage::sweep_orphans(rt, self).await {
            Ok(report) if report.found > 0 => info!("[booster:{}] pre-start sweep: {:?}", self.id, report),
            Ok(_) => {}
            Err(e) => warn!("[booster:{}] pre-start sweep skipped: {:#}", self.id, e),
        }
        self.sell_stale_holdings(rt).await;

        let Some(balance) = self.refresh_balance(rt).await else {
            rt.notifier.notify(&self.owner_id, format!("❌ Could not read the {} booster balance, try again later", self.kind));
            return Some(StopReason::StartAborted);
        };
        let slots = self.settings().parallel_wallets(self.kind);
        let budget = match plan_pool_budget(balance, self.floor(), slots) {
            Ok(budget) => budget,
            Err(shortfall) => {
                warn!("[booster:{}] {}", self.id, shortfall);
                rt.notifier.notify(
                    &self.owner_id,
                    format!(
                        "❌ Not enough funds to start {} wallets: {:.4} SOL available, {:.4} SOL required (short by {:.4} SOL)",
                        shortfall.puppets,
                        lamports_to_sol(shortfall.available),
                        lamports_to_sol(shortfall.required),
                        lamports_to_sol(shortfall.shortfall),
                    ),
                );
                return Some(StopReason::StartAborted);
            }
        };

        info!(
            "👥 [booster:{}] spawning {} puppets with {:.4} SOL each",
            self.id,
            slots,
            lamports_to_sol(budget)
        );
        self.pending_spawns.fetch_add(slots, Ordering::SeqCst);
        for _ in 0..slots {
            tokio::spawn(staff_slot(self.clone(), rt.clone(), budget));
        }

        self.set_status(BoosterStatus::Running);
        let reason = self.watch(rt).await;
        self.wind_down(rt).await;
        Some(reason)
    }

    /// Poll the booster-level stop condition until it fires.
    pub(crate) async fn watch(&self, rt: &BoosterRuntime) -> StopReason {
        loop {
            tokio::time::sleep(rt.params.status_poll_interval).await;
            self.refresh_settings(rt).await;
            // an RPC hiccup keeps the last reading rather than stopping the run
            let balance = match self.refresh_balance(rt).await {
                Some(balance) => balance,
                None => self.last_balance(),
            };
            if let Some(reason) = evaluate_stop(self.kind, &self.stop_probe(balance)) {
                info!("⏹️ [booster:{}] stopping: {:?}", self.id, reason);
                return reason;
            }
        }
    }

    /// Propagate the stop to every puppet and wait until each one has
    /// deregistered, or the stop timeout elapses.
    async fn wind_down(&self, rt: &BoosterRuntime) {
        self.set_status(BoosterStatus::Stopping);
        let flagged = rt.puppets.request_stop_for(self.id);
        debug!("[booster:{}] asked {} puppets to stop", self.id, flagged);

        let deadline = Instant::now() + rt.params.puppet_stop_timeout;
        loop {
            let live = rt.puppets.count_for(self.id);
            let pending = self.pending_spawns.load(Ordering::SeqCst);
            if live == 0 && pending == 0 {
                info!("[booster:{}] all puppets gone", self.id);
                return;
            }
            if Instant::now() >= deadline {
                warn!(
                    "[booster:{}] {} puppets still live after {:?}; their rows stay for the next sweep",
                    self.id, live, rt.params.puppet_stop_timeout
                );
                return;
            }
            // late spawns may have registered after the first flagging pass
            rt.puppets.request_stop_for(self.id);
            tokio::time::sleep(rt.params.puppet_stop_poll).await;
        }
    }

    /// Report, deregister and delete the booster row. Only the first call
    /// does anything.
    pub async fn terminate(&self, rt: &BoosterRuntime, reason: Option<StopReason>) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            debug!("[booster:{}] already terminated", self.id);
            return;
        }
        self.request_stop();
        if let Some(reason) = reason {
            *self.stop_reason.lock() = Some(reason);
            if reason != StopReason::StartAborted {
                rt.notifier.notify(&self.owner_id, reason.message(self.kind));
            }
        }
        if reason != Some(StopReason::StartAborted) {
            if let Some(summary) = self.metrics().summary(self.kind, rt.prices.sol_usd()) {
                rt.notifier.notify(&self.owner_id, summary);
            }
        }

        rt.boosters.remove(&self.id);
        match rt.store.delete_booster(self.id).await {
            Ok(0) => debug!("[booster:{}] row already gone", self.id),
            Ok(_) => {}
            Err(e) => error!("[booster:{}] failed to delete booster row: {:#}", self.id, e),
        }
        self.set_status(BoosterStatus::Terminated);
        info!("🏁 {} booster {} terminated ({:?})", self.kind, self.id, reason);
    }

    // ========================================================================
    // FUNDS
    // ========================================================================

    /// Fund `to` with up to `lamports`, capped so the wallet keeps its floor
    /// and one gas reserve. Confirmed on the receiving side.
    pub(crate) async fn send_funds(&self, rt: &BoosterRuntime, to: &Pubkey, lamports: u64) -> bool {
        let Some(balance) = self.refresh_balance(rt).await else {
            return false;
        };
        let cap = balance.saturating_sub(self.floor()).saturating_sub(PUPPET_GAS_RESERVE);
        let amount = lamports.min(cap);
        if amount < MIN_NEW_PUPPET_BUDGET {
            warn!(
                "[booster:{}] {:.4} SOL left to hand out, not funding {}",
                self.id,
                lamports_to_sol(cap),
                to
            );
            return false;
        }

        let landed = send_confirmed(
            rt.ledger.as_ref(),
            &self.keypair,
            to,
            amount,
            WatchSide::Receiver,
            rt.params.transfer_policy,
        )
        .await;
        if landed {
            info!("💸 [booster:{}] funded {} with {:.4} SOL", self.id, to, lamports_to_sol(amount));
        } else {
            warn!("[booster:{}] could not confirm funding of {}", self.id, to);
        }
        landed
    }

    /// Sell leftover target-asset holdings worth more than dust.
    pub(crate) async fn sell_stale_holdings(&self, rt: &BoosterRuntime) {
        let wsol = spl_token::native_mint::ID;
        let account = match rt.ledger.get_asset_account(&self.pubkey(), &self.token).await {
            Ok(Some(account)) => account,
            Ok(None) => return,
            Err(e) => {
                debug!("[booster:{}] holdings lookup failed: {:#}", self.id, e);
                return;
            }
        };
        let amount = match rt.ledger.get_asset_balance(&account).await {
            Ok(0) | Err(_) => return,
            Ok(amount) => amount,
        };
        match rt.ledger.quote(&self.token, &wsol, amount, SWAP_SLIPPAGE_BPS).await {
            Ok(quote) if quote.out_amount > DUST_HOLDINGS_VALUE => {}
            Ok(_) => return,
            Err(e) => {
                debug!("[booster:{}] holdings quote failed: {:#}", self.id, e);
                return;
            }
        }

        let swap = match rt.ledger.build_swap(&self.keypair, &self.token, &wsol, amount, SWAP_SLIPPAGE_BPS).await {
            Ok(swap) => swap,
            Err(e) => {
                warn!("[booster:{}] could not build stale holdings sale: {:#}", self.id, e);
                return;
            }
        };
        let tip = rt.tips.tip_for(&self.settings().jito_tip);
        if submit_atomic(rt.bundler.as_ref(), vec![swap.transaction], &self.keypair, tip, rt.params.bundle_timeout).await {
            info!(
                "🧹 [booster:{}] sold stale holdings for ~{:.4} SOL",
                self.id,
                lamports_to_sol(swap.quote.out_amount)
            );
        } else {
            warn!("[booster:{}] stale holdings sale did not land", self.id);
        }
    }
}

/// Fill one pool slot: spawn, fund, and run a puppet, respawning a fresh
/// wallet after a failed funding up to `MAX_SPAWN_RETRIES` times.
async fn staff_slot(booster: Arc<Booster>, rt: Arc<BoosterRuntime>, budget: u64) {
    let mut staffed = None;
    for attempt in 0..=MAX_SPAWN_RETRIES {
        if booster.winding_down() {
            break;
        }
        let puppet = Puppet::spawn(&rt, &booster);
        if puppet.fund(budget).await {
            booster.with_metrics(|m| m.unique_wallets += 1);
            staffed = Some(puppet);
            break;
        }
        warn!(
            "[booster:{}] funding attempt {}/{} failed",
            booster.id,
            attempt + 1,
            MAX_SPAWN_RETRIES + 1
        );
        tokio::time::sleep(rt.params.retry_delay).await;
    }
    booster.pending_spawns.fetch_sub(1, Ordering::SeqCst);

    match staffed {
        Some(puppet) => puppet.run().await,
        None => warn!("[booster:{}] leaving a pool slot unfilled", booster.id),
    }
}
