//! Per-kind puppet capabilities: local stop condition, atomic operation
//! builder and pacing. The generic driver loop lives in `puppet`.

use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use rand::Rng;
use solana_sdk::transaction::VersionedTransaction;

use crate::booster::policy::{
    EMPTY_PUPPET_BALANCE, RANK_BUY_LAMPORTS, RANK_BUY_STEP_LAMPORTS, RANK_BUYS_PER_OPERATION, RANK_SLIPPAGE_BPS,
    RESERVED_PUPPET_BALANCE, SWAP_SLIPPAGE_BPS, volume_pause,
};
use crate::booster::puppet::Puppet;
use crate::booster::types::{BoosterKind, Settings};

/// Counters an operation adds to the booster metrics once it lands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationEffect {
    pub txs: u64,
    pub buys: u64,
    pub sells: u64,
    pub buy_volume: u64,
    pub sell_volume: u64,
}

/// A group of transactions that must land together.
pub struct AtomicOperation {
    pub transactions: Vec<VersionedTransaction>,
    pub effect: OperationEffect,
}

/// Why a puppet left its trading loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PuppetExit {
    StopRequested,
    OutOfFunds,
    RotationDue,
    BalanceUnavailable,
}

#[async_trait]
pub trait PuppetBehavior: Send {
    /// Kind-specific exit check, run after the generic stop and floor checks.
    fn local_stop(&self, balance: u64, settings: &Settings) -> Option<PuppetExit>;

    async fn build_atomic_operation(&mut self, puppet: &Puppet, balance: u64) -> Result<AtomicOperation>;

    fn on_landed(&mut self, effect: &OperationEffect);

    fn pause(&self, settings: &Settings, unit: Duration) -> Duration;
}

pub fn behavior_for(kind: BoosterKind) -> Option<Box<dyn PuppetBehavior>> {
    match kind {
        BoosterKind::Volume => Some(Box::new(VolumeBehavior::default())),
        BoosterKind::Rank => Some(Box::new(RankBehavior::default())),
        BoosterKind::Holders | BoosterKind::Salvage => None,
    }
}

// ============================================================================
// VOLUME
// ============================================================================

/// Two buys and one sell per operation, so every cycle is volume-neutral
/// apart from fees.
#[derive(Debug, Default)]
pub struct VolumeBehavior {
    account_ready: bool,
    opening: bool,
}

#[async_trait]
impl PuppetBehavior for VolumeBehavior {
    fn local_stop(&self, balance: u64, _settings: &Settings) -> Option<PuppetExit> {
        (balance < EMPTY_PUPPET_BALANCE).then_some(PuppetExit::OutOfFunds)
    }

    async fn build_atomic_operation(&mut self, puppet: &Puppet, balance: u64) -> Result<AtomicOperation> {
        let ledger = puppet.ledger();
        let signer = puppet.keypair();
        let wsol = spl_token::native_mint::ID;
        let token = puppet.token();

        if !self.account_ready && puppet.token_account().await?.is_none() {
            // a tiny first buy opens the token account the sells draw from
            let swap = ledger.build_swap(signer, &wsol, &token, RANK_BUY_LAMPORTS, SWAP_SLIPPAGE_BPS).await?;
            self.opening = true;
            return Ok(AtomicOperation {
                transactions: vec![swap.transaction],
                effect: OperationEffect { txs: 1, buys: 1, buy_volume: RANK_BUY_LAMPORTS, ..Default::default() },
            });
        }
        self.account_ready = true;
        self.opening = false;

        let spendable = balance.saturating_sub(RESERVED_PUPPET_BALANCE);
        if spendable < 2 {
            bail!("nothing left to trade with");
        }
        let percent = rand::thread_rng().gen_range(25..=75);
        let first = spendable * percent / 100;
        let second = spendable - first;

        let buy_one = ledger.build_swap(signer, &wsol, &token, first, SWAP_SLIPPAGE_BPS).await?;
        let buy_two = ledger.build_swap(signer, &wsol, &token, second, SWAP_SLIPPAGE_BPS).await?;
        let held = match puppet.token_account().await? {
            Some(account) => ledger.get_asset_balance(&account).await?,
            None => 0,
        };
        let sell_amount = buy_one.quote.min_out_amount + buy_two.quote.min_out_amount + held;
        let sell = ledger.build_swap(signer, &token, &wsol, sell_amount, SWAP_SLIPPAGE_BPS).await?;

        Ok(AtomicOperation {
            transactions: vec![buy_one.transaction, buy_two.transaction, sell.transaction],
            effect: OperationEffect {
                txs: 3,
                buys: 2,
                sells: 1,
                buy_volume: spendable,
                sell_volume: sell.quote.out_amount,
            },
        })
    }

    fn on_landed(&mut self, _effect: &OperationEffect) {
        if self.opening {
            self.account_ready = true;
            self.opening = false;
        }
    }

    fn pause(&self, settings: &Settings, unit: Duration) -> Duration {
        volume_pause(settings.volume_speed, unit)
    }
}

// ============================================================================
// RANK
// ============================================================================

/// Micro-buys that count as distinct makers; the wallet rotates after a
/// configured number of buys.
#[derive(Debug, Default)]
pub struct RankBehavior {
    buys_in_rotation: u64,
}

#[async_trait]
impl PuppetBehavior for RankBehavior {
    fn local_stop(&self, _balance: u64, settings: &Settings) -> Option<PuppetExit> {
        (self.buys_in_rotation >= settings.rank_rotate_every_n_tx as u64).then_some(PuppetExit::RotationDue)
    }

    async fn build_atomic_operation(&mut self, puppet: &Puppet, _balance: u64) -> Result<AtomicOperation> {
        let ledger = puppet.ledger();
        let wsol = spl_token::native_mint::ID;
        let token = puppet.token();

        let mut transactions = Vec::with_capacity(RANK_BUYS_PER_OPERATION);
        let mut buy_volume = 0;
        for i in 0..RANK_BUYS_PER_OPERATION {
            // distinct amounts keep the transactions distinct
            let amount = RANK_BUY_LAMPORTS + i as u64 * RANK_BUY_STEP_LAMPORTS;
            let swap = ledger.build_swap(puppet.keypair(), &wsol, &token, amount, RANK_SLIPPAGE_BPS).await?;
            transactions.push(swap.transaction);
            buy_volume += amount;
        }

        Ok(AtomicOperation {
            transactions,
            effect: OperationEffect {
                txs: RANK_BUYS_PER_OPERATION as u64,
                buys: RANK_BUYS_PER_OPERATION as u64,
                buy_volume,
                ..Default::default()
            },
        })
    }

    fn on_landed(&mut self, effect: &OperationEffect) {
        self.buys_in_rotation += effect.buys;
    }

    fn pause(&self, _settings: &Settings, unit: Duration) -> Duration {
        unit
    }
}
