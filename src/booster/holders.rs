//! Holder distribution: the booster buys one bag per expected holder and
//! hands the bags to freshly generated wallets, four per bundle.

use std::sync::Arc;

use anyhow::{Context, Result};
use solana_sdk::{
    native_token::lamports_to_sol,
    pubkey::Pubkey,
    signature::{Keypair, Signer},
};
use tracing::{info, warn};

use crate::booster::behavior::OperationEffect;
use crate::booster::campaign::Booster;
use crate::booster::policy::{
    HOLDER_BAG_LAMPORTS, HOLDER_COST_LAMPORTS, HOLDERS_PER_OPERATION, SWAP_SLIPPAGE_BPS, evaluate_stop,
};
use crate::booster::runtime::BoosterRuntime;
use crate::booster::salvage;
use crate::booster::types::{BoosterStatus, StopReason};
use crate::services::bundler::submit_atomic;
use crate::services::ledger::transfer_asset_instructions;

/// How many new holders the current balance can pay for, up to `goal`.
pub fn affordable_holders(balance: u64, floor: u64, goal: u64) -> u64 {
    goal.min(balance.saturating_sub(floor) / HOLDER_COST_LAMPORTS)
}

pub(crate) async fn run_holders(booster: &Arc<Booster>, rt: &Arc<BoosterRuntime>) -> Option<StopReason> {
    match salvage::sweep_orphans(rt, booster).await {
        Ok(report) if report.found > 0 => info!("[booster:{}] pre-start sweep: {:?}", booster.id, report),
        Ok(_) => {}
        Err(e) => warn!("[booster:{}] pre-start sweep skipped: {:#}", booster.id, e),
    }
    booster.sell_stale_holdings(rt).await;

    let batch = match prepare(booster, rt).await {
        Ok(batch) => batch,
        Err(e) => {
            warn!("[booster:{}] holders preparation failed: {:#}", booster.id, e);
            rt.notifier.notify(&booster.owner_id, format!("❌ Holders booster could not start: {}", e));
            return Some(StopReason::StartAborted);
        }
    };

    booster.set_status(BoosterStatus::Running);
    let reason = distribute(booster, rt, batch).await;
    booster.set_status(BoosterStatus::Stopping);
    Some(reason)
}

/// Bought bags: how many there are and the token share each one holds.
#[derive(Debug, Clone, Copy)]
struct Bags {
    count: u64,
    share: u64,
}

/// Buy one bag per affordable holder. The requested goal is left as is.
async fn prepare(booster: &Booster, rt: &BoosterRuntime) -> Result<Bags> {
    let balance = booster.refresh_balance(rt).await.context("balance unavailable")?;
    let goal = booster.settings().holders_new_holders as u64;
    let expected = affordable_holders(balance, booster.floor(), goal);
    if expected == 0 {
        anyhow::bail!(
            "{:.4} SOL does not cover a single new holder",
            lamports_to_sol(balance.saturating_sub(booster.floor()))
        );
    }

    let wsol = spl_token::native_mint::ID;
    let bags = (expected + 1) * HOLDER_BAG_LAMPORTS;
    let swap = rt
        .ledger
        .build_swap(booster.keypair(), &wsol, &booster.token, bags, SWAP_SLIPPAGE_BPS)
        .await?;
    let tip = rt.tips.tip_for(&booster.settings().jito_tip);
    if !submit_atomic(rt.bundler.as_ref(), vec![swap.transaction], booster.keypair(), tip, rt.params.bundle_timeout).await {
        anyhow::bail!("the bag purchase did not land");
    }
    booster.record(&OperationEffect {
        txs: 1,
        buys: 1,
        buy_volume: bags,
        ..Default::default()
    });

    let held = wait_for_holdings(booster, rt).await?;
    let share = held / (expected + 1);
    if share == 0 {
        anyhow::bail!("bought too few tokens to split between {} holders", expected);
    }
    info!(
        "[booster:{}] distributing {} units to each of {} new holders",
        booster.id, share, expected
    );
    Ok(Bags { count: expected, share })
}

async fn wait_for_holdings(booster: &Booster, rt: &BoosterRuntime) -> Result<u64> {
    let policy = rt.params.balance_policy;
    let deadline = tokio::time::Instant::now() + policy.timeout;
    loop {
        if let Some(account) = rt.ledger.get_asset_account(&booster.pubkey(), &booster.token).await? {
            let held = rt.ledger.get_asset_balance(&account).await?;
            if held > 0 {
                return Ok(held);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("purchased tokens never showed up");
        }
        tokio::time::sleep(policy.interval).await;
    }
}

async fn distribute(booster: &Booster, rt: &BoosterRuntime, bags: Bags) -> StopReason {
    loop {
        let balance = booster.refresh_balance(rt).await.unwrap_or_else(|| booster.last_balance());
        let probe = booster.stop_probe(balance);
        if let Some(reason) = evaluate_stop(booster.kind, &probe) {
            return reason;
        }
        if probe.holders_added >= bags.count {
            // every bought bag is out but the goal was beyond the budget
            return StopReason::OutOfFunds;
        }

        let remaining = probe.holder_goal.min(bags.count).saturating_sub(probe.holders_added) as usize;
        let receivers: Vec<Pubkey> = (0..remaining.min(HOLDERS_PER_OPERATION))
            .map(|_| Keypair::new().pubkey())
            .collect();
        match send_bags(booster, rt, &receivers, bags.share).await {
            Ok(true) => {
                let added = receivers.len() as u64;
                booster.with_metrics(|m| {
                    m.txs += added;
                    m.unique_wallets += added;
                });
            }
            Ok(false) => booster.with_metrics(|m| m.txs_failed += receivers.len() as u64),
            Err(e) => warn!("[booster:{}] could not build holder batch: {:#}", booster.id, e),
        }
        tokio::time::sleep(rt.params.pacing_unit).await;
    }
}

async fn send_bags(booster: &Booster, rt: &BoosterRuntime, receivers: &[Pubkey], share: u64) -> Result<bool> {
    let mut transactions = Vec::with_capacity(receivers.len());
    for receiver in receivers {
        let instructions = transfer_asset_instructions(&booster.pubkey(), receiver, &booster.token, share)?;
        transactions.push(rt.ledger.compile(booster.keypair(), &instructions).await?);
    }
    let tip = rt.tips.tip_for(&booster.settings().jito_tip);
    Ok(submit_atomic(rt.bundler.as_ref(), transactions, booster.keypair(), tip, rt.params.bundle_timeout).await)
}
