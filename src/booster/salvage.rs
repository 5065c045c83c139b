//! Salvage sweep: reclaim funds from persisted puppet wallets that no live
//! task owns, e.g. after a crash or a timed-out stop.

use std::sync::Arc;

use anyhow::Result;
use futures::future::join_all;
use serde::Serialize;
use solana_sdk::{native_token::lamports_to_sol, pubkey::Pubkey};
use tracing::{info, warn};

use crate::booster::campaign::Booster;
use crate::booster::puppet::Puppet;
use crate::booster::runtime::BoosterRuntime;
use crate::booster::types::{BoosterStatus, StopReason};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Persisted rows for the owner
    pub found: usize,
    pub emptied: usize,
    pub failed: usize,
    /// Rows owned by a live puppet (or claimed by a concurrent sweep)
    pub skipped_live: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    NothingToDo,
    FullyEmptied,
    PartiallyEmptied,
    Failed,
}

impl SweepReport {
    pub fn orphans(&self) -> usize {
        self.found - self.skipped_live
    }

    pub fn outcome(&self, before: u64, after: u64) -> SweepOutcome {
        if self.orphans() == 0 {
            SweepOutcome::NothingToDo
        } else if self.failed == 0 {
            SweepOutcome::FullyEmptied
        } else if after != before {
            SweepOutcome::PartiallyEmptied
        } else {
            SweepOutcome::Failed
        }
    }
}

impl SweepOutcome {
    pub fn message(&self, before: u64, after: u64) -> String {
        match self {
            SweepOutcome::NothingToDo => "🤷 No wallets to salvage".to_string(),
            SweepOutcome::FullyEmptied => format!(
                "✅ All wallets emptied\nBalance before: {:.4} SOL\nBalance after: {:.4} SOL",
                lamports_to_sol(before),
                lamports_to_sol(after)
            ),
            SweepOutcome::PartiallyEmptied => format!(
                "⚠️ Some wallets were emptied, others failed; run salvage again later\nBalance before: {:.4} SOL\nBalance after: {:.4} SOL",
                lamports_to_sol(before),
                lamports_to_sol(after)
            ),
            SweepOutcome::Failed => "❌ Could not salvage any wallet; try again later".to_string(),
        }
    }
}

/// Reclaim every orphaned puppet wallet of `booster`'s owner into the
/// booster wallet. Live wallets are never touched.
pub async fn sweep_orphans(rt: &Arc<BoosterRuntime>, booster: &Arc<Booster>) -> Result<SweepReport> {
    let records = rt.store.puppets_for_owner(&booster.owner_id).await?;
    let mut report = SweepReport { found: records.len(), ..Default::default() };

    let mut adopted = Vec::new();
    for record in records {
        let Ok(pubkey) = record.pubkey.parse::<Pubkey>() else {
            warn!("[sweep] row {} has a malformed pubkey", record.id);
            report.failed += 1;
            continue;
        };
        if rt.puppets.is_live(&pubkey) {
            report.skipped_live += 1;
            continue;
        }
        let keypair = match record.keypair() {
            Ok(keypair) => keypair,
            Err(e) => {
                warn!("[sweep] row {} has an unusable key: {:#}", record.id, e);
                report.failed += 1;
                continue;
            }
        };
        match Puppet::adopt(rt, booster, keypair) {
            Some(puppet) => adopted.push(puppet),
            None => report.skipped_live += 1,
        }
    }

    let home = booster.pubkey();
    let results = join_all(adopted.iter().map(|puppet| puppet.reclaim(&home, true))).await;
    drop(adopted);
    for emptied in results {
        if emptied {
            report.emptied += 1;
        } else {
            report.failed += 1;
        }
    }

    info!(
        "🧹 [booster:{}] sweep for {}: {} rows, {} emptied, {} failed, {} live",
        booster.id, booster.owner_id, report.found, report.emptied, report.failed, report.skipped_live
    );
    Ok(report)
}

pub(crate) async fn run_salvage(booster: &Arc<Booster>, rt: &Arc<BoosterRuntime>) -> Option<StopReason> {
    let Some(before) = booster.refresh_balance(rt).await else {
        rt.notifier.notify(&booster.owner_id, "❌ Could not read the wallet balance; try again later".to_string());
        return None;
    };
    booster.set_status(BoosterStatus::Running);

    let report = match sweep_orphans(rt, booster).await {
        Ok(report) => report,
        Err(e) => {
            warn!("[booster:{}] salvage sweep failed: {:#}", booster.id, e);
            rt.notifier.notify(&booster.owner_id, SweepOutcome::Failed.message(before, before));
            return None;
        }
    };
    let after = booster.refresh_balance(rt).await.unwrap_or(before);
    let outcome = report.outcome(before, after);
    rt.notifier.notify(&booster.owner_id, outcome.message(before, after));
    booster.set_status(BoosterStatus::Stopping);
    None
}
