//! Funds floors, budget allocation, stop precedence and pacing.
//!
//! Every amount is in lamports. The floor table is the single source for
//! "how low may this wallet go" decisions across all booster kinds.

use std::time::Duration;

use thiserror::Error;

use crate::booster::types::{BoosterKind, StopReason};

/// Minimum booster wallet balance for every trading kind.
pub const MIN_BOOSTER_BALANCE: u64 = 15_000_000;
/// A puppet at or below this balance is considered empty.
pub const EMPTY_PUPPET_BALANCE: u64 = 6_000_000;
/// A puppet keeps this much for fees and stops trading below it.
pub const RESERVED_PUPPET_BALANCE: u64 = 5_000_000;
pub const MIN_NEW_PUPPET_BUDGET: u64 = EMPTY_PUPPET_BALANCE + 2_000_000;
/// Booster-side fee reserve per funded puppet.
pub const PUPPET_GAS_RESERVE: u64 = 3_000_000;
/// Holdings quoted below this value are left alone.
pub const DUST_HOLDINGS_VALUE: u64 = 3_000_000;
/// A work wallet must hold more than this before a withdrawal is attempted.
pub const WITHDRAW_RESERVE_LAMPORTS: u64 = 3_000_000;

pub const MAX_SPAWN_RETRIES: usize = 5;
pub const BOOSTER_TOP_GEAR: u8 = 5;

pub const SWAP_SLIPPAGE_BPS: u16 = 150;
pub const RANK_BUY_LAMPORTS: u64 = 10_000;
pub const RANK_BUY_STEP_LAMPORTS: u64 = 100;
pub const RANK_BUYS_PER_OPERATION: usize = 4;
pub const RANK_SLIPPAGE_BPS: u16 = 5_000;

pub const HOLDER_BAG_LAMPORTS: u64 = 10_000;
/// Approximate cost of one new holder (token account rent + fees).
pub const HOLDER_COST_LAMPORTS: u64 = 2_200_000;
pub const HOLDERS_PER_OPERATION: usize = 4;
pub const MAX_HOLDERS_PER_BOOSTER: u32 = 5_000;
pub const HOLDER_INCREMENT_STEP: u32 = 250;

/// Reserved floor per booster kind.
pub fn reserved_floor(kind: BoosterKind) -> u64 {
    match kind {
        BoosterKind::Volume | BoosterKind::Rank | BoosterKind::Holders => MIN_BOOSTER_BALANCE,
        BoosterKind::Salvage => 0,
    }
}

/// Explicit retry/poll parameters for one class of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub interval: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: usize, interval: Duration, timeout: Duration) -> Self {
        Self { max_attempts, interval, timeout }
    }
}

// ============================================================================
// BUDGET
// ============================================================================

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Not enough funds to start {puppets} wallets: {available} lamports available, {required} required (short by {shortfall})")]
pub struct BudgetShortfall {
    pub puppets: usize,
    pub available: u64,
    pub required: u64,
    pub shortfall: u64,
}

/// Per-puppet budget for a pool of `puppets` funded from `balance`.
///
/// `(balance - floor) / puppets - gas reserve`, or a shortfall when the pool
/// cannot be fully funded with at least `MIN_NEW_PUPPET_BUDGET` each.
pub fn plan_pool_budget(balance: u64, floor: u64, puppets: usize) -> Result<u64, BudgetShortfall> {
    let count = puppets.max(1) as u64;
    let required = floor + count * (MIN_NEW_PUPPET_BUDGET + PUPPET_GAS_RESERVE);
    let per_puppet = (balance.saturating_sub(floor) / count).saturating_sub(PUPPET_GAS_RESERVE);

    if balance < required || per_puppet < MIN_NEW_PUPPET_BUDGET {
        return Err(BudgetShortfall {
            puppets: count as usize,
            available: balance,
            required,
            shortfall: required.saturating_sub(balance),
        });
    }
    Ok(per_puppet)
}

// ============================================================================
// STOP CONDITIONS
// ============================================================================

/// Snapshot of everything a booster-level stop decision looks at.
#[derive(Debug, Clone, Copy)]
pub struct StopProbe {
    pub stop_requested: bool,
    pub balance: u64,
    pub floor: u64,
    pub elapsed: Duration,
    pub duration_limit: Duration,
    pub live_puppets: usize,
    pub holders_added: u64,
    pub holder_goal: u64,
}

/// First matching reason wins: explicit stop, funds floor, then the
/// kind-specific terminal condition.
pub fn evaluate_stop(kind: BoosterKind, probe: &StopProbe) -> Option<StopReason> {
    if probe.stop_requested {
        return Some(StopReason::StopRequested);
    }
    if probe.balance < probe.floor {
        return Some(StopReason::OutOfFunds);
    }
    match kind {
        BoosterKind::Volume if probe.elapsed >= probe.duration_limit => Some(StopReason::DurationElapsed),
        BoosterKind::Volume | BoosterKind::Rank if probe.live_puppets == 0 => Some(StopReason::NoPuppetsLeft),
        BoosterKind::Holders if probe.holders_added >= probe.holder_goal => Some(StopReason::HolderGoalReached),
        _ => None,
    }
}

// ============================================================================
// PACING
// ============================================================================

/// Pause between volume trades: `((top gear - speed) * 3)^2` units.
pub fn volume_pause(speed: u8, unit: Duration) -> Duration {
    let gap = (BOOSTER_TOP_GEAR - speed.min(BOOSTER_TOP_GEAR)) as u32 * 3;
    unit * (gap * gap)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe() -> StopProbe {
        StopProbe {
            stop_requested: false,
            balance: 1_000_000_000,
            floor: MIN_BOOSTER_BALANCE,
            elapsed: Duration::from_secs(10),
            duration_limit: Duration::from_secs(3600),
            live_puppets: 4,
            holders_added: 0,
            holder_goal: 250,
        }
    }

    #[test]
    fn test_budget_for_pool_of_four() {
        // (1.0 - 0.015) / 4 - 0.003 SOL
        let budget = plan_pool_budget(1_000_000_000, MIN_BOOSTER_BALANCE, 4).unwrap();
        assert_eq!(budget, 243_250_000);
    }

    #[test]
    fn test_budget_aborts_with_exact_shortfall() {
        let err = plan_pool_budget(20_000_000, MIN_BOOSTER_BALANCE, 4).unwrap_err();
        assert_eq!(err.required, 59_000_000);
        assert_eq!(err.shortfall, 39_000_000);
        assert_eq!(err.puppets, 4);
    }

    #[test]
    fn test_budget_exactly_at_requirement_proceeds() {
        let budget = plan_pool_budget(59_000_000, MIN_BOOSTER_BALANCE, 4).unwrap();
        assert_eq!(budget, MIN_NEW_PUPPET_BUDGET);
    }

    #[test]
    fn test_explicit_stop_beats_out_of_funds() {
        let probe = StopProbe { stop_requested: true, balance: 0, ..probe() };
        assert_eq!(evaluate_stop(BoosterKind::Volume, &probe), Some(StopReason::StopRequested));
    }

    #[test]
    fn test_out_of_funds_beats_kind_conditions() {
        let probe = StopProbe {
            balance: MIN_BOOSTER_BALANCE - 1,
            elapsed: Duration::from_secs(7200),
            live_puppets: 0,
            ..probe()
        };
        assert_eq!(evaluate_stop(BoosterKind::Volume, &probe), Some(StopReason::OutOfFunds));
    }

    #[test]
    fn test_kind_specific_terminal_conditions() {
        let elapsed = StopProbe { elapsed: Duration::from_secs(3600), ..probe() };
        assert_eq!(evaluate_stop(BoosterKind::Volume, &elapsed), Some(StopReason::DurationElapsed));
        // rank has no duration limit
        assert_eq!(evaluate_stop(BoosterKind::Rank, &elapsed), None);

        let empty_pool = StopProbe { live_puppets: 0, ..probe() };
        assert_eq!(evaluate_stop(BoosterKind::Rank, &empty_pool), Some(StopReason::NoPuppetsLeft));
        assert_eq!(evaluate_stop(BoosterKind::Holders, &empty_pool), None);

        let goal = StopProbe { holders_added: 250, ..probe() };
        assert_eq!(evaluate_stop(BoosterKind::Holders, &goal), Some(StopReason::HolderGoalReached));
    }

    #[test]
    fn test_salvage_never_hits_floor() {
        let probe = StopProbe { balance: 0, floor: reserved_floor(BoosterKind::Salvage), ..probe() };
        assert_eq!(evaluate_stop(BoosterKind::Salvage, &probe), None);
    }

    #[test]
    fn test_volume_pause_scales_with_speed() {
        let unit = Duration::from_secs(1);
        assert_eq!(volume_pause(5, unit), Duration::ZERO);
        assert_eq!(volume_pause(3, unit), Duration::from_secs(36));
        assert_eq!(volume_pause(0, unit), Duration::from_secs(225));
        assert_eq!(volume_pause(42, unit), Duration::ZERO);
    }
}
