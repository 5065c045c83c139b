//! Shared booster vocabulary: kinds, lifecycle states, per-owner settings,
//! metrics and the rejections a start request can produce.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use solana_sdk::native_token::lamports_to_sol;
use thiserror::Error;

use crate::booster::policy::{HOLDER_INCREMENT_STEP, MAX_HOLDERS_PER_BOOSTER, BOOSTER_TOP_GEAR};

// ============================================================================
// KINDS & STATES
// ============================================================================

/// The fixed set of campaign kinds a booster can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoosterKind {
    Volume,
    Rank,
    Holders,
    Salvage,
}

impl BoosterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BoosterKind::Volume => "volume",
            BoosterKind::Rank => "rank",
            BoosterKind::Holders => "holders",
            BoosterKind::Salvage => "salvage",
        }
    }

    /// Salvage runs are exempt from the one-booster-per-owner rule.
    pub fn is_exclusive(&self) -> bool {
        !matches!(self, BoosterKind::Salvage)
    }
}

impl fmt::Display for BoosterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BoosterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "volume" => Ok(BoosterKind::Volume),
            "rank" => Ok(BoosterKind::Rank),
            "holders" | "holder" => Ok(BoosterKind::Holders),
            "salvage" | "salvager" => Ok(BoosterKind::Salvage),
            other => Err(format!("unknown booster kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BoosterStatus {
    Created,
    Starting,
    Running,
    Stopping,
    Terminated,
}

/// Why a booster left (or never reached) its running phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    StopRequested,
    OutOfFunds,
    DurationElapsed,
    NoPuppetsLeft,
    HolderGoalReached,
    StartAborted,
}

impl StopReason {
    pub fn message(&self, kind: BoosterKind) -> String {
        match self {
            StopReason::StopRequested => format!("🛑 {} booster stopped on request", kind),
            StopReason::OutOfFunds => format!("🪫 {} booster ran out of funds", kind),
            StopReason::DurationElapsed => format!("⌛️ {} booster reached its configured duration", kind),
            StopReason::NoPuppetsLeft => format!("⚠️ {} booster has no active wallets left", kind),
            StopReason::HolderGoalReached => "🏆 Holder goal reached".to_string(),
            StopReason::StartAborted => format!("❌ {} booster could not be started", kind),
        }
    }
}

// ============================================================================
// SETTINGS
// ============================================================================

/// Named tip-floor percentiles published by the bundle relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TipPercentile {
    P25,
    P50,
    P75,
    P95,
    P99,
    Over99,
}

/// How much to tip the bundle relay per bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TipSetting {
    Auto,
    Percentile(TipPercentile),
    Lamports(u64),
}

impl Default for TipSetting {
    fn default() -> Self {
        TipSetting::Auto
    }
}

impl FromStr for TipSetting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        let setting = match s.as_str() {
            "" | "auto" | "0" => TipSetting::Auto,
            "p25" => TipSetting::Percentile(TipPercentile::P25),
            "p50" => TipSetting::Percentile(TipPercentile::P50),
            "p75" => TipSetting::Percentile(TipPercentile::P75),
            "p95" => TipSetting::Percentile(TipPercentile::P95),
            "p99" => TipSetting::Percentile(TipPercentile::P99),
            "over99" => TipSetting::Percentile(TipPercentile::Over99),
            other => TipSetting::Lamports(
                other.parse().map_err(|_| format!("invalid tip setting: {}", other))?,
            ),
        };
        Ok(setting)
    }
}

impl fmt::Display for TipSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TipSetting::Auto => f.write_str("auto"),
            TipSetting::Percentile(p) => f.write_str(match p {
                TipPercentile::P25 => "p25",
                TipPercentile::P50 => "p50",
                TipPercentile::P75 => "p75",
                TipPercentile::P95 => "p95",
                TipPercentile::P99 => "p99",
                TipPercentile::Over99 => "over99",
            }),
            TipSetting::Lamports(lamports) => write!(f, "{}", lamports),
        }
    }
}

impl TryFrom<String> for TipSetting {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TipSetting> for String {
    fn from(value: TipSetting) -> Self {
        value.to_string()
    }
}

/// Per-owner knobs, refreshed by running boosters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Volume "gear", 0 (slowest) to 5 (no pause between trades)
    pub volume_speed: u8,
    pub volume_duration_secs: u64,
    pub volume_parallel_wallets: u32,
    pub rank_parallel_wallets: u32,
    pub rank_rotate_every_n_tx: u32,
    pub holders_new_holders: u32,
    pub jito_tip: TipSetting,
    pub selected_token: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            volume_speed: 3,
            volume_duration_secs: 24 * 60 * 60,
            volume_parallel_wallets: 4,
            rank_parallel_wallets: 5,
            rank_rotate_every_n_tx: 20,
            holders_new_holders: HOLDER_INCREMENT_STEP,
            jito_tip: TipSetting::Auto,
            selected_token: None,
        }
    }
}

impl Settings {
    /// Clamp user-provided values into their supported ranges.
    pub fn sanitized(mut self) -> Self {
        self.volume_speed = self.volume_speed.min(BOOSTER_TOP_GEAR);
        self.volume_parallel_wallets = self.volume_parallel_wallets.max(1);
        self.rank_parallel_wallets = self.rank_parallel_wallets.max(1);
        self.rank_rotate_every_n_tx = self.rank_rotate_every_n_tx.max(1);
        self.holders_new_holders = self.holders_new_holders.clamp(1, MAX_HOLDERS_PER_BOOSTER);
        self
    }

    pub fn parallel_wallets(&self, kind: BoosterKind) -> usize {
        match kind {
            BoosterKind::Volume => self.volume_parallel_wallets.max(1) as usize,
            BoosterKind::Rank => self.rank_parallel_wallets.max(1) as usize,
            _ => 0,
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Monotonic counters accumulated over one booster run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Metrics {
    pub txs: u64,
    pub txs_failed: u64,
    pub unique_wallets: u64,
    pub buys: u64,
    pub sells: u64,
    pub buy_volume_lamports: u64,
    pub sell_volume_lamports: u64,
}

impl Metrics {
    pub fn fail_rate_percent(&self) -> f64 {
        let attempted = self.txs + self.txs_failed;
        if attempted == 0 {
            return 0.0;
        }
        self.txs_failed as f64 * 100.0 / attempted as f64
    }

    /// Final report sent to the owner; salvage runs report nothing.
    pub fn summary(&self, kind: BoosterKind, sol_usd: f64) -> Option<String> {
        let buy_sol = lamports_to_sol(self.buy_volume_lamports);
        let sell_sol = lamports_to_sol(self.sell_volume_lamports);
        match kind {
            BoosterKind::Volume => Some(format!(
                "📊 Volume booster results\n\
                 Buy volume: {:.4} SOL (${:.2})\n\
                 Sell volume: {:.4} SOL (${:.2})\n\
                 Total transactions: {}\n\
                 Fail rate: {:.1}%\n\
                 Unique wallets: {}",
                buy_sol,
                buy_sol * sol_usd,
                sell_sol,
                sell_sol * sol_usd,
                self.txs,
                self.fail_rate_percent(),
                self.unique_wallets,
            )),
            BoosterKind::Rank => Some(format!(
                "📊 Rank booster results\n\
                 Unique wallets: {}\n\
                 Buys: {}\n\
                 Fail rate: {:.1}%",
                self.unique_wallets,
                self.buys,
                self.fail_rate_percent(),
            )),
            BoosterKind::Holders => Some(format!(
                "📊 Holders booster results\n\
                 New holders: {}\n\
                 Fail rate: {:.1}%",
                self.unique_wallets,
                self.fail_rate_percent(),
            )),
            BoosterKind::Salvage => None,
        }
    }
}

// ============================================================================
// REJECTIONS
// ============================================================================

/// Reasons a start request is refused before any resource is allocated.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StartRejection {
    #[error("Unknown account {0}; open the bot wallet first")]
    UnknownOwner(String),

    #[error("The rental time of the bot has expired; extend it to start boosters")]
    UsageExpired,

    #[error("A {kind} booster is already active for this token")]
    DuplicateActive { kind: BoosterKind },

    #[error("A {kind} booster is already running on {token}; stop it before starting another")]
    OwnerBusy { kind: BoosterKind, token: String },

    #[error("Balance too small: {have_sol:.4} SOL available, at least {need_sol:.4} SOL required")]
    InsufficientBalance { have_sol: f64, need_sol: f64 },

    #[error("Service temporarily unavailable: {0}")]
    Unavailable(String),
}

/// Reasons a work-wallet withdrawal is refused or did not go through.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WithdrawRejection {
    #[error("Unknown account {0}; open the bot wallet first")]
    UnknownOwner(String),

    #[error("No withdrawal address set")]
    NoAddress,

    #[error("A {kind} booster is running; stop it before withdrawing")]
    BoosterActive { kind: BoosterKind },

    #[error("Not enough funds to withdraw: {have_sol:.4} SOL available")]
    NothingToWithdraw { have_sol: f64 },

    #[error("Withdrawal to {0} was not confirmed; try again")]
    Unconfirmed(String),

    #[error("Service temporarily unavailable: {0}")]
    Unavailable(String),
}
