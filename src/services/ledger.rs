//! Ledger Client
//!
//! Balance queries, SOL transfers, swap construction and token-account
//! plumbing against Solana RPC and the Jupiter swap API.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::{
    commitment_config::CommitmentConfig,
    compute_budget::ComputeBudgetInstruction,
    instruction::Instruction,
    message::{VersionedMessage, v0},
    pubkey::Pubkey,
    signature::{Keypair, Signature, Signer},
    system_instruction,
    transaction::VersionedTransaction,
};
use spl_associated_token_account::{
    get_associated_token_address, instruction::create_associated_token_account_idempotent,
};
use tracing::{debug, info, warn};

use crate::booster::policy::RetryPolicy;
use crate::services::swap_engine::JupiterSwapEngine;

pub const DEFAULT_SOLANA_FEE_LAMPORTS: u64 = 5_000;
pub const PRIORITY_FEE_LAMPORTS: u64 = 10_001;
const TRANSFER_COMPUTE_UNITS: u32 = 10_000;

/// Output estimate for a swap, in raw units of the output asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapQuote {
    pub in_amount: u64,
    pub out_amount: u64,
    pub min_out_amount: u64,
}

/// A signed swap transaction together with the quote it was built from.
#[derive(Debug, Clone)]
pub struct BuiltSwap {
    pub transaction: VersionedTransaction,
    pub quote: SwapQuote,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn get_balance(&self, address: &Pubkey) -> Result<u64>;

    /// Submit a SOL transfer, retrying transient send failures.
    /// Landing is confirmed by the caller through balance polling.
    async fn transfer(&self, from: &Keypair, to: &Pubkey, lamports: u64) -> Result<Signature>;

    /// Transfer everything except the transaction fee; returns the amount sent.
    async fn transfer_all(&self, from: &Keypair, to: &Pubkey) -> Result<(Signature, u64)>;

    async fn quote(&self, input_mint: &Pubkey, output_mint: &Pubkey, amount: u64, slippage_bps: u16) -> Result<SwapQuote>;

    async fn build_swap(
        &self,
        signer: &Keypair,
        input_mint: &Pubkey,
        output_mint: &Pubkey,
        amount: u64,
        slippage_bps: u16,
    ) -> Result<BuiltSwap>;

    /// The owner's token account for `mint`, if it exists on chain.
    async fn get_asset_account(&self, owner: &Pubkey, mint: &Pubkey) -> Result<Option<Pubkey>>;

    async fn get_asset_balance(&self, account: &Pubkey) -> Result<u64>;

    /// Sign `instructions` into a v0 transaction against a fresh blockhash.
    async fn compile(&self, signer: &Keypair, instructions: &[Instruction]) -> Result<VersionedTransaction>;
}

/// Move `amount` of `mint` from `owner`'s token account to `receiver`'s,
/// opening the receiver account if needed (paid by `owner`).
pub fn transfer_asset_instructions(owner: &Pubkey, receiver: &Pubkey, mint: &Pubkey, amount: u64) -> Result<Vec<Instruction>> {
    let source = get_associated_token_address(owner, mint);
    let destination = get_associated_token_address(receiver, mint);
    Ok(vec![
        create_associated_token_account_idempotent(owner, receiver, mint, &spl_token::ID),
        spl_token::instruction::transfer(&spl_token::ID, &source, &destination, owner, &[], amount)?,
    ])
}

/// Move `owner`'s whole holding of `mint` to `receiver` and close the
/// account; the rent comes back to `owner`.
pub fn close_asset_account_instructions(owner: &Pubkey, receiver: &Pubkey, mint: &Pubkey, amount: u64) -> Result<Vec<Instruction>> {
    let mut instructions = if amount > 0 {
        transfer_asset_instructions(owner, receiver, mint, amount)?
    } else {
        Vec::new()
    };
    let account = get_associated_token_address(owner, mint);
    instructions.push(spl_token::instruction::close_account(&spl_token::ID, &account, owner, owner, &[])?);
    Ok(instructions)
}

/// Send through `send` up to `policy.max_attempts` times. A failed send may
/// still land, so the signatures of earlier attempts are checked with
/// `landed` before every resend and once more before giving up.
async fn send_with_retry<S, SFut, L, LFut>(policy: RetryPolicy, mut send: S, mut landed: L) -> Result<Signature>
where
    S: FnMut() -> SFut,
    SFut: Future<Output = (Option<Signature>, Result<Signature>)>,
    L: FnMut(Signature) -> LFut,
    LFut: Future<Output = bool>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempted: Vec<Signature> = Vec::new();
    let mut last_error = None;

    for attempt in 1..=attempts + 1 {
        for signature in &attempted {
            if landed(*signature).await {
                info!("Earlier send {} landed despite its error", signature);
                return Ok(*signature);
            }
        }
        if attempt > attempts {
            break;
        }
        let (signature, sent) = send().await;
        match sent {
            Ok(signature) => return Ok(signature),
            Err(e) => {
                warn!("Send attempt {}/{} failed: {:#}", attempt, attempts, e);
                attempted.extend(signature);
                last_error = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(policy.interval).await;
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("transfer was never attempted")))
}

/// RPC + Jupiter backed ledger client
pub struct SolanaLedger {
    rpc: RpcClient,
    swaps: JupiterSwapEngine,
    send_policy: RetryPolicy,
}

impl SolanaLedger {
    pub fn new(rpc_url: &str, swaps: JupiterSwapEngine, send_policy: RetryPolicy) -> Self {
        let rpc = RpcClient::new_with_commitment(rpc_url.to_string(), CommitmentConfig::confirmed());
        Self { rpc, swaps, send_policy }
    }

    fn transfer_instructions(from: &Pubkey, to: &Pubkey, lamports: u64) -> Vec<Instruction> {
        let micro_lamports_per_cu = PRIORITY_FEE_LAMPORTS * 1_000_000 / TRANSFER_COMPUTE_UNITS as u64;
        vec![
            ComputeBudgetInstruction::set_compute_unit_limit(TRANSFER_COMPUTE_UNITS),
            ComputeBudgetInstruction::set_compute_unit_price(micro_lamports_per_cu),
            system_instruction::transfer(from, to, lamports),
        ]
    }
}

#[async_trait]
impl Ledger for SolanaLedger {
    async fn get_balance(&self, address: &Pubkey) -> Result<u64> {
        self.rpc
            .get_balance(address)
            .await
            .with_context(|| format!("Failed to fetch balance of {}", address))
    }

    async fn transfer(&self, from: &Keypair, to: &Pubkey, lamports: u64) -> Result<Signature> {
        let instructions = Self::transfer_instructions(&from.pubkey(), to, lamports);
        let instructions = &instructions;
        let signature = send_with_retry(
            self.send_policy,
            || async move {
                let tx = match self.compile(from, instructions).await {
                    Ok(tx) => tx,
                    Err(e) => return (None, Err(e)),
                };
                let signature = tx.signatures.first().copied();
                (signature, self.rpc.send_transaction(&tx).await.context("Failed to send transfer"))
            },
            |signature| async move { matches!(self.rpc.get_signature_status(&signature).await, Ok(Some(Ok(())))) },
        )
        .await?;
        debug!("💸 {} -> {} ({} lamports): {}", from.pubkey(), to, lamports, signature);
        Ok(signature)
    }

    async fn transfer_all(&self, from: &Keypair, to: &Pubkey) -> Result<(Signature, u64)> {
        let balance = self.get_balance(&from.pubkey()).await?;
        let fees = DEFAULT_SOLANA_FEE_LAMPORTS + PRIORITY_FEE_LAMPORTS;
        if balance <= fees {
            bail!("Balance of {} ({} lamports) does not cover the transfer fee", from.pubkey(), balance);
        }
        let amount = balance - fees;
        let signature = self.transfer(from, to, amount).await?;
        Ok((signature, amount))
    }

    async fn quote(&self, input_mint: &Pubkey, output_mint: &Pubkey, amount: u64, slippage_bps: u16) -> Result<SwapQuote> {
        self.swaps
            .fetch_quote(input_mint, output_mint, amount, slippage_bps)
            .await?
            .to_swap_quote()
    }

    async fn build_swap(
        &self,
        signer: &Keypair,
        input_mint: &Pubkey,
        output_mint: &Pubkey,
        amount: u64,
        slippage_bps: u16,
    ) -> Result<BuiltSwap> {
        let quote = self.swaps.fetch_quote(input_mint, output_mint, amount, slippage_bps).await?;
        let estimate = quote.to_swap_quote()?;
        let transaction = self.swaps.build_swap_transaction(signer, quote).await?;
        Ok(BuiltSwap { transaction, quote: estimate })
    }

    async fn get_asset_account(&self, owner: &Pubkey, mint: &Pubkey) -> Result<Option<Pubkey>> {
        let address = get_associated_token_address(owner, mint);
        let account = self
            .rpc
            .get_account_with_commitment(&address, CommitmentConfig::confirmed())
            .await
            .context("Failed to look up token account")?
            .value;
        Ok(account.map(|_| address))
    }

    async fn get_asset_balance(&self, account: &Pubkey) -> Result<u64> {
        let balance = self
            .rpc
            .get_token_account_balance(account)
            .await
            .with_context(|| format!("Failed to fetch token balance of {}", account))?;
        balance.amount.parse().context("Failed to parse token amount")
    }

    async fn compile(&self, signer: &Keypair, instructions: &[Instruction]) -> Result<VersionedTransaction> {
        let blockhash = self
            .rpc
            .get_latest_blockhash()
            .await
            .context("Failed to fetch latest blockhash")?;
        let message = v0::Message::try_compile(&signer.pubkey(), instructions, &[], blockhash)
            .context("Failed to compile transaction message")?;
        VersionedTransaction::try_new(VersionedMessage::V0(message), &[signer])
            .context("Failed to sign transaction")
    }
}

/// Poll `address` until its balance differs from `initial`.
///
/// Returns the new balance, or `None` once `policy.timeout` elapses.
pub async fn wait_for_balance_change(
    ledger: &dyn Ledger,
    address: &Pubkey,
    initial: u64,
    policy: RetryPolicy,
) -> Option<u64> {
    let deadline = tokio::time::Instant::now() + policy.timeout;
    loop {
        tokio::time::sleep(policy.interval).await;
        match ledger.get_balance(address).await {
            Ok(balance) if balance != initial => return Some(balance),
            Ok(_) => {}
            Err(e) => debug!("Balance poll for {} failed: {:#}", address, e),
        }
        if tokio::time::Instant::now() >= deadline {
            debug!("Balance of {} unchanged after {:?}", address, policy.timeout);
            return None;
        }
    }
}

/// Poll `address` until its balance is at or below `ceiling`.
pub async fn wait_for_balance_at_most(
    ledger: &dyn Ledger,
    address: &Pubkey,
    ceiling: u64,
    policy: RetryPolicy,
) -> Option<u64> {
    let deadline = tokio::time::Instant::now() + policy.timeout;
    loop {
        match ledger.get_balance(address).await {
            Ok(balance) if balance <= ceiling => return Some(balance),
            Ok(_) => {}
            Err(e) => debug!("Balance poll for {} failed: {:#}", address, e),
        }
        if tokio::time::Instant::now() >= deadline {
            debug!("Balance of {} still above {} after {:?}", address, ceiling, policy.timeout);
            return None;
        }
        tokio::time::sleep(policy.interval).await;
    }
}

/// Which side of a transfer proves that it landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchSide {
    Sender,
    Receiver,
}

/// Transfer and confirm by watching one side's balance move.
pub async fn send_confirmed(
    ledger: &dyn Ledger,
    from: &Keypair,
    to: &Pubkey,
    lamports: u64,
    watch: WatchSide,
    policy: RetryPolicy,
) -> bool {
    let watched = match watch {
        WatchSide::Sender => from.pubkey(),
        WatchSide::Receiver => *to,
    };
    let initial = match ledger.get_balance(&watched).await {
        Ok(balance) => balance,
        Err(e) => {
            warn!("Not sending to {}: balance check failed: {:#}", to, e);
            return false;
        }
    };
    if let Err(e) = ledger.transfer(from, to, lamports).await {
        warn!("Transfer {} -> {} failed: {:#}", from.pubkey(), to, e);
        return false;
    }
    wait_for_balance_change(ledger, &watched, initial, policy).await.is_some()
}
