//! Deterministic in-memory collaborators for lifecycle tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use solana_sdk::{
    instruction::Instruction,
    pubkey::Pubkey,
    signature::{Keypair, Signature, Signer},
    transaction::VersionedTransaction,
};
use spl_associated_token_account::get_associated_token_address;
use uuid::Uuid;

use crate::booster::campaign::Booster;
use crate::booster::policy::RetryPolicy;
use crate::booster::runtime::{BoosterRuntime, RuntimeParams};
use crate::booster::store::BoosterStore;
use crate::booster::types::{BoosterKind, Settings};
use crate::database::models::{BoosterRecord, OwnerAccount, PuppetRecord};
use crate::services::bundler::BundleSubmitter;
use crate::services::ledger::{
    BuiltSwap, DEFAULT_SOLANA_FEE_LAMPORTS, Ledger, PRIORITY_FEE_LAMPORTS, SwapQuote,
};
use crate::services::notifier::Notifier;
use crate::services::price_feed::PriceFeed;
use crate::services::tip_feed::TipFeed;

pub const MOCK_TRANSFER_FEE: u64 = DEFAULT_SOLANA_FEE_LAMPORTS + PRIORITY_FEE_LAMPORTS;

/// Poll `condition` for up to five seconds.
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    condition()
}

// ============================================================================
// LEDGER
// ============================================================================

/// Balances that only move when a transfer or a bundle charge says so.
#[derive(Default)]
pub struct MockLedger {
    balances: Mutex<HashMap<Pubkey, u64>>,
    /// Token amounts keyed by associated token account
    tokens: Mutex<HashMap<Pubkey, u64>>,
    credit_on_buy: Mutex<HashMap<Pubkey, u64>>,
    transfers: Mutex<Vec<(Pubkey, Pubkey, u64)>>,
    stalled: Mutex<HashSet<Pubkey>>,
    failing: Mutex<HashSet<Pubkey>>,
}

impl MockLedger {
    pub fn set_balance(&self, address: &Pubkey, lamports: u64) {
        self.balances.lock().insert(*address, lamports);
    }

    pub fn balance(&self, address: &Pubkey) -> u64 {
        self.balances.lock().get(address).copied().unwrap_or(0)
    }

    /// Transfers from `address` report success but never land.
    pub fn stall_transfers_from(&self, address: &Pubkey) {
        self.stalled.lock().insert(*address);
    }

    /// Transfers from `address` fail outright.
    pub fn fail_transfers_from(&self, address: &Pubkey) {
        self.failing.lock().insert(*address);
    }

    pub fn set_tokens(&self, owner: &Pubkey, mint: &Pubkey, amount: u64) {
        self.tokens.lock().insert(get_associated_token_address(owner, mint), amount);
    }

    /// Every swap from SOL into `mint` credits the signer with `amount` units.
    pub fn credit_tokens_on_buy(&self, mint: &Pubkey, amount: u64) {
        self.credit_on_buy.lock().insert(*mint, amount);
    }

    /// Landed transfers as (from, to, lamports).
    pub fn transfers(&self) -> Vec<(Pubkey, Pubkey, u64)> {
        self.transfers.lock().clone()
    }

    /// Deduct `lamports` if the wallet can pay them.
    pub fn charge(&self, address: &Pubkey, lamports: u64) -> bool {
        let mut balances = self.balances.lock();
        let balance = balances.entry(*address).or_insert(0);
        if *balance < lamports {
            return false;
        }
        *balance -= lamports;
        true
    }
}

#[async_trait]
impl Ledger for MockLedger {
    async fn get_balance(&self, address: &Pubkey) -> Result<u64> {
        Ok(self.balance(address))
    }

    async fn transfer(&self, from: &Keypair, to: &Pubkey, lamports: u64) -> Result<Signature> {
        let sender = from.pubkey();
        if self.failing.lock().contains(&sender) {
            bail!("transfer from {} rejected", sender);
        }
        if self.stalled.lock().contains(&sender) {
            return Ok(Signature::default());
        }
        let mut balances = self.balances.lock();
        let available = balances.get(&sender).copied().unwrap_or(0);
        if available < lamports + MOCK_TRANSFER_FEE {
            bail!("insufficient funds in {}", sender);
        }
        balances.insert(sender, available - lamports - MOCK_TRANSFER_FEE);
        *balances.entry(*to).or_insert(0) += lamports;
        self.transfers.lock().push((sender, *to, lamports));
        Ok(Signature::new_unique())
    }

    async fn transfer_all(&self, from: &Keypair, to: &Pubkey) -> Result<(Signature, u64)> {
        let balance = self.balance(&from.pubkey());
        if balance <= MOCK_TRANSFER_FEE {
            bail!("nothing to transfer");
        }
        let amount = balance - MOCK_TRANSFER_FEE;
        let signature = self.transfer(from, to, amount).await?;
        Ok((signature, amount))
    }

    async fn quote(&self, _input_mint: &Pubkey, _output_mint: &Pubkey, amount: u64, slippage_bps: u16) -> Result<SwapQuote> {
        Ok(SwapQuote {
            in_amount: amount,
            out_amount: amount,
            min_out_amount: amount - amount * slippage_bps as u64 / 10_000,
        })
    }

    async fn build_swap(
        &self,
        signer: &Keypair,
        input_mint: &Pubkey,
        output_mint: &Pubkey,
        amount: u64,
        slippage_bps: u16,
    ) -> Result<BuiltSwap> {
        if *input_mint == spl_token::native_mint::ID {
            if let Some(credit) = self.credit_on_buy.lock().get(output_mint).copied() {
                let account = get_associated_token_address(&signer.pubkey(), output_mint);
                *self.tokens.lock().entry(account).or_insert(0) += credit;
            }
        }
        let quote = self.quote(input_mint, output_mint, amount, slippage_bps).await?;
        Ok(BuiltSwap { transaction: VersionedTransaction::default(), quote })
    }

    async fn get_asset_account(&self, owner: &Pubkey, mint: &Pubkey) -> Result<Option<Pubkey>> {
        let account = get_associated_token_address(owner, mint);
        Ok(self.tokens.lock().contains_key(&account).then_some(account))
    }

    async fn get_asset_balance(&self, account: &Pubkey) -> Result<u64> {
        self.tokens
            .lock()
            .get(account)
            .copied()
            .ok_or_else(|| anyhow!("no token account {}", account))
    }

    async fn compile(&self, _signer: &Keypair, _instructions: &[Instruction]) -> Result<VersionedTransaction> {
        Ok(VersionedTransaction::default())
    }
}

// ============================================================================
// BUNDLES
// ============================================================================

/// Lands a bundle when the signer can pay the tip plus one fee per
/// transaction, charging it through the mock ledger.
pub struct MockBundler {
    ledger: Arc<MockLedger>,
    next_id: AtomicU64,
    verdicts: Mutex<HashMap<String, bool>>,
    submissions: Mutex<Vec<(Pubkey, usize, u64)>>,
    reject_all: AtomicBool,
}

impl MockBundler {
    pub fn new(ledger: Arc<MockLedger>) -> Self {
        Self {
            ledger,
            next_id: AtomicU64::new(0),
            verdicts: Mutex::new(HashMap::new()),
            submissions: Mutex::new(Vec::new()),
            reject_all: AtomicBool::new(false),
        }
    }

    pub fn reject_all(&self) {
        self.reject_all.store(true, Ordering::SeqCst);
    }

    /// Submitted bundles as (signer, user transactions, tip).
    pub fn submissions(&self) -> Vec<(Pubkey, usize, u64)> {
        self.submissions.lock().clone()
    }
}

#[async_trait]
impl BundleSubmitter for MockBundler {
    async fn submit(&self, transactions: Vec<VersionedTransaction>, signer: &Keypair, tip_lamports: u64) -> Result<String> {
        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.submissions.lock().push((signer.pubkey(), transactions.len(), tip_lamports));
        let cost = tip_lamports + DEFAULT_SOLANA_FEE_LAMPORTS * transactions.len() as u64;
        let landed = !self.reject_all.load(Ordering::SeqCst) && self.ledger.charge(&signer.pubkey(), cost);
        self.verdicts.lock().insert(id.clone(), landed);
        Ok(id)
    }

    async fn await_result(&self, bundle_id: &str, _timeout: Duration) -> bool {
        self.verdicts.lock().remove(bundle_id).unwrap_or(false)
    }
}

// ============================================================================
// STORE
// ============================================================================

#[derive(Default)]
pub struct MemoryStore {
    owners: Mutex<HashMap<String, OwnerAccount>>,
    settings: Mutex<HashMap<String, Settings>>,
    boosters: Mutex<HashMap<Uuid, BoosterRecord>>,
    puppets: Mutex<HashMap<String, PuppetRecord>>,
    deleted_boosters: Mutex<Vec<Uuid>>,
    deleted_puppets: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn booster_rows(&self) -> Vec<BoosterRecord> {
        self.boosters.lock().values().cloned().collect()
    }

    pub fn puppet_rows(&self) -> Vec<PuppetRecord> {
        self.puppets.lock().values().cloned().collect()
    }

    /// Ids of booster rows actually removed, in order.
    pub fn deleted_boosters(&self) -> Vec<Uuid> {
        self.deleted_boosters.lock().clone()
    }

    /// Pubkeys of puppet rows actually removed, in order.
    pub fn deleted_puppets(&self) -> Vec<String> {
        self.deleted_puppets.lock().clone()
    }
}

#[async_trait]
impl BoosterStore for MemoryStore {
    async fn get_owner(&self, owner_id: &str) -> Result<Option<OwnerAccount>> {
        Ok(self.owners.lock().get(owner_id).cloned())
    }

    async fn create_owner(&self, account: &OwnerAccount) -> Result<()> {
        self.owners.lock().insert(account.owner_id.clone(), account.clone());
        Ok(())
    }

    async fn extend_usage(&self, owner_id: &str, until: DateTime<Utc>) -> Result<u64> {
        Ok(match self.owners.lock().get_mut(owner_id) {
            Some(owner) => {
                owner.usage_expires_at = until;
                1
            }
            None => 0,
        })
    }

    async fn set_withdraw_address(&self, owner_id: &str, address: &str) -> Result<u64> {
        Ok(match self.owners.lock().get_mut(owner_id) {
            Some(owner) => {
                owner.withdraw_address = Some(address.to_string());
                1
            }
            None => 0,
        })
    }

    async fn get_settings(&self, owner_id: &str) -> Result<Settings> {
        Ok(self.settings.lock().get(owner_id).cloned().unwrap_or_default())
    }

    async fn save_settings(&self, owner_id: &str, settings: &Settings) -> Result<()> {
        self.settings.lock().insert(owner_id.to_string(), settings.clone());
        Ok(())
    }

    async fn insert_booster(&self, record: &BoosterRecord) -> Result<()> {
        self.boosters.lock().insert(record.id, record.clone());
        Ok(())
    }

    async fn delete_booster(&self, id: Uuid) -> Result<u64> {
        if self.boosters.lock().remove(&id).is_some() {
            self.deleted_boosters.lock().push(id);
            return Ok(1);
        }
        Ok(0)
    }

    async fn find_boosters(&self, owner_id: &str, token_address: &str, kind: BoosterKind) -> Result<Vec<BoosterRecord>> {
        Ok(self
            .boosters
            .lock()
            .values()
            .filter(|r| r.owner_id == owner_id && r.token_address == token_address && r.kind == kind)
            .cloned()
            .collect())
    }

    async fn insert_puppet(&self, record: &PuppetRecord) -> Result<()> {
        self.puppets.lock().insert(record.pubkey.clone(), record.clone());
        Ok(())
    }

    async fn delete_puppet(&self, pubkey: &str) -> Result<u64> {
        if self.puppets.lock().remove(pubkey).is_some() {
            self.deleted_puppets.lock().push(pubkey.to_string());
            return Ok(1);
        }
        Ok(0)
    }

    async fn puppets_for_owner(&self, owner_id: &str) -> Result<Vec<PuppetRecord>> {
        Ok(self
            .puppets
            .lock()
            .values()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect())
    }
}

// ============================================================================
// NOTIFIER
// ============================================================================

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn messages_for(&self, owner_id: &str) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|(owner, _)| owner == owner_id)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, owner_id: &str, message: String) {
        self.sent.lock().push((owner_id.to_string(), message));
    }
}

// ============================================================================
// HARNESS
// ============================================================================

pub struct Harness {
    pub ledger: Arc<MockLedger>,
    pub bundler: Arc<MockBundler>,
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub runtime: Arc<BoosterRuntime>,
}

impl Harness {
    pub fn new() -> Self {
        let ledger = Arc::new(MockLedger::default());
        let bundler = Arc::new(MockBundler::new(ledger.clone()));
        let store = Arc::new(MemoryStore::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let runtime = Arc::new(BoosterRuntime::new(
            ledger.clone(),
            bundler.clone(),
            store.clone(),
            notifier.clone(),
            Arc::new(TipFeed::new("http://localhost/tip_floor").unwrap()),
            Arc::new(PriceFeed::new("http://localhost/price").unwrap()),
            Self::fast_params(),
        ));
        Self { ledger, bundler, store, notifier, runtime }
    }

    pub fn fast_params() -> RuntimeParams {
        RuntimeParams {
            status_poll_interval: Duration::from_millis(10),
            puppet_stop_timeout: Duration::from_secs(2),
            puppet_stop_poll: Duration::from_millis(5),
            transfer_policy: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(50)),
            balance_policy: RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(50)),
            bundle_timeout: Duration::from_millis(10),
            retry_delay: Duration::from_millis(1),
            pacing_unit: Duration::from_millis(1),
            pacing_slice: Duration::from_millis(5),
        }
    }

    /// A persisted owner with an open usage window and a funded work wallet.
    pub async fn owner(&self, owner_id: &str, lamports: u64) -> OwnerAccount {
        let mut owner = OwnerAccount::generate(owner_id);
        owner.usage_expires_at = Utc::now() + chrono::Duration::days(1);
        self.store.create_owner(&owner).await.unwrap();
        self.ledger.set_balance(&owner.keypair().unwrap().pubkey(), lamports);
        owner
    }

    /// A booster on the owner's work wallet, not registered anywhere.
    pub fn booster(&self, owner: &OwnerAccount, kind: BoosterKind, token: Pubkey, settings: Settings) -> Arc<Booster> {
        Arc::new(Booster::new(
            Uuid::new_v4(),
            &owner.owner_id,
            token,
            kind,
            owner.keypair().unwrap(),
            settings,
        ))
    }

    /// A persisted puppet wallet with no live task behind it.
    pub async fn orphan(&self, owner: &OwnerAccount, lamports: u64) -> Keypair {
        let keypair = Keypair::new();
        self.store
            .insert_puppet(&PuppetRecord::new(&owner.owner_id, Uuid::new_v4(), &keypair))
            .await
            .unwrap();
        self.ledger.set_balance(&keypair.pubkey(), lamports);
        keypair
    }
}
