//! Bundle Submitter
//!
//! Atomic transaction groups through the Jito block engine: bundle
//! submission with a tip transaction, and a background status checker that
//! resolves each pending bundle as landed or timed out.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::{
    pubkey::Pubkey,
    signature::{Keypair, Signer},
    system_instruction,
    transaction::{Transaction, VersionedTransaction},
};
use tokio::sync::oneshot;
use tokio::time::{Instant, interval};
use tracing::{debug, info, warn};

use crate::services::tip_feed::TipFeed;

/// User transactions per bundle; the tip transaction takes the fifth slot
pub const MAX_TXS_PER_BUNDLE: usize = 4;
/// `getBundleStatuses` accepts at most this many ids per call
pub const MAX_BUNDLE_IDS_PER_STATUS_CHECK: usize = 5;
pub const STATUS_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[async_trait]
pub trait BundleSubmitter: Send + Sync {
    /// Submit one bundle (at most `MAX_TXS_PER_BUNDLE` transactions) and
    /// return the relay's bundle id.
    async fn submit(&self, transactions: Vec<VersionedTransaction>, signer: &Keypair, tip_lamports: u64) -> Result<String>;

    /// Resolves `true` once the bundle landed, `false` after `timeout`.
    async fn await_result(&self, bundle_id: &str, timeout: Duration) -> bool;
}

/// Submit an atomic operation, splitting it into bundles of
/// `MAX_TXS_PER_BUNDLE`. Lands only if every bundle lands.
pub async fn submit_atomic(
    submitter: &dyn BundleSubmitter,
    transactions: Vec<VersionedTransaction>,
    signer: &Keypair,
    tip_lamports: u64,
    timeout: Duration,
) -> bool {
    for group in transactions.chunks(MAX_TXS_PER_BUNDLE) {
        let bundle_id = match submitter.submit(group.to_vec(), signer, tip_lamports).await {
            Ok(id) => id,
            Err(e) => {
                warn!("Bundle submission for {} failed: {:#}", signer.pubkey(), e);
                return false;
            }
        };
        if !submitter.await_result(&bundle_id, timeout).await {
            debug!("[bundle:{}] did not land", bundle_id);
            return false;
        }
        debug!("[bundle:{}] landed", bundle_id);
    }
    true
}

// ============================================================================
// JITO JSON-RPC CLIENT
// ============================================================================

#[derive(Debug, Serialize)]
struct JsonRpcRequest<P: Serialize> {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: P,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct BundleStatusesResult {
    value: Vec<Option<BundleStatusEntry>>,
}

#[derive(Debug, Deserialize)]
struct BundleStatusEntry {
    bundle_id: String,
    confirmation_status: Option<String>,
}

/// Landing verdict reported by the relay for one bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleStatus {
    pub bundle_id: String,
    pub landed: bool,
}

#[async_trait]
pub trait BundleStatusSource: Send + Sync {
    async fn bundle_statuses(&self, bundle_ids: &[String]) -> Result<Vec<BundleStatus>>;
}

/// Block engine JSON-RPC endpoint
pub struct JitoClient {
    client: Client,
    endpoint: String,
}

impl JitoClient {
    pub fn new(block_engine_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;
        let base = if block_engine_url.starts_with("http") {
            block_engine_url.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", block_engine_url.trim_end_matches('/'))
        };
        Ok(Self { client, endpoint: format!("{}/api/v1/bundles", base) })
    }

    async fn call<P, T>(&self, method: &'static str, params: P) -> Result<T>
    where
        P: Serialize + Send,
        T: for<'de> Deserialize<'de>,
    {
        let request = JsonRpcRequest { jsonrpc: "2.0", id: 1, method, params };
        let response: JsonRpcResponse<T> = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Failed to call {}", method))?
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", method))?;

        if let Some(error) = response.error {
            bail!("{} failed ({}): {}", method, error.code, error.message);
        }
        response.result.ok_or_else(|| anyhow!("{} returned no result", method))
    }

    pub async fn send_bundle(&self, transactions: &[VersionedTransaction]) -> Result<String> {
        let encoded = transactions
            .iter()
            .map(|tx| {
                bincode::serialize(tx)
                    .map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes))
                    .context("Failed to serialize bundle transaction")
            })
            .collect::<Result<Vec<_>>>()?;
        self.call("sendBundle", json!([encoded, { "encoding": "base64" }])).await
    }

    pub async fn tip_accounts(&self) -> Result<Vec<Pubkey>> {
        let accounts: Vec<String> = self.call("getTipAccounts", json!([])).await?;
        Ok(accounts.iter().filter_map(|a| a.parse().ok()).collect())
    }
}

#[async_trait]
impl BundleStatusSource for JitoClient {
    async fn bundle_statuses(&self, bundle_ids: &[String]) -> Result<Vec<BundleStatus>> {
        if bundle_ids.len() > MAX_BUNDLE_IDS_PER_STATUS_CHECK {
            bail!("getBundleStatuses accepts at most {} ids", MAX_BUNDLE_IDS_PER_STATUS_CHECK);
        }
        let result: BundleStatusesResult = self.call("getBundleStatuses", json!([bundle_ids])).await?;
        Ok(result
            .value
            .into_iter()
            .flatten()
            .map(|entry| BundleStatus {
                landed: entry.confirmation_status.is_some(),
                bundle_id: entry.bundle_id,
            })
            .collect())
    }
}

// ============================================================================
// STATUS CHECKER
// ============================================================================

struct PendingBundle {
    deadline: Instant,
    waiter: oneshot::Sender<bool>,
}

/// Polls the relay for every pending bundle in batches and wakes waiters.
pub struct BundleStatusChecker {
    source: Arc<dyn BundleStatusSource>,
    pending: DashMap<String, PendingBundle>,
    poll_interval: Duration,
}

impl BundleStatusChecker {
    pub fn new(source: Arc<dyn BundleStatusSource>, poll_interval: Duration) -> Self {
        Self { source, pending: DashMap::new(), poll_interval }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub async fn wait_for(&self, bundle_id: &str, timeout: Duration) -> bool {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            bundle_id.to_string(),
            PendingBundle { deadline: Instant::now() + timeout, waiter: tx },
        );
        // the checker resolves on deadline; the outer bound covers a stalled checker
        match tokio::time::timeout(timeout + self.poll_interval * 2, rx).await {
            Ok(Ok(landed)) => landed,
            _ => {
                self.pending.remove(bundle_id);
                false
            }
        }
    }

    fn resolve(&self, bundle_id: &str, landed: bool) {
        if let Some((_, pending)) = self.pending.remove(bundle_id) {
            let _ = pending.waiter.send(landed);
        }
    }

    pub async fn check_pending(&self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.value().deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();
        for bundle_id in &expired {
            debug!("[bundle:{}] status check timed out", bundle_id);
            self.resolve(bundle_id, false);
        }

        let ids: Vec<String> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        for batch in ids.chunks(MAX_BUNDLE_IDS_PER_STATUS_CHECK) {
            match self.source.bundle_statuses(batch).await {
                Ok(statuses) => {
                    for status in statuses.into_iter().filter(|s| s.landed) {
                        self.resolve(&status.bundle_id, true);
                    }
                }
                Err(e) => warn!("Bundle status check failed: {:#}", e),
            }
        }
    }

    pub async fn run(self: Arc<Self>) {
        info!("📦 Checking bundle statuses every {:?}", self.poll_interval);
        let mut ticker = interval(self.poll_interval);
        loop {
            ticker.tick().await;
            if !self.pending.is_empty() {
                self.check_pending().await;
            }
        }
    }
}

// ============================================================================
// JITO SUBMITTER
// ============================================================================

pub struct JitoBundler {
    jito: Arc<JitoClient>,
    rpc: Arc<RpcClient>,
    tips: Arc<TipFeed>,
    checker: Arc<BundleStatusChecker>,
}

impl JitoBundler {
    pub fn new(jito: Arc<JitoClient>, rpc: Arc<RpcClient>, tips: Arc<TipFeed>, checker: Arc<BundleStatusChecker>) -> Self {
        Self { jito, rpc, tips, checker }
    }
}

#[async_trait]
impl BundleSubmitter for JitoBundler {
    async fn submit(&self, mut transactions: Vec<VersionedTransaction>, signer: &Keypair, tip_lamports: u64) -> Result<String> {
        if transactions.is_empty() || transactions.len() > MAX_TXS_PER_BUNDLE {
            bail!("A bundle carries 1 to {} transactions, got {}", MAX_TXS_PER_BUNDLE, transactions.len());
        }
        let tip_account = self.tips.random_tip_account().context("No tip accounts known")?;
        let blockhash = self
            .rpc
            .get_latest_blockhash()
            .await
            .context("Failed to fetch blockhash for tip")?;
        let tip_ix = system_instruction::transfer(&signer.pubkey(), &tip_account, tip_lamports);
        let tip_tx = Transaction::new_signed_with_payer(&[tip_ix], Some(&signer.pubkey()), &[signer], blockhash);
        transactions.push(VersionedTransaction::from(tip_tx));

        debug!("[jito] sending {} txs with a {} lamport tip", transactions.len(), tip_lamports);
        self.jito.send_bundle(&transactions).await
    }

    async fn await_result(&self, bundle_id: &str, timeout: Duration) -> bool {
        self.checker.wait_for(bundle_id, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// Lands every bundle whose id is listed; records batch sizes.
    struct ScriptedSource {
        landed: HashSet<String>,
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl BundleStatusSource for ScriptedSource {
        async fn bundle_statuses(&self, bundle_ids: &[String]) -> Result<Vec<BundleStatus>> {
            self.batches.lock().push(bundle_ids.len());
            Ok(bundle_ids
                .iter()
                .map(|id| BundleStatus { bundle_id: id.clone(), landed: self.landed.contains(id) })
                .collect())
        }
    }

    /// Records every submitted group and lands all but `fail_on`.
    struct CountingSubmitter {
        groups: Mutex<Vec<usize>>,
        fail_on: Option<usize>,
    }

    #[async_trait]
    impl BundleSubmitter for CountingSubmitter {
        async fn submit(&self, transactions: Vec<VersionedTransaction>, _signer: &Keypair, _tip: u64) -> Result<String> {
            let mut groups = self.groups.lock();
            groups.push(transactions.len());
            Ok(format!("bundle-{}", groups.len()))
        }

        async fn await_result(&self, bundle_id: &str, _timeout: Duration) -> bool {
            Some(bundle_id.to_string()) != self.fail_on.map(|n| format!("bundle-{}", n))
        }
    }

    #[tokio::test]
    async fn test_submit_atomic_splits_into_groups_of_four() {
        let submitter = CountingSubmitter { groups: Mutex::new(vec![]), fail_on: None };
        let txs = vec![VersionedTransaction::default(); 9];

        assert!(submit_atomic(&submitter, txs, &Keypair::new(), 1_000, Duration::from_millis(10)).await);
        assert_eq!(*submitter.groups.lock(), vec![4, 4, 1]);
    }

    #[tokio::test]
    async fn test_submit_atomic_stops_at_first_missing_group() {
        let submitter = CountingSubmitter { groups: Mutex::new(vec![]), fail_on: Some(1) };
        let txs = vec![VersionedTransaction::default(); 8];

        assert!(!submit_atomic(&submitter, txs, &Keypair::new(), 1_000, Duration::from_millis(10)).await);
        assert_eq!(*submitter.groups.lock(), vec![4]);
    }

    #[tokio::test]
    async fn test_status_checker_resolves_landed_and_expired() {
        let source = Arc::new(ScriptedSource {
            landed: HashSet::from(["good".to_string()]),
            batches: Mutex::new(vec![]),
        });
        let checker = Arc::new(BundleStatusChecker::new(source.clone(), Duration::from_millis(5)));
        tokio::spawn(checker.clone().run());

        let (good, bad) = tokio::join!(
            checker.wait_for("good", Duration::from_millis(200)),
            checker.wait_for("bad", Duration::from_millis(30)),
        );
        assert!(good);
        assert!(!bad);
        assert_eq!(checker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_status_checker_batches_ids() {
        let source = Arc::new(ScriptedSource { landed: HashSet::new(), batches: Mutex::new(vec![]) });
        let checker = Arc::new(BundleStatusChecker::new(source.clone(), Duration::from_secs(60)));

        let waits = (0..7).map(|i| {
            let checker = checker.clone();
            tokio::spawn(async move { checker.wait_for(&format!("b{}", i), Duration::from_secs(30)).await })
        });
        let handles: Vec<_> = waits.collect();
        while checker.pending_count() < 7 {
            tokio::task::yield_now().await;
        }
        checker.check_pending().await;

        assert_eq!(*source.batches.lock(), vec![5, 2]);
        for handle in handles {
            handle.abort();
        }
    }

    #[test]
    fn test_jito_endpoint_normalization() {
        let bare = JitoClient::new("mainnet.block-engine.jito.wtf").unwrap();
        assert_eq!(bare.endpoint, "https://mainnet.block-engine.jito.wtf/api/v1/bundles");

        let full = JitoClient::new("https://ny.mainnet.block-engine.jito.wtf/").unwrap();
        assert_eq!(full.endpoint, "https://ny.mainnet.block-engine.jito.wtf/api/v1/bundles");
    }
}
