//! Swap Engine Service
//!
//! Jupiter quote and swap-transaction builder used by the ledger client.

use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use solana_sdk::{
    pubkey::Pubkey,
    signature::{Keypair, Signer},
    transaction::VersionedTransaction,
};

use crate::services::ledger::SwapQuote;

/// Jupiter API quote response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JupiterQuote {
    #[serde(rename = "inputMint")]
    pub input_mint: String,
    #[serde(rename = "inAmount")]
    pub in_amount: String,
    #[serde(rename = "outputMint")]
    pub output_mint: String,
    #[serde(rename = "outAmount")]
    pub out_amount: String,
    #[serde(rename = "otherAmountThreshold")]
    pub other_amount_threshold: Option<String>,
    #[serde(rename = "swapMode")]
    pub swap_mode: Option<String>,
    #[serde(rename = "slippageBps")]
    pub slippage_bps: Option<u16>,
    #[serde(rename = "platformFee")]
    pub platform_fee: Option<serde_json::Value>,
    #[serde(rename = "priceImpactPct")]
    pub price_impact_pct: Option<String>,
    #[serde(rename = "routePlan")]
    pub route_plan: Option<serde_json::Value>,
    #[serde(rename = "contextSlot")]
    pub context_slot: Option<u64>,
    #[serde(rename = "timeTaken")]
    pub time_taken: Option<f64>,
}

impl JupiterQuote {
    pub fn to_swap_quote(&self) -> Result<SwapQuote> {
        let in_amount: u64 = self.in_amount.parse().context("Failed to parse input amount")?;
        let out_amount: u64 = self.out_amount.parse().context("Failed to parse output amount")?;
        // ExactIn quotes report the minimum output as otherAmountThreshold
        let min_out_amount = match &self.other_amount_threshold {
            Some(threshold) => threshold.parse().context("Failed to parse output threshold")?,
            None => out_amount,
        };
        Ok(SwapQuote { in_amount, out_amount, min_out_amount })
    }
}

/// Jupiter API swap response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JupiterSwapResponse {
    #[serde(rename = "swapTransaction")]
    pub swap_transaction: String,
}

/// Jupiter swap request payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JupiterSwapRequest {
    #[serde(rename = "userPublicKey")]
    pub user_public_key: String,
    #[serde(rename = "quoteResponse")]
    pub quote_response: JupiterQuote,
    #[serde(rename = "wrapAndUnwrapSol")]
    pub wrap_and_unwrap_sol: bool,
    #[serde(rename = "prioritizationFeeLamports")]
    pub prioritization_fee_lamports: Option<u64>,
}

pub struct JupiterSwapEngine {
    client: reqwest::Client,
    base_url: String,
    priority_fee_lamports: u64,
}

impl JupiterSwapEngine {
    pub fn new(base_url: &str, priority_fee_lamports: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            priority_fee_lamports,
        })
    }

    /// Fetch quote from Jupiter
    pub async fn fetch_quote(
        &self,
        input_mint: &Pubkey,
        output_mint: &Pubkey,
        amount: u64,
        slippage_bps: u16,
    ) -> Result<JupiterQuote> {
        let params = [
            ("inputMint", input_mint.to_string()),
            ("outputMint", output_mint.to_string()),
            ("amount", amount.to_string()),
            ("slippageBps", slippage_bps.to_string()),
        ];

        let response = self
            .client
            .get(format!("{}/quote", self.base_url))
            .query(&params)
            .send()
            .await
            .context("Failed to send quote request")?;

        if !response.status().is_success() {
            anyhow::bail!("Jupiter quote API returned error: {}", response.status());
        }

        response.json().await.context("Failed to parse quote response")
    }

    /// Ask Jupiter to build the swap for `quote` and sign it with `signer`
    pub async fn build_swap_transaction(&self, signer: &Keypair, quote: JupiterQuote) -> Result<VersionedTransaction> {
        let swap_request = JupiterSwapRequest {
            user_public_key: signer.pubkey().to_string(),
            quote_response: quote,
            wrap_and_unwrap_sol: true,
            prioritization_fee_lamports: Some(self.priority_fee_lamports),
        };

        let response = self
            .client
            .post(format!("{}/swap", self.base_url))
            .json(&swap_request)
            .send()
            .await
            .context("Failed to send swap request")?;

        if !response.status().is_success() {
            anyhow::bail!("Jupiter swap API returned error: {}", response.status());
        }

        let swap_response: JupiterSwapResponse = response
            .json()
            .await
            .context("Failed to parse swap response")?;

        sign_swap_transaction(&swap_response.swap_transaction, signer)
    }
}

/// Decode a base64 Jupiter transaction and sign it at the signer's slot
pub fn sign_swap_transaction(encoded: &str, signer: &Keypair) -> Result<VersionedTransaction> {
    let transaction_bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .context("Failed to decode swap transaction")?;

    let mut versioned_tx: VersionedTransaction = bincode::deserialize(&transaction_bytes)
        .context("Failed to deserialize versioned transaction")?;

    // Find the signer index in the message's account keys
    let idx = versioned_tx
        .message
        .static_account_keys()
        .iter()
        .position(|key| key == &signer.pubkey())
        .context("Keypair not in message account keys")?;

    let msg_data = versioned_tx.message.serialize();
    let signature = signer.sign_message(&msg_data);
    let slot = versioned_tx
        .signatures
        .get_mut(idx)
        .context("Signer is not a required signer of the swap transaction")?;
    *slot = signature;

    Ok(versioned_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::{
        hash::Hash,
        message::{VersionedMessage, v0},
        signature::Signature,
        system_instruction,
    };

    #[test]
    fn test_quote_threshold_becomes_min_out() {
        let quote: JupiterQuote = serde_json::from_value(serde_json::json!({
            "inputMint": "So11111111111111111111111111111111111111112",
            "inAmount": "1000000",
            "outputMint": "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
            "outAmount": "150000",
            "otherAmountThreshold": "147750",
            "swapMode": "ExactIn",
            "slippageBps": 150
        }))
        .unwrap();

        let estimate = quote.to_swap_quote().unwrap();
        assert_eq!(estimate.in_amount, 1_000_000);
        assert_eq!(estimate.out_amount, 150_000);
        assert_eq!(estimate.min_out_amount, 147_750);
    }

    #[test]
    fn test_sign_swap_transaction_fills_signer_slot() {
        let signer = Keypair::new();
        let ix = system_instruction::transfer(&signer.pubkey(), &Pubkey::new_unique(), 1);
        let message = v0::Message::try_compile(&signer.pubkey(), &[ix], &[], Hash::default()).unwrap();
        let unsigned = VersionedTransaction {
            signatures: vec![Signature::default()],
            message: VersionedMessage::V0(message),
        };
        let encoded = base64::engine::general_purpose::STANDARD.encode(bincode::serialize(&unsigned).unwrap());

        let signed = sign_swap_transaction(&encoded, &signer).unwrap();
        assert_ne!(signed.signatures[0], Signature::default());
        assert!(signed.verify_with_results().iter().all(|ok| *ok));
    }
}
