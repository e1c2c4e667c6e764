//! Chain service boundary — wallet, issuer, instrument and escrow primitives.
//!
//! The engine never touches ledger transactions directly; everything chain-
//! side goes through [`ChainService`]. [`GatewayChain`] talks to the platform
//! chain gateway over JSON, with capped back-off on rate limiting. Tests use
//! a scriptable mock.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::config::Config;
use crate::errors::{ChainError, ChainResult};

const MAX_BACKOFF_SECS: u64 = 60;
const INITIAL_BACKOFF_SECS: u64 = 2;
const MAX_RATE_LIMIT_RETRIES: u32 = 5;

/// Maximum length of a derived asset code.
const ASSET_CODE_LEN: usize = 12;

/// Everything the lifecycle core consumes from the chain side.
///
/// All calls are remote and fallible; the engine treats each failure as a
/// remote error per its taxonomy and never retries money-moving calls.
#[async_trait]
pub trait ChainService: Send + Sync {
    async fn account_exists(&self, pubkey: &str) -> ChainResult<bool>;
    async fn asset_balance(&self, pubkey: &str, asset_code: &str) -> ChainResult<f64>;

    // ── Wallet ───────────────────────────────────────────
    async fn pubkey_from_seed(&self, seed: &str) -> ChainResult<String>;
    async fn decrypt_seed(&self, encrypted: &[u8], password: &str) -> ChainResult<String>;

    // ── Issuer (one per project, provisioned lazily) ─────
    async fn init_issuer(&self, project_index: u64) -> ChainResult<()>;
    async fn fund_issuer(&self, project_index: u64) -> ChainResult<()>;

    // ── Instruments ──────────────────────────────────────
    /// Issue the munibond investment instrument for `amount`, scaled by
    /// `seed_factor` when investing in the seed sub-round. Returns a tx hash.
    #[allow(clippy::too_many_arguments)]
    async fn issue_investment(
        &self,
        project_index: u64,
        investor_index: u64,
        investor_seed: &str,
        asset_code: &str,
        amount: f64,
        total_value: f64,
        seed_factor: f64,
        seed_round: bool,
    ) -> ChainResult<String>;

    /// Issue the debt and payback instruments to the recipient,
    /// `units` payback-asset units against `amount` of debt.
    #[allow(clippy::too_many_arguments)]
    async fn issue_recipient_instruments(
        &self,
        project_index: u64,
        recipient_index: u64,
        debt_asset: &str,
        payback_asset: &str,
        units: f64,
        recipient_seed: &str,
        amount: f64,
        payback_period_weeks: u32,
    ) -> ChainResult<()>;

    /// Combined payback instrument transfer. Returns `pct`, the fraction of
    /// this payment that converts to ownership transfer, as determined by
    /// the gateway's amortization schedule.
    #[allow(clippy::too_many_arguments)]
    async fn settle_payback(
        &self,
        project_index: u64,
        recipient_index: u64,
        asset_code: &str,
        amount: f64,
        recipient_seed: &str,
        total_value: f64,
        escrow_pubkey: &str,
    ) -> ChainResult<f64>;

    // ── Escrow (2-of-2, platform + recipient) ────────────
    async fn init_escrow(
        &self,
        project_index: u64,
        recipient_pubkey: &str,
        recipient_seed: &str,
    ) -> ChainResult<String>;

    async fn escrow_deposit(
        &self,
        project_index: u64,
        escrow_pubkey: &str,
        amount: f64,
    ) -> ChainResult<()>;

    /// Send `amount` out of the escrow to `dest`. Platform co-signs.
    async fn escrow_send(
        &self,
        escrow_pubkey: &str,
        dest: &str,
        amount: f64,
        recipient_seed: &str,
        memo: &str,
    ) -> ChainResult<String>;

    /// Plain asset transfer, used for the guarantor's first-loss cover.
    #[allow(clippy::too_many_arguments)]
    async fn send_asset(
        &self,
        asset_code: &str,
        issuer: &str,
        dest: &str,
        amount: f64,
        source_seed: &str,
        memo: &str,
    ) -> ChainResult<String>;
}

/// Derive an asset code from a project's metadata label: prefix plus the
/// alphanumeric part of the label, uppercased and clamped to the chain's
/// code length.
pub fn asset_id(prefix: &str, metadata: &str) -> String {
    let tag: String = metadata
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_uppercase();
    let mut code = format!("{prefix}{tag}");
    code.truncate(ASSET_CODE_LEN);
    code
}

// ─────────────────────────────────────────────────────────
// Gateway client
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    result: Option<Value>,
    error: Option<GatewayError>,
}

#[derive(Debug, Deserialize)]
struct GatewayError {
    code: i64,
    message: String,
}

pub struct GatewayChain {
    client: Client,
    base_url: String,
    platform_seed: String,
}

impl GatewayChain {
    pub fn new(config: &Config) -> ChainResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(GatewayChain {
            client,
            base_url: config.gateway_url.trim_end_matches('/').to_string(),
            platform_seed: config.platform_seed.clone(),
        })
    }

    /// POST one gateway method. Rate-limit responses are retried with capped
    /// back-off; every other failure surfaces to the caller — money-moving
    /// methods must not be blindly retried.
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> ChainResult<T> {
        let url = format!("{}/call", self.base_url);
        let mut backoff = INITIAL_BACKOFF_SECS;
        let mut attempts = 0u32;

        loop {
            let resp = self
                .client
                .post(&url)
                .json(&json!({ "method": method, "params": params }))
                .send()
                .await?;

            if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                attempts += 1;
                if attempts > MAX_RATE_LIMIT_RETRIES {
                    return Err(ChainError::Rejected(format!(
                        "gateway rate limit persisted through {MAX_RATE_LIMIT_RETRIES} retries"
                    )));
                }
                warn!(method, "rate-limited by gateway (retrying in {backoff}s)");
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
                continue;
            }

            let body: GatewayResponse = resp.json().await?;
            if let Some(err) = body.error {
                return Err(ChainError::Rejected(format!(
                    "{} (code {})",
                    err.message, err.code
                )));
            }
            let result = body
                .result
                .ok_or_else(|| ChainError::Rejected("empty gateway result".to_string()))?;
            return Ok(serde_json::from_value(result)?);
        }
    }
}

#[async_trait]
impl ChainService for GatewayChain {
    async fn account_exists(&self, pubkey: &str) -> ChainResult<bool> {
        self.call("accountExists", json!({ "pubkey": pubkey })).await
    }

    async fn asset_balance(&self, pubkey: &str, asset_code: &str) -> ChainResult<f64> {
        self.call(
            "assetBalance",
            json!({ "pubkey": pubkey, "asset": asset_code }),
        )
        .await
    }

    async fn pubkey_from_seed(&self, seed: &str) -> ChainResult<String> {
        self.call("pubkeyFromSeed", json!({ "seed": seed })).await
    }

    async fn decrypt_seed(&self, encrypted: &[u8], password: &str) -> ChainResult<String> {
        self.call(
            "decryptSeed",
            json!({ "blob": BASE64.encode(encrypted), "password": password }),
        )
        .await
        .map_err(|e| match e {
            // a rejection here means the password did not check out
            ChainError::Rejected(_) => ChainError::BadSeed,
            other => other,
        })
    }

    async fn init_issuer(&self, project_index: u64) -> ChainResult<()> {
        self.call::<Value>("initIssuer", json!({ "project": project_index }))
            .await
            .map(|_| ())
    }

    async fn fund_issuer(&self, project_index: u64) -> ChainResult<()> {
        self.call::<Value>(
            "fundIssuer",
            json!({ "project": project_index, "platformSeed": self.platform_seed }),
        )
        .await
        .map(|_| ())
    }

    async fn issue_investment(
        &self,
        project_index: u64,
        investor_index: u64,
        investor_seed: &str,
        asset_code: &str,
        amount: f64,
        total_value: f64,
        seed_factor: f64,
        seed_round: bool,
    ) -> ChainResult<String> {
        self.call(
            "issueInvestment",
            json!({
                "project": project_index,
                "investor": investor_index,
                "investorSeed": investor_seed,
                "asset": asset_code,
                "amount": amount,
                "totalValue": total_value,
                "seedFactor": seed_factor,
                "seedRound": seed_round,
            }),
        )
        .await
    }

    async fn issue_recipient_instruments(
        &self,
        project_index: u64,
        recipient_index: u64,
        debt_asset: &str,
        payback_asset: &str,
        units: f64,
        recipient_seed: &str,
        amount: f64,
        payback_period_weeks: u32,
    ) -> ChainResult<()> {
        self.call::<Value>(
            "issueRecipientInstruments",
            json!({
                "project": project_index,
                "recipient": recipient_index,
                "debtAsset": debt_asset,
                "paybackAsset": payback_asset,
                "units": units,
                "recipientSeed": recipient_seed,
                "amount": amount,
                "paybackPeriodWeeks": payback_period_weeks,
            }),
        )
        .await
        .map(|_| ())
    }

    async fn settle_payback(
        &self,
        project_index: u64,
        recipient_index: u64,
        asset_code: &str,
        amount: f64,
        recipient_seed: &str,
        total_value: f64,
        escrow_pubkey: &str,
    ) -> ChainResult<f64> {
        self.call(
            "settlePayback",
            json!({
                "project": project_index,
                "recipient": recipient_index,
                "asset": asset_code,
                "amount": amount,
                "recipientSeed": recipient_seed,
                "totalValue": total_value,
                "escrow": escrow_pubkey,
            }),
        )
        .await
    }

    async fn init_escrow(
        &self,
        project_index: u64,
        recipient_pubkey: &str,
        recipient_seed: &str,
    ) -> ChainResult<String> {
        self.call(
            "initEscrow",
            json!({
                "project": project_index,
                "recipientPubkey": recipient_pubkey,
                "recipientSeed": recipient_seed,
                "platformSeed": self.platform_seed,
            }),
        )
        .await
    }

    async fn escrow_deposit(
        &self,
        project_index: u64,
        escrow_pubkey: &str,
        amount: f64,
    ) -> ChainResult<()> {
        self.call::<Value>(
            "escrowDeposit",
            json!({
                "project": project_index,
                "escrow": escrow_pubkey,
                "amount": amount,
                "platformSeed": self.platform_seed,
            }),
        )
        .await
        .map(|_| ())
    }

    async fn escrow_send(
        &self,
        escrow_pubkey: &str,
        dest: &str,
        amount: f64,
        recipient_seed: &str,
        memo: &str,
    ) -> ChainResult<String> {
        self.call(
            "escrowSend",
            json!({
                "escrow": escrow_pubkey,
                "dest": dest,
                "amount": amount,
                "recipientSeed": recipient_seed,
                "platformSeed": self.platform_seed,
                "memo": memo,
            }),
        )
        .await
    }

    async fn send_asset(
        &self,
        asset_code: &str,
        issuer: &str,
        dest: &str,
        amount: f64,
        source_seed: &str,
        memo: &str,
    ) -> ChainResult<String> {
        self.call(
            "sendAsset",
            json!({
                "asset": asset_code,
                "issuer": issuer,
                "dest": dest,
                "amount": amount,
                "sourceSeed": source_seed,
                "memo": memo,
            }),
        )
        .await
    }
}
