//! Engine configuration loaded from environment variables.
//!
//! Every timeout and escalation threshold the lifecycle core consumes lives
//! here and is injected into the engine explicitly, so tests can shrink the
//! poll intervals to milliseconds and pick their own escalation bands.

use crate::errors::{EngineError, Result};
use crate::monitor::EscalationBands;

#[derive(Debug, Clone)]
pub struct Config {
    /// Chain-gateway endpoint handling wallet, issuer and escrow primitives.
    pub gateway_url: String,
    /// Path / URL of the SQLite ledger store.
    pub database_url: String,
    /// Mainnet vs test network; selects the settlement asset for first-loss
    /// cover transfers.
    pub mainnet: bool,
    /// Seed of the platform signing account (2-of-2 escrow co-signer).
    pub platform_seed: String,

    // ── Settlement assets ────────────────────────────────
    /// Test-network settlement asset.
    pub stablecoin_code: String,
    pub stablecoin_issuer: String,
    /// Mainnet settlement asset.
    pub anchor_usd_code: String,
    pub anchor_usd_issuer: String,

    // ── Asset-code derivation ────────────────────────────
    pub investor_asset_prefix: String,
    pub debt_asset_prefix: String,
    pub payback_asset_prefix: String,
    /// Fixed asset code assigned on a project's first seed investment.
    pub seed_asset_code: String,

    // ── Timing ───────────────────────────────────────────
    /// How often the escrow release pipeline re-checks the unlock flag.
    pub unlock_poll_secs: u64,
    /// How long the pipeline waits for the recipient unlock before giving up.
    pub unlock_wait_secs: u64,
    /// Payback monitor cycle period.
    pub monitor_interval_secs: u64,
    /// Backoff before the single recipient-lookup retry on a full raise.
    pub recipient_retry_secs: u64,

    // ── Payback policy ───────────────────────────────────
    /// Expected monthly payback obligation accrued by the monitor.
    pub monthly_bill: f64,
    /// Distribution return rate used when a project defines none.
    pub default_interest_rate: f64,
    pub bands: EscalationBands,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gateway_url: "http://127.0.0.1:8090".to_string(),
            database_url: "sqlite:./munifund.db".to_string(),
            mainnet: false,
            platform_seed: String::new(),
            stablecoin_code: "STABLEUSD".to_string(),
            stablecoin_issuer: "GSTABLEISSUERPLACEHOLDER".to_string(),
            anchor_usd_code: "USD".to_string(),
            anchor_usd_issuer: "GANCHORISSUERPLACEHOLDER".to_string(),
            investor_asset_prefix: "MUNI".to_string(),
            debt_asset_prefix: "MUNIDEBT".to_string(),
            payback_asset_prefix: "MUNIPB".to_string(),
            seed_asset_code: "SEEDASSET".to_string(),
            unlock_poll_secs: 10,
            unlock_wait_secs: 3 * 24 * 3600,
            monitor_interval_secs: 7 * 24 * 3600,
            recipient_retry_secs: 3600,
            monthly_bill: 120.0,
            default_interest_rate: 0.05,
            bands: EscalationBands::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        let config = Config {
            gateway_url: env_var("GATEWAY_URL").unwrap_or(defaults.gateway_url),
            database_url: env_var("DATABASE_URL").unwrap_or(defaults.database_url),
            mainnet: env_var("MAINNET")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            platform_seed: env_var("PLATFORM_SEED").ok_or_else(|| {
                EngineError::Config("PLATFORM_SEED environment variable is required".to_string())
            })?,
            stablecoin_code: env_var("STABLECOIN_CODE").unwrap_or(defaults.stablecoin_code),
            stablecoin_issuer: env_var("STABLECOIN_ISSUER").unwrap_or(defaults.stablecoin_issuer),
            anchor_usd_code: env_var("ANCHOR_USD_CODE").unwrap_or(defaults.anchor_usd_code),
            anchor_usd_issuer: env_var("ANCHOR_USD_ISSUER").unwrap_or(defaults.anchor_usd_issuer),
            investor_asset_prefix: defaults.investor_asset_prefix,
            debt_asset_prefix: defaults.debt_asset_prefix,
            payback_asset_prefix: defaults.payback_asset_prefix,
            seed_asset_code: defaults.seed_asset_code,
            unlock_poll_secs: parse_var("UNLOCK_POLL_SECS", defaults.unlock_poll_secs)?,
            unlock_wait_secs: parse_var("UNLOCK_WAIT_SECS", defaults.unlock_wait_secs)?,
            monitor_interval_secs: parse_var("MONITOR_INTERVAL_SECS", defaults.monitor_interval_secs)?,
            recipient_retry_secs: parse_var("RECIPIENT_RETRY_SECS", defaults.recipient_retry_secs)?,
            monthly_bill: parse_var("MONTHLY_BILL", defaults.monthly_bill)?,
            default_interest_rate: parse_var("DEFAULT_INTEREST_RATE", defaults.default_interest_rate)?,
            bands: EscalationBands {
                stern: parse_var("STERN_THRESHOLD", defaults.bands.stern)?,
                disconnect: parse_var("DISCONNECT_THRESHOLD", defaults.bands.disconnect)?,
            },
        };

        config.bands.validate().map_err(EngineError::Config)?;
        Ok(config)
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| EngineError::Config(format!("Invalid {key}"))),
        Err(_) => Ok(default),
    }
}
