//! # Types
//!
//! Ledger record types shared across the lifecycle engine.
//!
//! ## Ownership model
//!
//! Every record is exclusively owned by the [`LedgerStore`](crate::store::LedgerStore);
//! the engine borrows a record for the duration of one operation and persists
//! any mutation before releasing the per-project serialization lock.
//!
//! ## Money
//!
//! Monetary fields are `f64`, matching the gateway's decimal amounts. The
//! raise-completion and pay-off triggers compare exactly (`==`), which is
//! sound because both sides of the comparison are sums of the same accepted
//! amounts — see the conservation tests in `test_lifecycle`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::stage::Stage;

/// Financing model of a project. Munibond is the only supported model;
/// anything else deserializes to `Unsupported` and is rejected by every
/// money-moving operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvestmentModel {
    #[default]
    Munibond,
    #[serde(other)]
    Unsupported,
}

/// Settlement chain a project raises on. Only Stellar settlement is
/// implemented; other values are rejected at the pre-investment check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementChain {
    #[default]
    Stellar,
    Algorand,
    #[serde(other)]
    Unknown,
}

/// The central record: one financed project.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Project {
    /// Stable integer identity; the ledger-store key.
    pub index: u64,
    pub stage: Stage,
    /// Short human label; asset codes are derived from it.
    pub metadata: String,
    pub investment_type: InvestmentModel,
    pub chain: SettlementChain,

    // ── Raise accounting ─────────────────────────────────
    pub total_value: f64,
    pub money_raised: f64,
    /// Extra returns owed to seed investors (seed multiplier surplus).
    pub seed_money_raised: f64,
    pub seed_investment_cap: f64,
    /// Multiplier applied to seed-round instruments (>= 1).
    pub seed_investment_factor: f64,
    pub votes: f64,

    // ── Payback accounting ───────────────────────────────
    pub bal_left: f64,
    pub amount_owed: f64,
    /// Fraction of asset ownership transferred to the recipient.
    /// Monotone non-decreasing, saturates at 1.
    pub ownership_shift: f64,
    /// Distribution return rate; 0 means "use the platform default".
    pub interest_rate: f64,

    // ── Chain-side identifiers ───────────────────────────
    pub investor_asset_code: String,
    pub seed_asset_code: String,
    pub debt_asset_code: String,
    pub payback_asset_code: String,

    /// Every contributing investor, in order; duplicates represent
    /// successive investments by the same party.
    pub investor_indices: Vec<u64>,
    /// Investor pubkey -> proportional ownership share. Recomputed from
    /// on-chain balances after every investment, never accumulated, so a
    /// failed balance query zeroes only that investor's share.
    pub investor_map: HashMap<String, f64>,
    /// Pubkey -> pending payout staging (write-only for now).
    pub waterfall_map: HashMap<String, f64>,

    // ── Funding-complete gate ────────────────────────────
    /// True between full raise and recipient unlock; blocks fund transfer.
    pub lock: bool,
    /// Transient seed-decryption secret carried across the unlock boundary.
    /// Must be cleared as soon as the escrow setup has read it.
    pub lock_pwd: String,
    pub escrow_pubkey: String,
    /// External hold on the escrow; blocks every distribution attempt.
    pub escrow_lock: bool,

    /// Unix timestamp of the last successful payback.
    pub date_last_paid: i64,
    /// Acquisition period in years; amortization spans `this * 12` months.
    pub estimated_acquisition: u32,
    /// Expected payback interval, in weeks.
    pub payback_period_weeks: u32,

    // ── Relationships ────────────────────────────────────
    pub originator_index: u64,
    pub recipient_index: u64,
    pub guarantor_index: u64,
}

impl Project {
    /// Amount still needed to reach the raise target.
    pub fn remaining_gap(&self) -> f64 {
        self.total_value - self.money_raised
    }

    /// Payback-instrument units to issue for `amount`: the amortization
    /// span (acquisition years × 12 months) scaled by the share of the
    /// total the amount represents.
    pub fn payback_units(&self, amount: f64) -> f64 {
        (amount / self.total_value) * f64::from(self.estimated_acquisition * 12)
    }
}

/// An investor identity with a consumable vote budget and a wallet handle.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Investor {
    pub index: u64,
    pub name: String,
    pub email: String,
    pub pubkey: String,
    pub encrypted_seed: Vec<u8>,
    /// Internal spending balance available for investments.
    pub balance: f64,
    /// Consumable budget for proposal votes.
    pub voting_balance: f64,
    /// Opted in to payback-alert emails.
    pub notification: bool,
}

impl Investor {
    pub fn can_invest(&self, amount: f64) -> bool {
        amount > 0.0 && self.balance >= amount
    }
}

/// The party receiving funded projects and paying them back.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Recipient {
    pub index: u64,
    pub name: String,
    pub email: String,
    /// Login identity consumed by the store-side credential check.
    pub username: String,
    pub pwhash: String,
    pub pubkey: String,
    pub encrypted_seed: Vec<u8>,
}

/// A platform entity: originator or guarantor.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Entity {
    pub index: u64,
    pub name: String,
    pub email: String,
    pub pubkey: String,
    pub encrypted_seed: Vec<u8>,
    pub kyc: bool,
    pub banned: bool,
    pub reputation: f64,
    /// Seed password used when the guarantor's first-loss cover kicks in.
    pub first_loss_guarantee_pwd: String,
    /// Ceiling on first-loss coverage.
    pub first_loss_guarantee_amt: f64,
}
