//! Payback & distribution engine.
//!
//! Records recipient repayments against the amortization state and fans the
//! promised returns back out of escrow to investors proportionally to drawn
//! ownership shares.

use tracing::{info, warn};

use crate::errors::{EngineError, Result};
use crate::stage::{checked_transition, Stage};
use crate::types::InvestmentModel;
use crate::Engine;

/// Per-investor outcome of one distribution fan-out. One investor's
/// unreachable account never blocks payouts to the others; the failed set
/// is surfaced here and in the logs instead.
#[derive(Debug, Default, Clone)]
pub struct DistributionReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

impl Engine {
    /// A recipient pays towards a funded project.
    ///
    /// The gateway performs the combined payback instrument transfer and
    /// reports `pct`, the amortization-schedule fraction of this payment
    /// that converts to ownership transfer. Accounting here:
    ///
    /// * `bal_left   -= (1 - pct) * amount`
    /// * `amount_owed -= amount`
    /// * `ownership_shift += pct` (saturating at 1)
    ///
    /// Paying the balance down to exactly 0, or reaching full ownership,
    /// advances the project to stage 9.
    pub async fn payback(
        &self,
        recipient_index: u64,
        project_index: u64,
        asset_code: &str,
        amount: f64,
        recipient_seed: &str,
    ) -> Result<()> {
        if amount <= 0.0 {
            return Err(EngineError::NonPositiveAmount(amount));
        }

        let lock = self.project_lock(project_index);
        let _guard = lock.lock().await;

        let mut project = self.store.load_project(project_index).await?;
        if project.investment_type != InvestmentModel::Munibond {
            return Err(EngineError::UnsupportedModel);
        }

        let pct = self
            .chain
            .settle_payback(
                project_index,
                recipient_index,
                asset_code,
                amount,
                recipient_seed,
                project.total_value,
                &project.escrow_pubkey,
            )
            .await?;

        project.bal_left -= (1.0 - pct) * amount;
        project.amount_owed -= amount;
        project.ownership_shift = (project.ownership_shift + pct).min(1.0);
        project.date_last_paid = chrono::Utc::now().timestamp();

        if project.ownership_shift >= 1.0 {
            // full ownership transferred; residual rounding in the balance
            // no longer matters
            info!(project = project_index, "recipient now owns the asset completely");
            project.bal_left = 0.0;
            project.amount_owed = 0.0;
        }

        if project.bal_left == 0.0 && project.stage == Stage::Raised {
            info!(project = project_index, "loan paid off, transferring ownership");
            project.stage = checked_transition(project.stage, Stage::PaidOff)?;
        }

        self.store.save_project(&project).await?;

        self.distribute_payments(recipient_seed, project_index, amount)
            .await?;
        Ok(())
    }

    /// Fan the promised return on `amount` out of escrow to every investor
    /// in the ownership map. The sends draw on the project's recorded
    /// escrow account.
    ///
    /// Refuses (with zero transfers) while the escrow is externally locked.
    /// Per-investor transfer failures are isolated: logged, collected into
    /// the report, and the loop continues. No rollback, no retry.
    pub async fn distribute_payments(
        &self,
        recipient_seed: &str,
        project_index: u64,
        amount: f64,
    ) -> Result<DistributionReport> {
        if amount <= 0.0 {
            return Err(EngineError::NonPositiveAmount(amount));
        }

        let project = self.store.load_project(project_index).await?;

        if project.escrow_lock {
            warn!(project = project_index, "escrow locked, distribution blocked");
            return Err(EngineError::EscrowLocked(project_index));
        }

        let rate = if project.interest_rate != 0.0 {
            project.interest_rate
        } else {
            self.config.default_interest_rate
        };
        let pool = rate * amount;

        let mut report = DistributionReport::default();
        for (pubkey, share) in &project.investor_map {
            let tx_amount = share * pool;
            match self
                .chain
                .escrow_send(&project.escrow_pubkey, pubkey, tx_amount, recipient_seed, "returns")
                .await
            {
                Ok(_) => report.succeeded.push(pubkey.clone()),
                Err(e) => {
                    warn!(
                        project = project_index,
                        pubkey,
                        error = %e,
                        "return transfer failed, continuing with remaining investors"
                    );
                    report.failed.push(pubkey.clone());
                }
            }
        }

        info!(
            project = project_index,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "returns distributed"
        );
        Ok(report)
    }

    /// Stage a waterfall payout account the recipient must pay towards.
    /// Write-only for now; consumed by a future distribution pass.
    pub async fn add_waterfall_account(
        &self,
        project_index: u64,
        pubkey: &str,
        amount: f64,
    ) -> Result<()> {
        if amount <= 0.0 {
            return Err(EngineError::NonPositiveAmount(amount));
        }

        let lock = self.project_lock(project_index);
        let _guard = lock.lock().await;

        let mut project = self.store.load_project(project_index).await?;
        project.waterfall_map.insert(pubkey.to_string(), amount);
        self.store.save_project(&project).await?;
        Ok(())
    }
}
