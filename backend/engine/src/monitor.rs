//! Payback monitor — one unbounded supervisory loop per funded project.
//!
//! Each cycle reloads the project, recipient and guarantor records, computes
//! how many payback periods have elapsed since the last payment (`factor`),
//! accrues the expected obligation, and escalates along an ordered ladder:
//! on-track, gentle reminder, stern reminders to all parties, and finally a
//! disconnection notice plus the guarantor's first-loss cover.
//!
//! The loop runs until the engine shuts down or the project record is
//! archived out from under it; either exit is observable, never silent.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{EngineError, Result, StoreError};
use crate::types::{Entity, Project};
use crate::Engine;

const ONE_WEEK_SECS: f64 = 7.0 * 24.0 * 3600.0;

/// Escalation thresholds over `factor` (elapsed time since last payment,
/// in payback periods). The bands they induce are ordered, mutually
/// exclusive and exhaustive by construction:
///
/// * `factor <= 1`                — on track
/// * `1 < factor < stern`         — gentle reminder
/// * `stern <= factor < disconnect` — stern reminders to all parties
/// * `factor >= disconnect`       — disconnection + first-loss cover
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct EscalationBands {
    pub stern: f64,
    pub disconnect: f64,
}

impl Default for EscalationBands {
    fn default() -> Self {
        // defaults expressed in missed weekly periods
        EscalationBands { stern: 4.0, disconnect: 8.0 }
    }
}

impl EscalationBands {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.stern > 1.0 && self.disconnect > self.stern {
            Ok(())
        } else {
            Err(format!(
                "escalation bands must satisfy 1 < stern < disconnect (got {} / {})",
                self.stern, self.disconnect
            ))
        }
    }

    pub fn band_for(&self, factor: f64) -> Band {
        if factor <= 1.0 {
            Band::OnTrack
        } else if factor < self.stern {
            Band::Gentle
        } else if factor < self.disconnect {
            Band::Stern
        } else {
            Band::Disconnect
        }
    }
}

/// Escalation level of one monitor cycle; each level is strictly more
/// severe than the previous.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Band {
    OnTrack,
    Gentle,
    Stern,
    Disconnect,
}

/// Start a project's payback monitor as a supervised background task.
pub(crate) fn spawn(engine: Engine, project_index: u64, recipient_index: u64) {
    let cancel = engine.shutdown.child_token();
    tokio::spawn(run(engine, project_index, recipient_index, cancel));
}

pub(crate) async fn run(
    engine: Engine,
    project_index: u64,
    recipient_index: u64,
    cancel: CancellationToken,
) {
    let interval = Duration::from_secs(engine.config.monitor_interval_secs);
    info!(project = project_index, "payback monitor started");

    loop {
        match cycle(&engine, project_index, recipient_index).await {
            Ok(band) => {
                debug!(project = project_index, band = ?band, "monitor cycle complete");
            }
            // the project was archived out from under us: stop monitoring,
            // but leave a trace
            Err(EngineError::Store(StoreError::NotFound { kind: "project", .. })) => {
                warn!(project = project_index, "project record unreachable, monitor exiting");
                engine
                    .notifier
                    .operator_alert(project_index, "project record unreachable; payback monitor exited")
                    .await;
                return;
            }
            // everything else (missing recipient/guarantor, chain trouble)
            // is retried next cycle
            Err(e) => {
                warn!(project = project_index, error = %e, "monitor cycle failed, retrying next period");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!(project = project_index, "payback monitor shut down");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// One monitoring cycle. Returns the band acted on.
///
/// `amount_owed` accrual is deliberately not persisted: `factor` is computed
/// from `date_last_paid` each cycle, so the accrued obligation is already
/// cumulative — persisting it would double-count. The store's `amount_owed`
/// only moves on actual paybacks.
pub(crate) async fn cycle(
    engine: &Engine,
    project_index: u64,
    recipient_index: u64,
) -> Result<Band> {
    let lock = engine.project_lock(project_index);
    let _guard = lock.lock().await;

    let mut project = engine.store.load_project(project_index).await?;
    let recipient = engine.store.load_recipient(recipient_index).await?;
    let guarantor = engine.store.load_entity(project.guarantor_index).await?;

    // floored to 1s to avoid dividing by zero on unconfigured projects
    let period = (f64::from(project.payback_period_weeks) * ONE_WEEK_SECS).max(1.0);
    let elapsed = (chrono::Utc::now().timestamp() - project.date_last_paid) as f64;
    let factor = elapsed / period;
    project.amount_owed += factor * engine.config.monthly_bill;

    let band = engine.config.bands.band_for(factor);
    match band {
        Band::OnTrack => {
            debug!(project = project_index, recipient = %recipient.email, "payments on track");
        }
        Band::Gentle => {
            engine
                .notifier
                .gentle_payback_reminder(project_index, &recipient.email)
                .await;
        }
        Band::Stern => {
            engine
                .notifier
                .stern_payback_reminder(project_index, &recipient.email)
                .await;
            notify_investors(engine, &project, Band::Stern).await;
            engine
                .notifier
                .stern_payback_reminder_guarantor(project_index, &guarantor.email)
                .await;
        }
        Band::Disconnect => {
            notify_investors(engine, &project, Band::Disconnect).await;
            engine
                .notifier
                .disconnection_notice_guarantor(project_index, &guarantor.email)
                .await;
            engine
                .first_loss_transfer(&project, &guarantor, project.amount_owed)
                .await?;
        }
    }

    Ok(band)
}

/// Alert every notification-opted-in investor. Unreachable investor records
/// are skipped, counted and logged; they never abort the fan-out.
async fn notify_investors(engine: &Engine, project: &Project, band: Band) {
    let mut failed = 0usize;
    let distinct: BTreeSet<u64> = project.investor_indices.iter().copied().collect();

    for index in distinct {
        let investor = match engine.store.load_investor(index).await {
            Ok(investor) => investor,
            Err(e) => {
                warn!(investor = index, error = %e, "skipping unreachable investor record");
                failed += 1;
                continue;
            }
        };
        if !investor.notification {
            continue;
        }
        match band {
            Band::Stern => {
                engine
                    .notifier
                    .stern_payback_reminder_investor(project.index, &investor.email)
                    .await;
            }
            Band::Disconnect => {
                engine
                    .notifier
                    .disconnection_notice_investor(project.index, &investor.email)
                    .await;
            }
            _ => {}
        }
    }

    if failed > 0 {
        warn!(
            project = project.index,
            failed, "some investor records could not be loaded for alerts"
        );
    }
}

impl Engine {
    /// Cover investors' first loss from the guarantor's account.
    ///
    /// The requested amount is clamped to the guarantor's guarantee ceiling;
    /// the transfer goes to the project's escrow in the platform's
    /// settlement asset (mainnet vs test asset per network mode).
    pub async fn cover_first_loss(
        &self,
        project_index: u64,
        entity_index: u64,
        amount: f64,
    ) -> Result<()> {
        if amount <= 0.0 {
            return Err(EngineError::NonPositiveAmount(amount));
        }

        let project = self.store.load_project(project_index).await?;
        let entity = self.store.load_entity(entity_index).await?;
        if project.guarantor_index != entity.index {
            return Err(EngineError::GuarantorMismatch(project.guarantor_index, entity.index));
        }
        self.first_loss_transfer(&project, &entity, amount).await
    }

    pub(crate) async fn first_loss_transfer(
        &self,
        project: &Project,
        guarantor: &Entity,
        mut amount: f64,
    ) -> Result<()> {
        if guarantor.first_loss_guarantee_amt < amount {
            warn!(
                project = project.index,
                requested = amount,
                ceiling = guarantor.first_loss_guarantee_amt,
                "first-loss request above guarantee ceiling, clamping"
            );
            amount = guarantor.first_loss_guarantee_amt;
        }

        let seed = self
            .chain
            .decrypt_seed(&guarantor.encrypted_seed, &guarantor.first_loss_guarantee_pwd)
            .await?;

        let (code, issuer) = if self.config.mainnet {
            (&self.config.anchor_usd_code, &self.config.anchor_usd_issuer)
        } else {
            (&self.config.stablecoin_code, &self.config.stablecoin_issuer)
        };

        let txhash = self
            .chain
            .send_asset(code, issuer, &project.escrow_pubkey, amount, &seed, "first loss guarantee")
            .await?;

        info!(project = project.index, %txhash, amount, "guarantor first-loss cover transferred");
        Ok(())
    }
}
