//! Escrow release pipeline.
//!
//! Runs once per project, spawned when the raise completes: wait (bounded)
//! for the recipient to unlock, open the 2-of-2 escrow, move the raised
//! funds in, issue the debt and payback instruments, advance to stage 5 and
//! start the payback monitor.
//!
//! Any failure along the chain is fatal to the pipeline run — the project
//! stays locked, operators are alerted, and nothing is retried.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::asset_id;
use crate::errors::{EngineError, Result};
use crate::monitor;
use crate::stage::{checked_transition, Stage};
use crate::Engine;

impl Engine {
    /// Recipient-side unlock of a fully funded project.
    ///
    /// Validates credentials, checks the recipient is the assigned one,
    /// verifies the seed password actually decrypts to the recipient's
    /// wallet, then flips `lock` off and stashes the transient `lock_pwd`
    /// for the waiting release pipeline to pick up.
    pub async fn unlock_project(
        &self,
        username: &str,
        pwhash: &str,
        project_index: u64,
        seed_pwd: &str,
    ) -> Result<()> {
        let lock = self.project_lock(project_index);
        let _guard = lock.lock().await;

        let mut project = self.store.load_project(project_index).await?;
        let recipient = self.store.validate_recipient(username, pwhash).await?;
        if recipient.index != project.recipient_index {
            return Err(EngineError::RecipientMismatch(recipient.index, project_index));
        }

        let seed = self
            .chain
            .decrypt_seed(&recipient.encrypted_seed, seed_pwd)
            .await?;
        let pubkey = self.chain.pubkey_from_seed(&seed).await?;
        if pubkey != recipient.pubkey {
            return Err(EngineError::SeedMismatch);
        }

        if !project.lock {
            return Err(EngineError::NotLocked(project_index));
        }

        project.lock_pwd = seed_pwd.to_string();
        project.lock = false;
        self.store.save_project(&project).await?;

        info!(project = project_index, "project unlocked by recipient");
        Ok(())
    }
}

/// Spawn the release pipeline as a supervised background task. Failures are
/// promoted to operator alerts instead of dying silently.
pub(crate) fn spawn_release(engine: Engine, project_index: u64) {
    let cancel = engine.shutdown.child_token();
    tokio::spawn(async move {
        if let Err(e) = release_funds(&engine, project_index, cancel).await {
            error!(project = project_index, error = %e, "escrow release pipeline failed");
            engine
                .notifier
                .operator_alert(project_index, &format!("escrow release failed: {e}"))
                .await;
        }
    });
}

/// The pipeline body. Returns `Ok(())` both on success and on a timed-out
/// unlock wait (the latter alerts operators and leaves the project locked).
pub(crate) async fn release_funds(
    engine: &Engine,
    project_index: u64,
    cancel: CancellationToken,
) -> Result<()> {
    let poll = Duration::from_secs(engine.config.unlock_poll_secs);
    let deadline = Instant::now() + Duration::from_secs(engine.config.unlock_wait_secs);

    // ── Wait for the recipient unlock, bounded ───────────
    loop {
        let project = engine.store.load_project(project_index).await?;
        if !project.lock {
            break;
        }
        if Instant::now() >= deadline {
            warn!(project = project_index, "unlock wait window expired, funds stay locked");
            engine
                .notifier
                .operator_alert(
                    project_index,
                    "recipient did not unlock within the wait window; raised funds remain locked",
                )
                .await;
            return Ok(());
        }
        debug!(project = project_index, "waiting for recipient unlock");
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(poll) => {}
        }
    }

    // ── Lock is open: set up escrow and release ──────────
    let lock = engine.project_lock(project_index);
    let _guard = lock.lock().await;

    let mut project = engine.store.load_project(project_index).await?;
    let recipient = engine.store.load_recipient(project.recipient_index).await?;

    let recipient_seed = engine
        .chain
        .decrypt_seed(&recipient.encrypted_seed, &project.lock_pwd)
        .await?;

    let escrow_pubkey = engine
        .chain
        .init_escrow(project_index, &recipient.pubkey, &recipient_seed)
        .await?;
    project.escrow_pubkey = escrow_pubkey;
    debug!(project = project_index, escrow = %project.escrow_pubkey, "escrow account opened");

    let total_raised = project.total_value + project.seed_money_raised;
    engine
        .chain
        .escrow_deposit(project_index, &project.escrow_pubkey, total_raised)
        .await?;

    // the transient secret must not outlive the escrow setup that read it
    project.lock_pwd.clear();

    project.debt_asset_code = asset_id(&engine.config.debt_asset_prefix, &project.metadata);
    project.payback_asset_code = asset_id(&engine.config.payback_asset_prefix, &project.metadata);

    let units = project.payback_units(total_raised);
    engine
        .chain
        .issue_recipient_instruments(
            project_index,
            recipient.index,
            &project.debt_asset_code,
            &project.payback_asset_code,
            units,
            &recipient_seed,
            total_raised,
            project.payback_period_weeks,
        )
        .await?;

    // carry the seed surplus into the balance so seed investors get their
    // extra returns over the payback lifetime
    project.bal_left = total_raised;
    // the payback clock starts at release; without this a fresh monitor
    // would measure elapsed time from epoch 0 and escalate immediately
    project.date_last_paid = chrono::Utc::now().timestamp();
    project.stage = checked_transition(project.stage, Stage::Raised)?;
    engine.store.save_project(&project).await?;

    info!(
        project = project.index,
        bal_left = project.bal_left,
        "raised funds released to escrow, payback monitoring begins"
    );
    monitor::spawn(engine.clone(), project.index, project.recipient_index);
    Ok(())
}
