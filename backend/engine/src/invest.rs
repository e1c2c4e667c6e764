//! Investment accounting: pre-investment checks, the main and seed rounds,
//! raise-completion handling and proportional-ownership recomputation.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::chain::asset_id;
use crate::errors::{EngineError, Result};
use crate::escrow;
use crate::stage::Stage;
use crate::types::{InvestmentModel, Project, SettlementChain};
use crate::Engine;

impl Engine {
    /// Main investment entry point.
    ///
    /// At stage 4 this runs the main round; at stages 1/2 it falls through
    /// to the seed round. Per-project accounting is serialized on the
    /// project lock for the whole operation.
    pub async fn invest(
        &self,
        project_index: u64,
        investor_index: u64,
        amount: f64,
        investor_seed: &str,
    ) -> Result<()> {
        let lock = self.project_lock(project_index);
        let _guard = lock.lock().await;

        let project = self
            .pre_investment_check(project_index, investor_index, amount, investor_seed)
            .await?;
        if project.investment_type != InvestmentModel::Munibond {
            return Err(EngineError::UnsupportedModel);
        }

        match project.stage {
            Stage::Selected => {
                self.run_main_investment(project, investor_index, amount, investor_seed)
                    .await
            }
            Stage::Originated | Stage::OpenForVotes => {
                // still in the seed sub-round
                self.run_seed_investment(project, investor_index, amount, investor_seed)
                    .await
            }
            stage => Err(EngineError::WrongStage(project_index, stage)),
        }
    }

    /// Seed-round investment: same pipeline as [`Engine::invest`], gated on
    /// stage 1/2 and the seed-round cap.
    pub async fn seed_invest(
        &self,
        project_index: u64,
        investor_index: u64,
        amount: f64,
        investor_seed: &str,
    ) -> Result<()> {
        let lock = self.project_lock(project_index);
        let _guard = lock.lock().await;

        let project = self
            .pre_investment_check(project_index, investor_index, amount, investor_seed)
            .await?;
        if project.investment_type != InvestmentModel::Munibond {
            return Err(EngineError::UnsupportedModel);
        }
        if !matches!(project.stage, Stage::Originated | Stage::OpenForVotes) {
            return Err(EngineError::WrongStage(project_index, project.stage));
        }

        self.run_seed_investment(project, investor_index, amount, investor_seed)
            .await
    }

    /// Preconditions shared by both rounds, checked in order, each a
    /// distinct failure: spending balance, signing identity resolves and
    /// exists on chain, amount fits the remaining gap, settlement chain is
    /// supported. Provisions the project's issuer lazily on first use —
    /// a one-time step gated on both asset identifiers being empty, so
    /// re-invocation after a later failure is harmless.
    async fn pre_investment_check(
        &self,
        project_index: u64,
        investor_index: u64,
        amount: f64,
        investor_seed: &str,
    ) -> Result<Project> {
        let mut project = self.store.load_project(project_index).await?;
        let investor = self.store.load_investor(investor_index).await?;

        if !investor.can_invest(amount) {
            return Err(EngineError::InsufficientBalance(amount));
        }

        let pubkey = self.chain.pubkey_from_seed(investor_seed).await?;
        if !self.chain.account_exists(&pubkey).await? {
            return Err(EngineError::AccountMissing(pubkey));
        }

        if amount > project.remaining_gap() {
            return Err(EngineError::ExceedsGap {
                amount,
                remaining: project.remaining_gap(),
            });
        }

        match project.chain {
            SettlementChain::Stellar => {
                if project.investor_asset_code.is_empty() && project.seed_asset_code.is_empty() {
                    // no seed nor main round yet: provision the issuer
                    project.investor_asset_code =
                        asset_id(&self.config.investor_asset_prefix, &project.metadata);
                    self.store.save_project(&project).await?;
                    self.chain.init_issuer(project_index).await?;
                    self.chain.fund_issuer(project_index).await?;
                }
                Ok(project)
            }
            _ => Err(EngineError::UnsupportedChain),
        }
    }

    async fn run_main_investment(
        &self,
        project: Project,
        investor_index: u64,
        amount: f64,
        investor_seed: &str,
    ) -> Result<()> {
        self.chain
            .issue_investment(
                project.index,
                investor_index,
                investor_seed,
                &project.investor_asset_code,
                amount,
                project.total_value,
                1.0,
                false,
            )
            .await?;

        self.update_after_investment(project, amount, investor_index, false)
            .await
    }

    async fn run_seed_investment(
        &self,
        mut project: Project,
        investor_index: u64,
        amount: f64,
        investor_seed: &str,
    ) -> Result<()> {
        if amount > project.seed_investment_cap {
            return Err(EngineError::ExceedsSeedCap {
                amount,
                cap: project.seed_investment_cap,
            });
        }

        if project.seed_asset_code.is_empty() {
            debug!(project = project.index, "assigning seed asset code");
            project.seed_asset_code = self.config.seed_asset_code.clone();
        }

        self.chain
            .issue_investment(
                project.index,
                investor_index,
                investor_seed,
                &project.seed_asset_code,
                amount,
                project.total_value,
                project.seed_investment_factor,
                true,
            )
            .await?;

        self.update_after_investment(project, amount, investor_index, true)
            .await
    }

    /// Post-issue accounting: record the raise, handle raise completion
    /// (lock, notify, spawn the escrow release pipeline exactly once), then
    /// recompute the proportional-ownership map from on-chain balances.
    async fn update_after_investment(
        &self,
        mut project: Project,
        amount: f64,
        investor_index: u64,
        seed_round: bool,
    ) -> Result<()> {
        project.money_raised += amount;
        if seed_round {
            project.seed_money_raised += amount * (project.seed_investment_factor - 1.0);
        }
        project.investor_indices.push(investor_index);
        self.store.save_project(&project).await?;

        if project.money_raised == project.total_value {
            // Full raise. Any further investment is rejected by the gap
            // check, so this branch runs exactly once per project.
            project.lock = true;
            self.store.save_project(&project).await?;
            info!(project = project.index, "raise complete, awaiting recipient unlock");

            self.notify_recipient_of_raise(&project).await?;
            escrow::spawn_release(self.clone(), project.index);
        }

        self.recompute_investor_map(&mut project).await?;
        self.store.save_project(&project).await?;
        Ok(())
    }

    /// Ask the recipient to unlock the funded project. A missing recipient
    /// record alerts operators, waits one backoff and retries the lookup
    /// once before surfacing the failure.
    async fn notify_recipient_of_raise(&self, project: &Project) -> Result<()> {
        let recipient = match self.store.load_recipient(project.recipient_index).await {
            Ok(recipient) => recipient,
            Err(_) => {
                self.notifier
                    .recipient_not_found(project.index, project.recipient_index)
                    .await;
                tokio::time::sleep(Duration::from_secs(self.config.recipient_retry_secs)).await;
                self.store.load_recipient(project.recipient_index).await?
            }
        };
        self.notifier
            .recipient_unlock_request(project.index, &recipient.email)
            .await;
        Ok(())
    }

    /// Rebuild the investor ownership map from scratch by querying every
    /// contributing investor's current on-chain instrument balances.
    ///
    /// Never accumulates incrementally: a failed balance query degrades that
    /// one investor's recorded share towards zero without touching anyone
    /// else's, and the next recompute heals it.
    async fn recompute_investor_map(&self, project: &mut Project) -> Result<()> {
        let mut failed: Vec<String> = Vec::new();
        project.investor_map.clear();

        for index in &project.investor_indices {
            // a missing investor record is a resource error, not a balance
            // failure, and aborts the recompute
            let investor = self.store.load_investor(*index).await?;

            let main = self
                .balance_or_zero(&investor.pubkey, &project.investor_asset_code, &mut failed)
                .await;
            let seed = self
                .balance_or_zero(&investor.pubkey, &project.seed_asset_code, &mut failed)
                .await;

            let share = (main + seed) / project.total_value;
            project.investor_map.insert(investor.pubkey.clone(), share);
        }

        if !failed.is_empty() {
            warn!(
                project = project.index,
                failed = ?failed,
                "balance queries failed during ownership recompute; affected shares recorded from remaining balances only"
            );
        }
        debug!(project = project.index, map = ?project.investor_map, "ownership map recomputed");
        Ok(())
    }

    async fn balance_or_zero(
        &self,
        pubkey: &str,
        asset_code: &str,
        failed: &mut Vec<String>,
    ) -> f64 {
        if asset_code.is_empty() {
            return 0.0;
        }
        match self.chain.asset_balance(pubkey, asset_code).await {
            Ok(balance) => balance,
            Err(e) => {
                warn!(pubkey, asset_code, error = %e, "balance query failed");
                failed.push(pubkey.to_string());
                0.0
            }
        }
    }
}
