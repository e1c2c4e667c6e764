//! Proposal-phase operations: recipient authorization, investor voting and
//! the contractor-selection commit.

use tracing::info;

use crate::errors::{EngineError, Result};
use crate::stage::{checked_transition, Stage};
use crate::Engine;

/// Reputation credited to an originator per unit of authorized project value.
const ORIGINATOR_REP_WEIGHT: f64 = 0.05;

impl Engine {
    /// `0 -> 1`: a recipient authorizes a project proposed for them.
    ///
    /// Requires the originator to be KYC-verified and not banned, and the
    /// requesting recipient to be the one the project is assigned to.
    /// Bumps the originator's reputation on success.
    pub async fn authorize(&self, project_index: u64, recipient_index: u64) -> Result<()> {
        let lock = self.project_lock(project_index);
        let _guard = lock.lock().await;

        let mut project = self.store.load_project(project_index).await?;
        if project.stage != Stage::Proposed {
            return Err(EngineError::WrongStage(project_index, project.stage));
        }

        let mut originator = self.store.load_entity(project.originator_index).await?;
        if !originator.kyc || originator.banned {
            return Err(EngineError::OriginatorNotVerified);
        }

        let recipient = self.store.load_recipient(recipient_index).await?;
        if project.recipient_index != recipient.index {
            return Err(EngineError::RecipientMismatch(recipient_index, project_index));
        }

        project.stage = checked_transition(project.stage, Stage::Originated)?;
        self.store.save_project(&project).await?;

        originator.reputation += project.total_value * ORIGINATOR_REP_WEIGHT;
        self.store.save_entity(&originator).await?;

        info!(
            project = project_index,
            originator = originator.index,
            "project authorized by recipient"
        );
        Ok(())
    }

    /// An investor spends voting balance towards a stage-2 project.
    pub async fn vote_towards_project(
        &self,
        investor_index: u64,
        votes: f64,
        project_index: u64,
    ) -> Result<()> {
        if votes <= 0.0 {
            return Err(EngineError::NonPositiveAmount(votes));
        }

        let mut investor = self.store.load_investor(investor_index).await?;
        if votes > investor.voting_balance {
            return Err(EngineError::InsufficientVotes(votes));
        }

        let lock = self.project_lock(project_index);
        let _guard = lock.lock().await;

        let mut project = self.store.load_project(project_index).await?;
        if project.stage != Stage::OpenForVotes {
            return Err(EngineError::WrongStage(project_index, project.stage));
        }

        project.votes += votes;
        self.store.save_project(&project).await?;

        investor.voting_balance -= votes;
        self.store.save_investor(&investor).await?;

        info!(project = project_index, investor = investor_index, votes, "vote cast");
        Ok(())
    }

    /// `2 -> 4`: commit the winning contract chosen by the external auction
    /// selection function. Selection itself is stateless and happens outside
    /// the engine; this only records the transition.
    pub async fn commit_selection(&self, project_index: u64) -> Result<()> {
        let lock = self.project_lock(project_index);
        let _guard = lock.lock().await;

        let mut project = self.store.load_project(project_index).await?;
        project.stage = checked_transition(project.stage, Stage::Selected)?;
        self.store.save_project(&project).await?;

        info!(project = project_index, "contractor selection committed");
        Ok(())
    }

    /// Stage the project as open for voting and seed investment (`1 -> 2`).
    pub async fn open_for_votes(&self, project_index: u64) -> Result<()> {
        let lock = self.project_lock(project_index);
        let _guard = lock.lock().await;

        let mut project = self.store.load_project(project_index).await?;
        project.stage = checked_transition(project.stage, Stage::OpenForVotes)?;
        self.store.save_project(&project).await?;
        Ok(())
    }
}
