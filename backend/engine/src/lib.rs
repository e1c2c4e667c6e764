//! Munibond project-financing lifecycle engine.
//!
//! Coordinates the investment/payback lifecycle of multi-party project
//! financing: originators propose projects, recipients accept funded
//! projects, investors fund them, and recipients pay back over time while
//! returns fan out proportionally to investors, with escalating intervention
//! when payments lapse.
//!
//! The engine owns all stage transitions and monetary mutation; identity
//! management, transport, ledger transaction submission and email delivery
//! are external collaborators behind the [`store::LedgerStore`],
//! [`chain::ChainService`] and [`notify::Notifier`] traits.
//!
//! ## Concurrency
//!
//! Per-project accounting is serialized through a mutex keyed by project
//! index; operations on different projects run fully in parallel. Each
//! funded project gets two supervised background tasks — one escrow release
//! pipeline and one payback monitor — holding child tokens of the engine's
//! shutdown token.

pub mod chain;
pub mod config;
pub mod errors;
pub mod notify;
pub mod stage;
pub mod store;
pub mod types;

mod escrow;
mod invest;
mod monitor;
mod payback;
mod proposal;

#[cfg(test)]
mod test_lifecycle;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::chain::ChainService;
use crate::config::Config;
use crate::errors::Result;
use crate::notify::Notifier;
use crate::stage::Stage;
use crate::store::LedgerStore;

pub use crate::monitor::{Band, EscalationBands};
pub use crate::payback::DistributionReport;

/// The lifecycle engine. Cheap to clone; every clone shares the same
/// collaborators, per-project locks and shutdown token.
#[derive(Clone)]
pub struct Engine {
    pub(crate) store: Arc<dyn LedgerStore>,
    pub(crate) chain: Arc<dyn ChainService>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) config: Arc<Config>,
    locks: Arc<DashMap<u64, Arc<Mutex<()>>>>,
    pub(crate) shutdown: CancellationToken,
}

impl Engine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        chain: Arc<dyn ChainService>,
        notifier: Arc<dyn Notifier>,
        config: Config,
    ) -> Self {
        Engine {
            store,
            chain,
            notifier,
            config: Arc::new(config),
            locks: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// The serialization mutex for one project. Concurrent investments or
    /// paybacks against the same project queue here instead of interleaving
    /// read-modify-write cycles.
    pub(crate) fn project_lock(&self, index: u64) -> Arc<Mutex<()>> {
        self.locks
            .entry(index)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Restart payback monitors for every funded project. Called once at
    /// daemon startup; monitors do not survive process restarts on their own.
    pub async fn resume_monitors(&self) -> Result<usize> {
        let projects = self.store.projects_at_stage(Stage::Raised).await?;
        for project in &projects {
            monitor::spawn(self.clone(), project.index, project.recipient_index);
        }
        if !projects.is_empty() {
            info!(count = projects.len(), "resumed payback monitors");
        }
        Ok(projects.len())
    }

    /// Cancel every background task owned by this engine.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
