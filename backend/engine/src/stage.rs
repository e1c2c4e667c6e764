//! # Stage state machine
//!
//! A project's lifecycle stage is a strict forward-only finite-state machine.
//! Stage numbers are stable wire values; the gaps (3, 6, 7, 8) are reserved.
//!
//! ```text
//! 0 Proposed ──► 1 Originated ──► 2 OpenForVotes ──► 4 Selected ──► 5 Raised ──► 9 PaidOff
//!                     │                 │                               ▲
//!                     ├─────────────────│───────────► 4 (seed shortcut) │
//!                     └─────────────────┴───────────────────────────────┘
//!                               (full-raise shortcuts)
//! ```
//!
//! Backward transitions and skips other than the documented seed / full-raise
//! shortcuts are rejected with [`EngineError::InvalidStage`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Lifecycle stage of a project, serialized as its stable integer value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Stage {
    /// Proposed by an originator, awaiting recipient authorization.
    #[default]
    Proposed,
    /// Recipient-authorized (originated).
    Originated,
    /// Open for investor voting and seed investment.
    OpenForVotes,
    /// Contractor selected (or fully seed-funded shortcut).
    Selected,
    /// Funds raised, escrow released, awaiting construction and payback.
    Raised,
    /// Fully paid off; ownership transferred to the recipient.
    PaidOff,
}

impl From<Stage> for u8 {
    fn from(stage: Stage) -> u8 {
        match stage {
            Stage::Proposed => 0,
            Stage::Originated => 1,
            Stage::OpenForVotes => 2,
            Stage::Selected => 4,
            Stage::Raised => 5,
            Stage::PaidOff => 9,
        }
    }
}

impl TryFrom<u8> for Stage {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Stage::Proposed),
            1 => Ok(Stage::Originated),
            2 => Ok(Stage::OpenForVotes),
            4 => Ok(Stage::Selected),
            5 => Ok(Stage::Raised),
            9 => Ok(Stage::PaidOff),
            other => Err(format!("unknown project stage {other}")),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// Whether `from -> to` is a legal lifecycle transition.
///
/// `Originated -> Selected` is the fully-seed-funded shortcut;
/// `Originated/OpenForVotes -> Raised` are the full-raise shortcuts taken
/// when a seed round raises the entire total.
pub fn is_valid_transition(from: Stage, to: Stage) -> bool {
    matches!(
        (from, to),
        (Stage::Proposed, Stage::Originated)
            | (Stage::Originated, Stage::OpenForVotes)
            | (Stage::Originated, Stage::Selected)
            | (Stage::Originated, Stage::Raised)
            | (Stage::OpenForVotes, Stage::Selected)
            | (Stage::OpenForVotes, Stage::Raised)
            | (Stage::Selected, Stage::Raised)
            | (Stage::Raised, Stage::PaidOff)
    )
}

/// Validate and return the transition, without mutating anything.
pub fn checked_transition(from: Stage, to: Stage) -> Result<Stage, EngineError> {
    if is_valid_transition(from, to) {
        Ok(to)
    } else {
        Err(EngineError::InvalidStage { from, to })
    }
}
