//! Application-wide error types.
//!
//! Three layers, mirroring the engine's collaborator boundaries:
//!
//! * [`StoreError`]  — ledger-record persistence failures.
//! * [`ChainError`]  — chain-gateway / wallet failures.
//! * [`EngineError`] — everything a caller-facing operation can surface,
//!   including the validation failures of the lifecycle core.
//!
//! Validation variants are checked before any mutation is persisted; resource
//! and remote variants may leave earlier persisted steps in place (partial
//! progress is recovered by re-invocation, never rolled back).

use thiserror::Error;

use crate::stage::Stage;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} record {index} not found")]
    NotFound { kind: &'static str, index: u64 },

    #[error("invalid recipient credentials")]
    InvalidCredentials,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("gateway transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("gateway rejected request: {0}")]
    Rejected(String),

    #[error("malformed gateway response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("could not decrypt wallet seed")]
    BadSeed,
}

pub type ChainResult<T> = std::result::Result<T, ChainError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("invalid stage transition {from} -> {to}")]
    InvalidStage { from: Stage, to: Stage },

    #[error("project {0} at stage {1} does not allow this operation")]
    WrongStage(u64, Stage),

    #[error("amount must be positive, got {0}")]
    NonPositiveAmount(f64),

    #[error("investor balance too low to invest {0}")]
    InsufficientBalance(f64),

    #[error("voting balance too low to cast {0} votes")]
    InsufficientVotes(f64),

    #[error("account {0} does not exist on chain")]
    AccountMissing(String),

    #[error("investment {amount} exceeds remaining gap {remaining}")]
    ExceedsGap { amount: f64, remaining: f64 },

    #[error("seed investment {amount} exceeds seed cap {cap}")]
    ExceedsSeedCap { amount: f64, cap: f64 },

    #[error("only munibond financing is supported")]
    UnsupportedModel,

    #[error("settlement chain not supported")]
    UnsupportedChain,

    #[error("project {0} escrow is locked, distribution blocked")]
    EscrowLocked(u64),

    #[error("project {0} is not locked")]
    NotLocked(u64),

    #[error("recipient {0} is not assigned to project {1}")]
    RecipientMismatch(u64, u64),

    #[error("entity {1} is not the guarantor ({0}) of this project")]
    GuarantorMismatch(u64, u64),

    #[error("originator failed verification checks")]
    OriginatorNotVerified,

    #[error("seed does not match recipient wallet")]
    SeedMismatch,

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
