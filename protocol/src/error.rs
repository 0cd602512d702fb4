//! Engine-wide error type and taxonomy.
//!
//! Each component has its own `thiserror` enum. [`EngineError`] wraps them
//! for the orchestrator, and [`ErrorKind`] classifies every variant so the
//! presentation layer can pick a status code without matching on all of
//! them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::AgentError;
use crate::collaborators::CollaboratorError;
use crate::credit::CreditError;
use crate::ledger::LedgerError;
use crate::proof::ProofError;
use crate::storage::StoreError;

/// Coarse classification of a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or inconsistent input.
    Validation,
    NotFound,
    /// Well-formed request refused by a limit, invariant or state check.
    PolicyViolation,
    /// A chain, exchange or prover collaborator failed.
    ExternalCollaborator,
    /// Lost a race with a concurrent command, or a one-shot transition was
    /// already taken.
    Conflict,
    /// Persistence or runtime failure inside the engine.
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::PolicyViolation => "policy_violation",
            ErrorKind::ExternalCollaborator => "external_collaborator",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Storage => "storage",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::AssetNotFound(_) | LedgerError::LockNotFound(_) => ErrorKind::NotFound,
            LedgerError::InsufficientBalance { .. }
            | LedgerError::LockedExceedsBalance { .. }
            | LedgerError::LockInUse { .. } => ErrorKind::PolicyViolation,
            LedgerError::ZeroAmount | LedgerError::Invalid(_) => ErrorKind::Validation,
            LedgerError::Conflict { .. } => ErrorKind::Conflict,
            LedgerError::Storage(_) => ErrorKind::Storage,
        }
    }
}

impl ProofError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProofError::ProofNotFound(_) => ErrorKind::NotFound,
            ProofError::AlreadyResolved { .. } | ProofError::ProofJobInFlight(_) => {
                ErrorKind::Conflict
            }
            ProofError::ProofNotValid { .. } => ErrorKind::PolicyViolation,
            ProofError::InvalidRequest(_) => ErrorKind::Validation,
            ProofError::NoRuntime | ProofError::Storage(_) => ErrorKind::Storage,
        }
    }
}

impl CreditError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CreditError::LineNotFound(_) => ErrorKind::NotFound,
            CreditError::CreditLimitExceeded { .. }
            | CreditError::NegativeUsage { .. }
            | CreditError::InsufficientCollateral { .. }
            | CreditError::LineNotActive { .. }
            | CreditError::LineExpired { .. }
            | CreditError::NonZeroBalance { .. }
            | CreditError::CollateralAlreadyPledged { .. } => ErrorKind::PolicyViolation,
            CreditError::AlreadyClosed(_) => ErrorKind::Conflict,
            CreditError::Invalid(_) => ErrorKind::Validation,
            CreditError::Ledger(e) => e.kind(),
            CreditError::Storage(_) => ErrorKind::Storage,
        }
    }
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::AgentNotFound(_) | AgentError::TokenNotFound(_) => ErrorKind::NotFound,
            AgentError::AgentNotActive { .. }
            | AgentError::MissingPermission { .. }
            | AgentError::ChainNotAllowed { .. }
            | AgentError::ProofInvalid { .. }
            | AgentError::PerTxLimitExceeded { .. }
            | AgentError::DailyLimitExceeded { .. }
            | AgentError::MonthlyLimitExceeded { .. }
            | AgentError::TokenExpired { .. } => ErrorKind::PolicyViolation,
            AgentError::UnsupportedChain(_)
            | AgentError::ZeroAmount
            | AgentError::Invalid(_)
            | AgentError::TokenSignatureInvalid(_) => ErrorKind::Validation,
            AgentError::TokenAlreadyUsed(_) | AgentError::TokenNotUsed(_) => ErrorKind::Conflict,
            AgentError::Credit(e) => e.kind(),
            AgentError::Proof(e) => e.kind(),
            AgentError::Storage(_) => ErrorKind::Storage,
        }
    }
}

/// Any failure an orchestrator command can report.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Proof(#[from] ProofError),

    #[error(transparent)]
    Credit(#[from] CreditError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// Request rejected before reaching a component.
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Ledger(e) => e.kind(),
            EngineError::Proof(e) => e.kind(),
            EngineError::Credit(e) => e.kind(),
            EngineError::Agent(e) => e.kind(),
            EngineError::Collaborator(_) => ErrorKind::ExternalCollaborator,
            EngineError::Storage(_) => ErrorKind::Storage,
            EngineError::Invalid(_) => ErrorKind::Validation,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
