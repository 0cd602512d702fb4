//! Proof records, statements and prover messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StoreError;
use crate::types::{AssetId, ProofId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced by the proof registry.
#[derive(Debug, Error)]
pub enum ProofError {
    #[error("proof {0} not found")]
    ProofNotFound(ProofId),

    /// Resolution, cancellation or resubmission of a proof that already left
    /// `pending`.
    #[error("proof {id} is already {status}")]
    AlreadyResolved { id: ProofId, status: ProofStatus },

    /// The proof can't be consumed in its current state.
    #[error("proof {id} is {status}, not valid")]
    ProofNotValid { id: ProofId, status: ProofStatus },

    #[error("a prover job for proof {0} is still running")]
    ProofJobInFlight(ProofId),

    #[error("invalid proof request: {0}")]
    InvalidRequest(String),

    /// Prover jobs are tokio tasks; there has to be a runtime to spawn them on.
    #[error("no async runtime available to run the prover job")]
    NoRuntime,

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Kinds, statements, status
// ---------------------------------------------------------------------------

/// What a proof attests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofKind {
    Ownership,
    Balance,
    Credit,
}

impl ProofKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProofKind::Ownership => "ownership",
            ProofKind::Balance => "balance",
            ProofKind::Credit => "credit",
        }
    }
}

/// Parameters of the claim the prover is asked to establish.
///
/// One variant per [`ProofKind`], so a balance proof can't be requested
/// without a threshold.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofStatement {
    /// The user controls the asset.
    Ownership,
    /// The asset balance is at least `threshold`.
    Balance { threshold: u64 },
    /// The user's collateral supports at least `min_credit` of credit.
    Credit { min_credit: u64 },
}

impl ProofStatement {
    pub fn kind(&self) -> ProofKind {
        match self {
            ProofStatement::Ownership => ProofKind::Ownership,
            ProofStatement::Balance { .. } => ProofKind::Balance,
            ProofStatement::Credit { .. } => ProofKind::Credit,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ProofError> {
        match self {
            ProofStatement::Balance { threshold: 0 } => Err(ProofError::InvalidRequest(
                "balance threshold must be greater than zero".into(),
            )),
            ProofStatement::Credit { min_credit: 0 } => Err(ProofError::InvalidRequest(
                "minimum credit must be greater than zero".into(),
            )),
            _ => Ok(()),
        }
    }
}

/// Proof lifecycle state.
///
/// ```text
/// pending ──► valid ──► expired
///    │
///    └──────► invalid
/// ```
///
/// `invalid` and `expired` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofStatus {
    Pending,
    Valid,
    Invalid,
    Expired,
}

impl ProofStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProofStatus::Invalid | ProofStatus::Expired)
    }
}

impl std::fmt::Display for ProofStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProofStatus::Pending => "pending",
            ProofStatus::Valid => "valid",
            ProofStatus::Invalid => "invalid",
            ProofStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ZkProof
// ---------------------------------------------------------------------------

/// What the prover disclosed alongside its verdict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicInputs {
    /// Ticker the claim is about, e.g. `ETH`.
    pub asset_type: String,
    /// Whether the statement's threshold was met.
    pub threshold_met: bool,
    /// When the prover observed the underlying state.
    pub observed_at: DateTime<Utc>,
}

/// A zero-knowledge proof tracked by the registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZkProof {
    pub id: ProofId,
    pub asset_id: AssetId,
    pub kind: ProofKind,
    pub statement: ProofStatement,
    /// Ticker of the asset at request time.
    pub asset_type: String,
    pub status: ProofStatus,
    pub public_inputs: Option<PublicInputs>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub verification_count: u64,
    pub last_verified: Option<DateTime<Utc>>,
    /// Why the proof is invalid (`"cancelled"`, `"prover rejected"`, ...).
    pub invalid_reason: Option<String>,
    /// Last prover job failure while still pending.
    pub last_error: Option<String>,
}

impl ZkProof {
    /// Moves `valid` to `expired` once `now > expires_at`. Returns `true` if
    /// the status changed.
    pub(crate) fn apply_expiry(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == ProofStatus::Valid && now > self.expires_at {
            self.status = ProofStatus::Expired;
            return true;
        }
        false
    }

    pub fn threshold_met(&self) -> bool {
        self.public_inputs
            .as_ref()
            .map(|p| p.threshold_met)
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Requests & prover messages
// ---------------------------------------------------------------------------

/// Input to `request_proof`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofRequest {
    pub asset_id: AssetId,
    pub statement: ProofStatement,
    /// Overrides the default validity window for the proof kind.
    #[serde(default)]
    pub validity_secs: Option<u64>,
}

/// Work handed to the prover collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofJob {
    pub proof_id: ProofId,
    pub asset_id: AssetId,
    pub asset_type: String,
    pub kind: ProofKind,
    pub statement: ProofStatement,
}

/// The prover's answer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProverVerdict {
    pub valid: bool,
    /// Defaults to `valid` when the prover doesn't report it.
    #[serde(default)]
    pub threshold_met: Option<bool>,
    #[serde(default)]
    pub asset_type: Option<String>,
    /// Rejection reason, recorded on invalid proofs.
    #[serde(default)]
    pub reason: Option<String>,
}

impl ProverVerdict {
    pub fn accepted(threshold_met: bool) -> Self {
        Self {
            valid: true,
            threshold_met: Some(threshold_met),
            asset_type: None,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            threshold_met: Some(false),
            asset_type: None,
            reason: Some(reason.into()),
        }
    }
}

/// Answer to `verify` and `current_status`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub proof_id: ProofId,
    pub status: ProofStatus,
    pub threshold_met: bool,
    pub verification_count: u64,
}

impl VerificationResult {
    pub(crate) fn of(proof: &ZkProof) -> Self {
        Self {
            proof_id: proof.id,
            status: proof.status,
            threshold_met: proof.threshold_met(),
            verification_count: proof.verification_count,
        }
    }

    /// Valid with its threshold met: usable for authorization.
    pub fn is_usable(&self) -> bool {
        self.status == ProofStatus::Valid && self.threshold_met
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    #[test]
    fn statement_kinds() {
        assert_eq!(ProofStatement::Ownership.kind(), ProofKind::Ownership);
        assert_eq!(
            ProofStatement::Balance { threshold: 5 }.kind(),
            ProofKind::Balance
        );
        assert!(ProofStatement::Balance { threshold: 0 }.validate().is_err());
        assert!(ProofStatement::Credit { min_credit: 1 }.validate().is_ok());
    }

    #[test]
    fn only_valid_proofs_expire() {
        let now = Utc::now();
        let mut proof = ZkProof {
            id: Uuid::new_v4(),
            asset_id: Uuid::new_v4(),
            kind: ProofKind::Balance,
            statement: ProofStatement::Balance { threshold: 1 },
            asset_type: "ETH".into(),
            status: ProofStatus::Pending,
            public_inputs: None,
            created_at: now,
            expires_at: now + Duration::days(7),
            resolved_at: None,
            verification_count: 0,
            last_verified: None,
            invalid_reason: None,
            last_error: None,
        };

        let later = now + Duration::days(8);
        assert!(!proof.apply_expiry(later));
        assert_eq!(proof.status, ProofStatus::Pending);

        proof.status = ProofStatus::Valid;
        assert!(!proof.apply_expiry(now + Duration::days(7)));
        assert!(proof.apply_expiry(later));
        assert_eq!(proof.status, ProofStatus::Expired);
        assert!(proof.status.is_terminal());
    }

    #[test]
    fn statement_json_shape() {
        let json = serde_json::to_value(ProofStatement::Balance { threshold: 10 }).unwrap();
        assert_eq!(json, serde_json::json!({ "balance": { "threshold": 10 } }));
    }
}
