//! # Engine Configuration & Constants
//!
//! Every policy number in ZKredit lives here. If you're hardcoding a ratio,
//! a window, or a TTL somewhere else, move it here.
//!
//! The constants are the defaults; [`EngineConfig`] carries the values a
//! running engine actually uses, so a deployment can tune them without a
//! rebuild.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::proof::ProofKind;
use crate::types::ChainId;

// ---------------------------------------------------------------------------
// Versioning
// ---------------------------------------------------------------------------

/// Engine version string reported by the node.
pub const ENGINE_VERSION: &str = "0.1.0";

/// Domain tag mixed into every authorization token digest. Bump the suffix
/// whenever the token wire layout changes.
pub const TOKEN_DOMAIN: &str = "zkredit/authorization-token/v1";

// ---------------------------------------------------------------------------
// Collateral & Credit
// ---------------------------------------------------------------------------

/// Basis-point denominator. 10_000 bps = 1.0.
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Default collateral ratio: every unit of used credit needs one unit of
/// credit-backing collateral locked against the line.
pub const DEFAULT_COLLATERAL_RATIO_BPS: u32 = 10_000;

/// Upper bound for interest rates (100.00% APR). Anything above is a typo.
pub const MAX_INTEREST_RATE_BPS: u32 = 10_000;

/// Attempts `unlockBalance` makes before giving up with a conflict when the
/// collateral pledge for the asset keeps moving underneath it.
pub const MAX_UNLOCK_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// Spend Windows
// ---------------------------------------------------------------------------

/// Rolling window for the daily spend limit.
pub const DAILY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Rolling window for the optional monthly spend limit.
pub const MONTHLY_WINDOW: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// How long an authorization token stays redeemable after issue.
pub const TOKEN_TTL: Duration = Duration::from_secs(5 * 60);

// ---------------------------------------------------------------------------
// Proof Validity
// ---------------------------------------------------------------------------

/// Balance proofs attest a point-in-time balance, so they age quickly.
pub const BALANCE_PROOF_VALIDITY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Ownership proofs are stable for longer than balance snapshots.
pub const OWNERSHIP_PROOF_VALIDITY: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Credit proofs follow the balance proof cadence.
pub const CREDIT_PROOF_VALIDITY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Longest validity a proof request may ask for.
pub const MAX_PROOF_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

// ---------------------------------------------------------------------------
// Collaborator Retries
// ---------------------------------------------------------------------------

/// Retries for collaborator *reads* (balance reports). Mutating calls are
/// never retried by the engine.
pub const COLLABORATOR_READ_RETRIES: u32 = 3;

/// First backoff delay for collaborator read retries.
pub const COLLABORATOR_RETRY_INITIAL: Duration = Duration::from_millis(100);

/// Cap on a single backoff delay.
pub const COLLABORATOR_RETRY_MAX: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Default port for the REST API.
pub const DEFAULT_API_PORT: u16 = 9841;

/// Default port for the Prometheus metrics endpoint.
pub const DEFAULT_METRICS_PORT: u16 = 9842;

// ---------------------------------------------------------------------------
// Chains
// ---------------------------------------------------------------------------

/// Chains an agent may be scoped to, with display names.
pub const SUPPORTED_CHAINS: &[(u64, &str)] = &[
    (1, "Ethereum"),
    (10, "Optimism"),
    (137, "Polygon"),
    (8453, "Base"),
    (42161, "Arbitrum"),
];

/// Returns `true` if agents may be scoped to `chain`.
pub fn is_supported_chain(chain: ChainId) -> bool {
    SUPPORTED_CHAINS.iter().any(|(id, _)| *id == chain.0)
}

/// Display name for a chain id, `None` for chains we don't know.
pub fn chain_name(chain: ChainId) -> Option<&'static str> {
    SUPPORTED_CHAINS
        .iter()
        .find(|(id, _)| *id == chain.0)
        .map(|(_, name)| *name)
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Runtime tunables for the engine. Every field defaults to the constant of
/// the same name above.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Required collateral per unit of used credit, in bps.
    pub collateral_ratio_bps: u32,
    /// Authorization token lifetime in seconds.
    pub token_ttl_secs: u64,
    /// Balance proof validity in seconds.
    pub balance_proof_validity_secs: u64,
    /// Ownership proof validity in seconds.
    pub ownership_proof_validity_secs: u64,
    /// Credit proof validity in seconds.
    pub credit_proof_validity_secs: u64,
    /// Retries for collaborator reads.
    pub collaborator_read_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            collateral_ratio_bps: DEFAULT_COLLATERAL_RATIO_BPS,
            token_ttl_secs: TOKEN_TTL.as_secs(),
            balance_proof_validity_secs: BALANCE_PROOF_VALIDITY.as_secs(),
            ownership_proof_validity_secs: OWNERSHIP_PROOF_VALIDITY.as_secs(),
            credit_proof_validity_secs: CREDIT_PROOF_VALIDITY.as_secs(),
            collaborator_read_retries: COLLABORATOR_READ_RETRIES,
        }
    }
}

impl EngineConfig {
    /// Token lifetime as a chrono duration.
    pub fn token_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_ttl_secs as i64)
    }

    /// Default validity window for a proof of `kind`.
    pub fn proof_validity(&self, kind: ProofKind) -> chrono::Duration {
        let secs = match kind {
            ProofKind::Balance => self.balance_proof_validity_secs,
            ProofKind::Ownership => self.ownership_proof_validity_secs,
            ProofKind::Credit => self.credit_proof_validity_secs,
        };
        chrono::Duration::seconds(secs.min(MAX_PROOF_VALIDITY.as_secs()) as i64)
    }
}
