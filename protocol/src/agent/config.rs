//! Agent configuration, spend events and errors.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::is_supported_chain;
use crate::credit::CreditError;
use crate::proof::{ProofError, ProofStatus};
use crate::storage::StoreError;
use crate::types::{AgentId, ChainId, CreditLineId, ProofId, TokenId, UserId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced by the agent authorization engine.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent {0} not found")]
    AgentNotFound(AgentId),

    #[error("agent {agent_id} is {status:?}, not active")]
    AgentNotActive {
        agent_id: AgentId,
        status: AgentStatus,
    },

    #[error("agent {agent_id} lacks the {permission:?} permission")]
    MissingPermission {
        agent_id: AgentId,
        permission: Permission,
    },

    #[error("agent {agent_id} is not allowed on {chain}")]
    ChainNotAllowed { agent_id: AgentId, chain: ChainId },

    /// The linked proof isn't valid with its threshold met right now.
    /// `status` is `None` when the proof no longer exists.
    #[error("linked proof {proof_id} of agent {agent_id} is not usable (status: {status:?})")]
    ProofInvalid {
        agent_id: AgentId,
        proof_id: ProofId,
        status: Option<ProofStatus>,
    },

    #[error("amount {requested} exceeds per-transaction limit {limit}")]
    PerTxLimitExceeded { limit: u64, requested: u64 },

    #[error("daily limit {limit} exceeded: {spent} spent in the last 24h, {requested} requested")]
    DailyLimitExceeded {
        limit: u64,
        spent: u64,
        requested: u64,
    },

    #[error("monthly limit {limit} exceeded: {spent} spent in the last 30d, {requested} requested")]
    MonthlyLimitExceeded {
        limit: u64,
        spent: u64,
        requested: u64,
    },

    #[error("chain {0} is not supported")]
    UnsupportedChain(ChainId),

    #[error("amount must be greater than zero")]
    ZeroAmount,

    #[error("invalid agent configuration: {0}")]
    Invalid(String),

    #[error("authorization token {0} not found")]
    TokenNotFound(TokenId),

    #[error("authorization token {0} was already used")]
    TokenAlreadyUsed(TokenId),

    #[error("authorization token {token_id} expired at {expired_at}")]
    TokenExpired {
        token_id: TokenId,
        expired_at: DateTime<Utc>,
    },

    #[error("authorization token {0} failed signature verification")]
    TokenSignatureInvalid(TokenId),

    #[error("authorization token {0} has not been used")]
    TokenNotUsed(TokenId),

    #[error(transparent)]
    Credit(#[from] CreditError),

    #[error(transparent)]
    Proof(#[from] ProofError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Status & permissions
// ---------------------------------------------------------------------------

/// Agent lifecycle.
///
/// ```text
/// pending ──activate──► active ◄──toggle──► paused
/// ```
///
/// Deletion removes the agent outright.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Active,
    Paused,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    Execute,
}

// ---------------------------------------------------------------------------
// AgentConfig
// ---------------------------------------------------------------------------

/// Delegated, chain-scoped spending authority for one agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: AgentId,
    pub user_id: UserId,
    pub name: String,
    pub status: AgentStatus,
    pub permissions: BTreeSet<Permission>,
    pub spending_limit_per_tx: u64,
    /// Cap on the rolling 24h spend.
    pub daily_limit: u64,
    /// Optional cap on the rolling 30-day spend.
    pub monthly_limit: Option<u64>,
    pub allowed_chains: Vec<ChainId>,
    pub linked_proof_id: ProofId,
    /// Line each authorized spend draws on, if any.
    pub credit_line_id: Option<CreditLineId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_active: Option<DateTime<Utc>>,
}

impl AgentConfig {
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    pub fn allows_chain(&self, chain: ChainId) -> bool {
        self.allowed_chains.contains(&chain)
    }

    /// Limits, chains, permissions and name.
    pub(crate) fn validate(&self) -> Result<(), AgentError> {
        if self.name.trim().is_empty() {
            return Err(AgentError::Invalid("name is empty".into()));
        }
        if self.user_id.trim().is_empty() {
            return Err(AgentError::Invalid("user id is empty".into()));
        }
        if self.permissions.is_empty() {
            return Err(AgentError::Invalid("at least one permission is required".into()));
        }
        if self.spending_limit_per_tx == 0 {
            return Err(AgentError::Invalid(
                "per-transaction limit must be greater than zero".into(),
            ));
        }
        if self.spending_limit_per_tx > self.daily_limit {
            return Err(AgentError::Invalid(format!(
                "per-transaction limit {} exceeds daily limit {}",
                self.spending_limit_per_tx, self.daily_limit
            )));
        }
        if let Some(monthly) = self.monthly_limit {
            if self.daily_limit > monthly {
                return Err(AgentError::Invalid(format!(
                    "daily limit {} exceeds monthly limit {monthly}",
                    self.daily_limit
                )));
            }
        }
        if self.allowed_chains.is_empty() {
            return Err(AgentError::Invalid("at least one chain is required".into()));
        }
        if let Some(chain) = self
            .allowed_chains
            .iter()
            .find(|chain| !is_supported_chain(**chain))
        {
            return Err(AgentError::UnsupportedChain(*chain));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Spend events
// ---------------------------------------------------------------------------

/// One authorized spend. Append-only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendEvent {
    pub token_id: TokenId,
    pub amount: u64,
    pub chain_id: ChainId,
    pub at: DateTime<Utc>,
}

/// The agent aggregate: config plus spend history, persisted together.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub config: AgentConfig,
    pub spends: Vec<SpendEvent>,
}

impl AgentRecord {
    /// Sum of spends in `(now − window, now]`. A window reaching past the
    /// calendar start covers the whole history.
    pub fn spent_within(&self, window: Duration, now: DateTime<Utc>) -> u64 {
        let since = now.checked_sub_signed(window);
        self.spends
            .iter()
            .filter(|e| since.map_or(true, |since| e.at > since) && e.at <= now)
            .map(|e| e.amount)
            .fold(0u64, u64::saturating_add)
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Input to `create_agent`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAgent {
    pub user_id: UserId,
    pub name: String,
    pub permissions: BTreeSet<Permission>,
    pub spending_limit_per_tx: u64,
    pub daily_limit: u64,
    #[serde(default)]
    pub monthly_limit: Option<u64>,
    pub allowed_chains: Vec<ChainId>,
    pub linked_proof_id: ProofId,
    #[serde(default)]
    pub credit_line_id: Option<CreditLineId>,
}

/// Input to `edit_agent`. `None` leaves a field unchanged.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentPatch {
    pub name: Option<String>,
    pub permissions: Option<BTreeSet<Permission>>,
    pub spending_limit_per_tx: Option<u64>,
    pub daily_limit: Option<u64>,
    pub monthly_limit: Option<u64>,
    /// Drops the monthly cap. Wins over `monthly_limit`.
    pub clear_monthly_limit: bool,
    pub allowed_chains: Option<Vec<ChainId>>,
    pub linked_proof_id: Option<ProofId>,
    pub credit_line_id: Option<CreditLineId>,
    /// Stops drawing on a credit line. Wins over `credit_line_id`.
    pub unlink_credit_line: bool,
}

impl AgentPatch {
    pub(crate) fn apply(self, config: &mut AgentConfig) {
        if let Some(name) = self.name {
            config.name = name;
        }
        if let Some(permissions) = self.permissions {
            config.permissions = permissions;
        }
        if let Some(per_tx) = self.spending_limit_per_tx {
            config.spending_limit_per_tx = per_tx;
        }
        if let Some(daily) = self.daily_limit {
            config.daily_limit = daily;
        }
        if self.clear_monthly_limit {
            config.monthly_limit = None;
        } else if let Some(monthly) = self.monthly_limit {
            config.monthly_limit = Some(monthly);
        }
        if let Some(chains) = self.allowed_chains {
            config.allowed_chains = chains;
        }
        if let Some(proof_id) = self.linked_proof_id {
            config.linked_proof_id = proof_id;
        }
        if self.unlink_credit_line {
            config.credit_line_id = None;
        } else if let Some(line_id) = self.credit_line_id {
            config.credit_line_id = Some(line_id);
        }
    }
}
