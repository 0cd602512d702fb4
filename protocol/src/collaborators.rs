//! # External Collaborators
//!
//! The engine decides; other systems act. This module is the seam between
//! them:
//!
//! - [`ChainConnector`] reports balances and executes transfers on chain or
//!   on an exchange.
//! - [`ProverClient`] computes zero-knowledge proofs.
//!
//! Both are async traits so the node can plug in HTTP clients, RPC clients
//! or the in-memory devnet doubles without the engine caring which.
//!
//! Reads (balance reports) go through [`with_retry`] with bounded
//! exponential backoff. Mutating calls (`execute_transfer`) are never
//! retried by the engine; a duplicate transfer is much worse than a failed
//! one.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::agent::AuthorizationToken;
use crate::config::{
    COLLABORATOR_READ_RETRIES, COLLABORATOR_RETRY_INITIAL, COLLABORATOR_RETRY_MAX,
};
use crate::ledger::AssetSource;
use crate::proof::{ProofJob, ProverVerdict};
use crate::types::ChainId;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure reported by (or about) an external collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    /// Transient: worth retrying a read.
    #[error("{collaborator} unavailable: {message}")]
    Unavailable {
        collaborator: String,
        message: String,
    },

    #[error("{collaborator} timed out")]
    Timeout { collaborator: String },

    /// Permanent: the collaborator understood and said no.
    #[error("{collaborator} rejected the request: {message}")]
    Rejected {
        collaborator: String,
        message: String,
    },
}

impl CollaboratorError {
    pub fn unavailable(collaborator: impl Into<String>, message: impl Into<String>) -> Self {
        CollaboratorError::Unavailable {
            collaborator: collaborator.into(),
            message: message.into(),
        }
    }

    pub fn rejected(collaborator: impl Into<String>, message: impl Into<String>) -> Self {
        CollaboratorError::Rejected {
            collaborator: collaborator.into(),
            message: message.into(),
        }
    }

    /// `true` for failures a retry might fix.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CollaboratorError::Unavailable { .. } | CollaboratorError::Timeout { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A balance as the chain or exchange sees it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceReport {
    pub balance: u64,
    pub usd_price_micros: u64,
}

/// Everything the execution path needs to move funds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub token: AuthorizationToken,
    pub amount: u64,
    pub recipient: String,
    pub chain_id: ChainId,
}

/// Reference to a submitted transfer, as returned by the collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReference {
    pub chain_id: ChainId,
    pub tx_hash: String,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Chain or exchange connectivity.
#[async_trait]
pub trait ChainConnector: Send + Sync {
    /// Current balance of `ticker` for `user_id` at `source`.
    async fn report_balance(
        &self,
        user_id: &str,
        ticker: &str,
        source: &AssetSource,
    ) -> Result<BalanceReport, CollaboratorError>;

    /// Submits a transfer authorized by `request.token`.
    async fn execute_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<TxReference, CollaboratorError>;
}

/// Zero-knowledge proof computation.
#[async_trait]
pub trait ProverClient: Send + Sync {
    async fn prove(&self, job: ProofJob) -> Result<ProverVerdict, CollaboratorError>;
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Bounded exponential backoff for collaborator reads.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. 0 = try once.
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// 0.0 = none, 0.5 = ±50% of the computed delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: COLLABORATOR_READ_RETRIES,
            initial_delay: COLLABORATOR_RETRY_INITIAL,
            max_delay: COLLABORATOR_RETRY_MAX,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Immediate retries, no sleeping. For tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * 2f64.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let delay = if self.jitter > 0.0 && capped > 0.0 {
            let range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-range..=range);
            (capped + offset).clamp(0.0, self.max_delay.as_secs_f64())
        } else {
            capped
        };
        Duration::from_secs_f64(delay)
    }
}

/// Runs `call`, retrying transient failures per `policy`.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, CollaboratorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CollaboratorError>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "collaborator read failed, retrying"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
