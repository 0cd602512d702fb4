//! # Credit Lines
//!
//! A [`CreditLine`] is a collateral-backed limit a user's agents can draw
//! against. Collateral is the sum of `CreditBacking` locks on the line's
//! collateral assets, and it must cover `used × collateral ratio` at all
//! times. That check spans aggregates, so it lives in the manager; this
//! file holds the per-line state machine and the limit arithmetic.
//!
//! ## State Machine
//!
//! ```text
//!    ┌──────────┐  pause   ┌──────────┐
//!    │  Active  │ ───────► │  Paused  │
//!    │          │ ◄─────── │          │
//!    └────┬─────┘  resume  └────┬─────┘
//!         │ close (used = 0)    │
//!         ▼                     ▼
//!    ┌──────────────────────────────┐
//!    │            Closed            │ ← terminal, stays queryable
//!    └──────────────────────────────┘
//! ```
//!
//! Paused lines accept repayments but no draws.
//!
//! ## Interest Model
//!
//! Rates are in basis points (500 = 5.00% APR). The engine records the
//! rate; accrual is the settlement layer's problem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::LedgerError;
use crate::storage::StoreError;
use crate::types::{AssetId, CreditLineId, UserId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced by credit line operations.
#[derive(Debug, Error)]
pub enum CreditError {
    #[error("credit line {0} not found")]
    LineNotFound(CreditLineId),

    /// `used + delta` would exceed the limit.
    #[error("credit limit exceeded on line {line_id}: limit {limit}, used {used}, requested {requested}")]
    CreditLimitExceeded {
        line_id: CreditLineId,
        limit: u64,
        used: u64,
        requested: u64,
    },

    /// `used + delta` would go below zero.
    #[error("repayment {repayment} exceeds outstanding {used} on line {line_id}")]
    NegativeUsage {
        line_id: CreditLineId,
        used: u64,
        repayment: u64,
    },

    /// Credit-backing collateral doesn't cover the required amount.
    #[error("insufficient collateral: {required} required, {available} locked for credit backing")]
    InsufficientCollateral { required: u64, available: u64 },

    #[error("credit line {line_id} is not active (status: {status:?})")]
    LineNotActive {
        line_id: CreditLineId,
        status: CreditLineStatus,
    },

    #[error("credit line {line_id} expired at {expired_at}")]
    LineExpired {
        line_id: CreditLineId,
        expired_at: DateTime<Utc>,
    },

    #[error("credit line {line_id} still has {used} outstanding")]
    NonZeroBalance { line_id: CreditLineId, used: u64 },

    /// The asset already backs another open line.
    #[error("asset {asset_id} already backs credit line {line_id}")]
    CollateralAlreadyPledged {
        asset_id: AssetId,
        line_id: CreditLineId,
    },

    #[error("credit line {0} is closed")]
    AlreadyClosed(CreditLineId),

    #[error("invalid credit line request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// CreditLineStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a credit line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditLineStatus {
    /// Open for draws and repayments.
    Active,
    /// No new draws; repayments still accepted.
    Paused,
    /// Terminal. Reached only through `close` with nothing outstanding.
    Closed,
}

impl CreditLineStatus {
    pub fn allows_draws(&self) -> bool {
        matches!(self, CreditLineStatus::Active)
    }

    pub fn allows_repayments(&self) -> bool {
        matches!(self, CreditLineStatus::Active | CreditLineStatus::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CreditLineStatus::Closed)
    }
}

// ---------------------------------------------------------------------------
// CreditLine
// ---------------------------------------------------------------------------

/// A collateral-backed credit line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditLine {
    pub id: CreditLineId,
    pub user_id: UserId,

    /// Maximum drawable amount, smallest units.
    pub limit: u64,

    /// Outstanding amount. Invariant: `used <= limit`.
    pub used: u64,

    /// Annual rate in basis points.
    pub interest_rate_bps: u32,

    /// Assets whose credit-backing locks collateralize this line. Each one
    /// backs no other open line.
    pub collateral_asset_ids: Vec<AssetId>,

    pub status: CreditLineStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// No draws after this instant. Repayments remain possible.
    pub expires_at: DateTime<Utc>,

    pub closed_at: Option<DateTime<Utc>>,
}

impl CreditLine {
    /// Credit left to draw. 0 unless the line is active.
    pub fn available(&self) -> u64 {
        if !self.status.allows_draws() {
            return 0;
        }
        self.limit.saturating_sub(self.used)
    }

    /// `used / limit × 100`, 0 when the limit is 0.
    pub fn utilization_pct(&self) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        (self.used as f64 / self.limit as f64) * 100.0
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Example: 500 bps -> "5.00%"
    pub fn interest_rate_display(&self) -> String {
        format!("{:.2}%", self.interest_rate_bps as f64 / 100.0)
    }

    /// Checks a draw of `amount` against status, expiry and limit and
    /// returns the new `used`. Collateral is the manager's job.
    pub fn check_draw(&self, amount: u64, now: DateTime<Utc>) -> Result<u64, CreditError> {
        if !self.status.allows_draws() {
            return Err(CreditError::LineNotActive {
                line_id: self.id,
                status: self.status,
            });
        }
        if self.is_expired(now) {
            return Err(CreditError::LineExpired {
                line_id: self.id,
                expired_at: self.expires_at,
            });
        }
        match self.used.checked_add(amount) {
            Some(new_used) if new_used <= self.limit => Ok(new_used),
            _ => Err(CreditError::CreditLimitExceeded {
                line_id: self.id,
                limit: self.limit,
                used: self.used,
                requested: amount,
            }),
        }
    }

    /// Checks a repayment of `amount` and returns the new `used`.
    /// Overpayment is reported before the line's status.
    pub fn check_repay(&self, amount: u64) -> Result<u64, CreditError> {
        let new_used = self
            .used
            .checked_sub(amount)
            .ok_or(CreditError::NegativeUsage {
                line_id: self.id,
                used: self.used,
                repayment: amount,
            })?;
        if !self.status.allows_repayments() {
            return Err(CreditError::LineNotActive {
                line_id: self.id,
                status: self.status,
            });
        }
        Ok(new_used)
    }

    /// `true` if the line pledges `asset_id`.
    pub fn is_backed_by(&self, asset_id: &AssetId) -> bool {
        self.collateral_asset_ids.contains(asset_id)
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Input to `open`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenCreditLine {
    pub user_id: UserId,
    pub limit: u64,
    pub collateral_asset_ids: Vec<AssetId>,
    pub interest_rate_bps: u32,
    pub expires_at: DateTime<Utc>,
}

/// Input to `edit_credit_line`. `None` leaves a field unchanged.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditLinePatch {
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub interest_rate_bps: Option<u32>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub collateral_asset_ids: Option<Vec<AssetId>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
