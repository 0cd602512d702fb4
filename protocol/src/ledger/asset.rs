//! Asset and lock records.
//!
//! An [`AssetAccount`] is the unit the ledger locks and persists: the
//! balance snapshot reported by the chain/exchange collaborator plus every
//! [`LockedBalance`] carved out of it. Keeping both in one record means the
//! `balance ≥ Σ locks` invariant is checked and committed in one place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StoreError;
use crate::types::{AssetId, ChainId, CreditLineId, LockId, UserId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced by the asset ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// No asset with this id.
    #[error("asset {0} not found")]
    AssetNotFound(AssetId),

    /// No lock with this id.
    #[error("lock {0} not found")]
    LockNotFound(LockId),

    /// The request exceeds the unlocked part of the balance.
    #[error("insufficient balance on asset {asset_id}: free {free}, requested {requested}")]
    InsufficientBalance {
        /// Asset that was being locked or debited.
        asset_id: AssetId,
        /// `balance − Σ locks` at commit time.
        free: u64,
        /// Amount that was requested.
        requested: u64,
    },

    /// A new balance snapshot would leave existing locks uncovered.
    #[error("balance {balance} on asset {asset_id} is below its locked total {locked}")]
    LockedExceedsBalance {
        /// Asset whose snapshot was rejected.
        asset_id: AssetId,
        /// Reported balance.
        balance: u64,
        /// Sum of existing locks.
        locked: u64,
    },

    /// Removing the lock would leave a credit line under-collateralized.
    #[error(
        "lock {lock_id} backs credit line {line_id}: {required} collateral required, {remaining} would remain"
    )]
    LockInUse {
        /// Lock that was kept.
        lock_id: LockId,
        /// Line the lock backs.
        line_id: CreditLineId,
        /// Collateral the line needs at its current usage.
        required: u64,
        /// Collateral that would be left after the unlock.
        remaining: u64,
    },

    /// Zero-amount locks and debits are rejected.
    #[error("amount must be greater than zero")]
    ZeroAmount,

    /// Malformed snapshot or lock request.
    #[error("invalid ledger input: {0}")]
    Invalid(String),

    /// The collateral pledge for the asset kept changing during an unlock.
    #[error("unlock of {lock_id} lost its precondition race {attempts} times, retry")]
    Conflict {
        /// Lock being removed.
        lock_id: LockId,
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// Persisting the asset record failed; nothing was committed.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Asset
// ---------------------------------------------------------------------------

/// Where a balance snapshot comes from.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetSource {
    /// Self-custodied wallet address on some chain.
    Wallet { address: String },
    /// Custodial exchange account.
    Exchange { name: String },
}

/// A balance snapshot for one (user, ticker, source).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub user_id: UserId,
    /// Upper-cased ticker, e.g. `ETH`.
    pub ticker: String,
    /// Balance in smallest units.
    pub balance: u64,
    /// USD price × 10⁶. Display only, never used in policy arithmetic.
    pub usd_price_micros: u64,
    pub source: AssetSource,
    pub last_updated: DateTime<Utc>,
}

/// What the chain/exchange collaborator reports. Input to `upsert_asset`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetSnapshot {
    pub user_id: UserId,
    pub ticker: String,
    pub balance: u64,
    pub usd_price_micros: u64,
    pub source: AssetSource,
}

impl AssetSnapshot {
    pub(crate) fn validate(&self) -> Result<(), LedgerError> {
        if self.user_id.trim().is_empty() {
            return Err(LedgerError::Invalid("user id is empty".into()));
        }
        if self.ticker.trim().is_empty() {
            return Err(LedgerError::Invalid("ticker is empty".into()));
        }
        Ok(())
    }

    /// Normalized ticker used for identity.
    pub(crate) fn normalized_ticker(&self) -> String {
        self.ticker.trim().to_ascii_uppercase()
    }
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

/// Why a portion of an asset is locked. Only [`LockPurpose::CreditBacking`]
/// counts toward credit line collateral.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPurpose {
    AgentOperations,
    CreditBacking,
    DirectTransactions,
}

impl LockPurpose {
    /// Human-readable label, as shown to users.
    pub fn label(&self) -> &'static str {
        match self {
            LockPurpose::AgentOperations => "Agent Operations",
            LockPurpose::CreditBacking => "Credit Backing",
            LockPurpose::DirectTransactions => "Direct Transactions",
        }
    }
}

/// A locked portion of an asset balance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedBalance {
    pub id: LockId,
    pub asset_id: AssetId,
    pub amount: u64,
    pub purpose: LockPurpose,
    /// Chain the locked funds are earmarked for, if any.
    pub target_chain: Option<ChainId>,
    pub locked_at: DateTime<Utc>,
    /// Informational release date. Locks are only removed by `unlock_balance`.
    pub unlock_at: Option<DateTime<Utc>>,
}

impl LockedBalance {
    /// `true` once the informational release date has passed.
    pub fn is_past_unlock_date(&self, now: DateTime<Utc>) -> bool {
        self.unlock_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// Parameters for `lock_balance`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub amount: u64,
    pub purpose: LockPurpose,
    #[serde(default)]
    pub target_chain: Option<ChainId>,
    #[serde(default)]
    pub unlock_at: Option<DateTime<Utc>>,
}

impl LockRequest {
    /// Plain lock with no chain or release date.
    pub fn new(amount: u64, purpose: LockPurpose) -> Self {
        Self {
            amount,
            purpose,
            target_chain: None,
            unlock_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// AssetAccount
// ---------------------------------------------------------------------------

/// The asset aggregate: snapshot plus locks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetAccount {
    pub asset: Asset,
    pub locks: Vec<LockedBalance>,
}

impl AssetAccount {
    /// Sum of every lock on the asset.
    pub fn locked_total(&self) -> u64 {
        self.locks.iter().map(|l| l.amount).sum()
    }

    /// Sum of the credit-backing locks only.
    pub fn credit_backing_total(&self) -> u64 {
        self.locks
            .iter()
            .filter(|l| l.purpose == LockPurpose::CreditBacking)
            .map(|l| l.amount)
            .sum()
    }

    /// `balance − Σ locks`. Never negative while the invariant holds.
    pub fn free_balance(&self) -> u64 {
        self.asset.balance.saturating_sub(self.locked_total())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn account(balance: u64, locks: &[(u64, LockPurpose)]) -> AssetAccount {
        let id = Uuid::new_v4();
        AssetAccount {
            asset: Asset {
                id,
                user_id: "user-1".into(),
                ticker: "ETH".into(),
                balance,
                usd_price_micros: 0,
                source: AssetSource::Wallet {
                    address: "0xabc".into(),
                },
                last_updated: Utc::now(),
            },
            locks: locks
                .iter()
                .map(|(amount, purpose)| LockedBalance {
                    id: Uuid::new_v4(),
                    asset_id: id,
                    amount: *amount,
                    purpose: *purpose,
                    target_chain: None,
                    locked_at: Utc::now(),
                    unlock_at: None,
                })
                .collect(),
        }
    }

    #[test]
    fn totals_split_by_purpose() {
        let acct = account(
            100,
            &[
                (30, LockPurpose::CreditBacking),
                (20, LockPurpose::AgentOperations),
                (10, LockPurpose::CreditBacking),
            ],
        );
        assert_eq!(acct.locked_total(), 60);
        assert_eq!(acct.credit_backing_total(), 40);
        assert_eq!(acct.free_balance(), 40);
    }

    #[test]
    fn snapshot_validation() {
        let mut snap = AssetSnapshot {
            user_id: "u".into(),
            ticker: " eth ".into(),
            balance: 1,
            usd_price_micros: 0,
            source: AssetSource::Exchange {
                name: "kraken".into(),
            },
        };
        assert!(snap.validate().is_ok());
        assert_eq!(snap.normalized_ticker(), "ETH");

        snap.ticker = "  ".into();
        assert!(matches!(snap.validate(), Err(LedgerError::Invalid(_))));
    }

    #[test]
    fn purpose_labels() {
        assert_eq!(LockPurpose::CreditBacking.label(), "Credit Backing");
        assert_eq!(LockPurpose::AgentOperations.label(), "Agent Operations");
    }

    #[test]
    fn unlock_date_check() {
        let now = Utc::now();
        let mut acct = account(10, &[(5, LockPurpose::DirectTransactions)]);
        assert!(!acct.locks[0].is_past_unlock_date(now));
        acct.locks[0].unlock_at = Some(now - chrono::Duration::seconds(1));
        assert!(acct.locks[0].is_past_unlock_date(now));
    }
}
