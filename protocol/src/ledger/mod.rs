//! # Asset Ledger Module
//!
//! Balances and locked portions per asset. Balances arrive from the
//! chain/exchange collaborator as snapshots; locks are carved out of them by
//! explicit commands, and credit-backing locks are what credit lines count
//! as collateral.
//!
//! The one invariant this module guards: an asset's balance never drops
//! below the sum of its locks.

pub mod asset;
pub mod book;

pub use asset::{
    Asset, AssetAccount, AssetSnapshot, AssetSource, LedgerError, LockPurpose, LockRequest,
    LockedBalance,
};
pub use book::{AssetLedger, CollateralGuard, NoCollateral};
