//! # Credit Line Module
//!
//! Collateral-backed credit lines: opening, drawing and repaying, editing,
//! pausing and closing. Collateral is never moved; it is the credit-backing
//! locks the ledger already holds on the line's assets.

pub mod line;
pub mod manager;

pub use line::{CreditError, CreditLine, CreditLinePatch, CreditLineStatus, OpenCreditLine};
pub use manager::CreditLineManager;
