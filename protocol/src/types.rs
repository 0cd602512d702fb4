//! Shared identifiers and small value types.
//!
//! Every record in the engine is addressed by a UUID. The aliases below are
//! only documentation, but they make signatures like
//! `fn adjust_used(&self, id: &CreditLineId, ..)` read a lot better.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of the user that owns assets, credit lines and agents. Issued
/// by the (external) session layer; the engine treats it as opaque.
pub type UserId = String;

/// Identifier of an [`crate::ledger::Asset`].
pub type AssetId = Uuid;

/// Identifier of a [`crate::ledger::LockedBalance`].
pub type LockId = Uuid;

/// Identifier of a [`crate::proof::ZkProof`].
pub type ProofId = Uuid;

/// Identifier of a [`crate::credit::CreditLine`].
pub type CreditLineId = Uuid;

/// Identifier of an [`crate::agent::AgentConfig`].
pub type AgentId = Uuid;

/// Identifier of an [`crate::agent::AuthorizationToken`].
pub type TokenId = Uuid;

/// EVM-style chain identifier (1 = Ethereum, 8453 = Base, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match crate::config::chain_name(*self) {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "chain {}", self.0),
        }
    }
}

/// Basis-point multiplication rounded up, so collateral requirements never
/// round in the borrower's favour.
pub fn mul_bps_ceil(amount: u64, bps: u32) -> u64 {
    let product = amount as u128 * bps as u128;
    let denom = crate::config::BPS_DENOMINATOR as u128;
    let scaled = product.div_ceil(denom);
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_display_uses_known_names() {
        assert_eq!(ChainId(1).to_string(), "Ethereum (1)");
        assert_eq!(ChainId(7).to_string(), "chain 7");
    }

    #[test]
    fn bps_multiplication_rounds_up() {
        assert_eq!(mul_bps_ceil(500, 10_000), 500);
        assert_eq!(mul_bps_ceil(500, 15_000), 750);
        assert_eq!(mul_bps_ceil(1, 15_000), 2);
        assert_eq!(mul_bps_ceil(0, 15_000), 0);
    }

    #[test]
    fn bps_multiplication_saturates() {
        assert_eq!(mul_bps_ceil(u64::MAX, 20_000), u64::MAX);
    }
}
