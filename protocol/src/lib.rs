// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # ZKredit Engine Core Library
//!
//! ZKredit lets a user put idle balances to work without handing them over:
//! lock part of a balance, prove something about it in zero knowledge, draw
//! credit against it, and let autonomous agents spend within limits the user
//! controls.
//!
//! The engine decides; collaborators act. Chains and exchanges report
//! balances and execute transfers, provers compute proofs. The engine keeps
//! the books and refuses anything that would break them.
//!
//! ## Architecture
//!
//! - **ledger**: Asset balances and the locks carved out of them.
//! - **proof**: Proof lifecycle: pending, valid, invalid, expired.
//! - **credit**: Collateral-backed credit lines.
//! - **agent**: Agent limits, spend authorization, signed tokens.
//! - **orchestrator**: The command surface tying the four together.
//! - **collaborators**: Traits for the chain connector and the prover.
//! - **crypto**: Ed25519 engine key and BLAKE3 hashing.
//! - **storage**: Persistent storage over sled.
//! - **config**: Protocol constants and engine tunables.
//!
//! ## Invariants
//!
//! 1. `balance ≥ Σ locks` on every asset, always.
//! 2. `used ≤ limit` on every credit line, and its credit-backing collateral
//!    covers `used × ratio`.
//! 3. An agent's rolling 24h spend never exceeds its daily limit, no matter
//!    how many authorizations race.
//! 4. No command partially commits. Every record is written through to the
//!    store before the in-memory state changes.

pub mod agent;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod credit;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod orchestrator;
pub mod proof;
pub mod storage;
pub mod types;

pub use error::{EngineError, EngineResult, ErrorKind};
pub use orchestrator::Orchestrator;
