//! # Cryptographic Primitives
//!
//! Just enough cryptography to sign and check authorization tokens:
//!
//! - **Ed25519** for token signatures. Fast, deterministic, well audited.
//! - **BLAKE3** with domain separation for the token digest.
//!
//! Proof construction and verification math belong to the external prover.
//! Nothing in here pretends otherwise.

pub mod hash;
pub mod keys;

pub use hash::{blake3_hash, domain_separated_hash, domain_separated_hash_parts};
pub use keys::{EngineKeypair, EnginePublicKey, EngineSignature, KeyError};
