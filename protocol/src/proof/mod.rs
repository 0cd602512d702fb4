//! # Proof Registry Module
//!
//! Lifecycle and consumption of zero-knowledge proofs about a user's
//! assets. Computation belongs to the external prover; this module decides
//! which proofs exist, what state they're in, and whether one can back an
//! agent right now.

pub mod registry;
pub mod types;

pub use registry::{ProofRegistry, CANCELLED_REASON, REJECTED_REASON};
pub use types::{
    ProofError, ProofJob, ProofKind, ProofRequest, ProofStatement, ProofStatus, ProverVerdict,
    PublicInputs, VerificationResult, ZkProof,
};
