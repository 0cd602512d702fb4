//! # Proof Registry
//!
//! Tracks every [`ZkProof`] from request to expiry. The registry never does
//! proof math. It hands a [`ProofJob`] to the [`ProverClient`] on a
//! background tokio task and records whatever verdict comes back.
//!
//! ## Jobs
//!
//! One job per pending proof, keyed by proof id. The job handle is inserted
//! while the proof's mutex is held, and the task must take that same mutex
//! to report back, so a fast prover can't finish before its own job is
//! registered.
//!
//! ## Expiry
//!
//! Lazy. `verify` and `current_status` move a `valid` proof to `expired`
//! when they notice `now > expires_at`. There is no background sweep.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{
    ProofError, ProofJob, ProofRequest, ProofStatus, ProverVerdict, PublicInputs,
    VerificationResult, ZkProof,
};
use crate::clock::SharedClock;
use crate::collaborators::{CollaboratorError, ProverClient};
use crate::config::{EngineConfig, MAX_PROOF_VALIDITY};
use crate::storage::{Collection, Store};
use crate::types::{AssetId, ProofId};

/// Reason recorded on proofs cancelled before the prover answered.
pub const CANCELLED_REASON: &str = "cancelled";

/// Reason recorded when the prover rejects without saying why.
pub const REJECTED_REASON: &str = "prover rejected";

/// Lifecycle and consumption of zero-knowledge proofs.
pub struct ProofRegistry {
    proofs: DashMap<ProofId, Arc<Mutex<ZkProof>>>,
    jobs: DashMap<ProofId, AbortHandle>,
    prover: Arc<dyn ProverClient>,
    store: Store,
    clock: SharedClock,
    config: EngineConfig,
}

impl ProofRegistry {
    /// Loads persisted proofs. Pending proofs come back without a job; use
    /// [`ProofRegistry::resubmit`] to hand them to the prover again.
    pub fn new(
        store: Store,
        clock: SharedClock,
        config: EngineConfig,
        prover: Arc<dyn ProverClient>,
    ) -> Result<Arc<Self>, ProofError> {
        let registry = Self {
            proofs: DashMap::new(),
            jobs: DashMap::new(),
            prover,
            store,
            clock,
            config,
        };

        let proofs: Vec<ZkProof> = registry.store.load_all(Collection::Proofs)?;
        let mut orphaned = 0usize;
        for proof in proofs {
            if proof.status == ProofStatus::Pending {
                orphaned += 1;
            }
            registry
                .proofs
                .insert(proof.id, Arc::new(Mutex::new(proof)));
        }
        if orphaned > 0 {
            warn!(orphaned, "pending proofs reloaded without a prover job");
        }
        debug!(proofs = registry.proofs.len(), "proof registry loaded");
        Ok(Arc::new(registry))
    }

    fn cell(&self, id: &ProofId) -> Result<Arc<Mutex<ZkProof>>, ProofError> {
        self.proofs
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ProofError::ProofNotFound(*id))
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Creates a pending proof and starts the prover job. Returns as soon as
    /// the job is spawned.
    ///
    /// `asset_type` is the asset's ticker; the caller has already checked
    /// the asset exists.
    pub fn request_proof(
        self: &Arc<Self>,
        request: &ProofRequest,
        asset_type: &str,
    ) -> Result<ZkProof, ProofError> {
        request.statement.validate()?;
        let kind = request.statement.kind();
        let validity = match request.validity_secs {
            Some(0) => {
                return Err(ProofError::InvalidRequest(
                    "validity must be greater than zero".into(),
                ))
            }
            Some(secs) if secs > MAX_PROOF_VALIDITY.as_secs() => {
                return Err(ProofError::InvalidRequest(format!(
                    "validity of {secs}s exceeds the maximum of {}s",
                    MAX_PROOF_VALIDITY.as_secs()
                )))
            }
            Some(secs) => chrono::Duration::seconds(secs as i64),
            None => self.config.proof_validity(kind),
        };
        let runtime = Handle::try_current().map_err(|_| ProofError::NoRuntime)?;

        let now = self.clock.now();
        let expires_at = now.checked_add_signed(validity).ok_or_else(|| {
            ProofError::InvalidRequest("validity overflows the calendar".into())
        })?;
        let proof = ZkProof {
            id: Uuid::new_v4(),
            asset_id: request.asset_id,
            kind,
            statement: request.statement.clone(),
            asset_type: asset_type.to_string(),
            status: ProofStatus::Pending,
            public_inputs: None,
            created_at: now,
            expires_at,
            resolved_at: None,
            verification_count: 0,
            last_verified: None,
            invalid_reason: None,
            last_error: None,
        };
        self.store.put(Collection::Proofs, &proof.id, &proof)?;

        let cell = Arc::new(Mutex::new(proof.clone()));
        {
            let guard = cell.lock();
            self.proofs.insert(proof.id, Arc::clone(&cell));
            self.spawn_job(&runtime, &guard);
        }

        info!(
            proof_id = %proof.id,
            asset_id = %proof.asset_id,
            kind = kind.as_str(),
            expires_at = %proof.expires_at,
            "proof requested"
        );
        Ok(proof)
    }

    /// Caller must hold the proof's mutex.
    fn spawn_job(self: &Arc<Self>, runtime: &Handle, proof: &ZkProof) {
        let job = ProofJob {
            proof_id: proof.id,
            asset_id: proof.asset_id,
            asset_type: proof.asset_type.clone(),
            kind: proof.kind,
            statement: proof.statement.clone(),
        };
        let prover = Arc::clone(&self.prover);
        let registry: Weak<Self> = Arc::downgrade(self);
        let proof_id = proof.id;

        let handle = runtime.spawn(async move {
            let outcome = prover.prove(job).await;
            if let Some(registry) = registry.upgrade() {
                registry.finish_job(&proof_id, outcome);
            }
        });
        self.jobs.insert(proof_id, handle.abort_handle());
    }

    fn finish_job(&self, id: &ProofId, outcome: Result<ProverVerdict, CollaboratorError>) {
        let Ok(cell) = self.cell(id) else {
            return;
        };
        let mut proof = cell.lock();
        self.jobs.remove(id);

        if proof.status != ProofStatus::Pending {
            debug!(proof_id = %id, status = %proof.status, "late prover result discarded");
            return;
        }

        match outcome {
            Ok(verdict) => {
                if let Err(e) = self.apply_verdict(&mut proof, verdict) {
                    warn!(proof_id = %id, error = %e, "failed to record prover verdict");
                }
            }
            Err(err) => {
                warn!(proof_id = %id, error = %err, "prover job failed, proof stays pending");
                let mut updated = proof.clone();
                updated.last_error = Some(err.to_string());
                match self.store.put(Collection::Proofs, id, &updated) {
                    Ok(()) => *proof = updated,
                    Err(e) => warn!(proof_id = %id, error = %e, "failed to record prover error"),
                }
            }
        }
    }

    fn apply_verdict(&self, proof: &mut ZkProof, verdict: ProverVerdict) -> Result<(), ProofError> {
        let now = self.clock.now();
        let mut updated = proof.clone();
        let threshold_met = verdict.valid && verdict.threshold_met.unwrap_or(true);

        updated.status = if verdict.valid {
            ProofStatus::Valid
        } else {
            ProofStatus::Invalid
        };
        updated.public_inputs = Some(PublicInputs {
            asset_type: verdict
                .asset_type
                .unwrap_or_else(|| updated.asset_type.clone()),
            threshold_met,
            observed_at: now,
        });
        updated.resolved_at = Some(now);
        updated.last_error = None;
        if !verdict.valid {
            updated.invalid_reason =
                Some(verdict.reason.unwrap_or_else(|| REJECTED_REASON.to_string()));
        }

        self.store.put(Collection::Proofs, &updated.id, &updated)?;
        *proof = updated;

        info!(
            proof_id = %proof.id,
            status = %proof.status,
            threshold_met,
            "proof resolved"
        );
        Ok(())
    }

    /// Records the prover's verdict. Called once; a second call, or a call
    /// after cancellation, fails with `AlreadyResolved`.
    pub fn resolve_proof(&self, id: &ProofId, verdict: ProverVerdict) -> Result<ZkProof, ProofError> {
        let cell = self.cell(id)?;
        let mut proof = cell.lock();
        if proof.status != ProofStatus::Pending {
            return Err(ProofError::AlreadyResolved {
                id: *id,
                status: proof.status,
            });
        }

        self.apply_verdict(&mut proof, verdict)?;
        // An external resolution wins over our own job.
        if let Some((_, job)) = self.jobs.remove(id) {
            job.abort();
        }
        Ok(proof.clone())
    }

    /// Checks a proof for consumption and counts the verification.
    pub fn verify(&self, id: &ProofId) -> Result<VerificationResult, ProofError> {
        let cell = self.cell(id)?;
        let mut proof = cell.lock();
        let now = self.clock.now();

        let mut updated = proof.clone();
        let expired = updated.apply_expiry(now);
        if updated.status != ProofStatus::Valid {
            if expired {
                self.store.put(Collection::Proofs, id, &updated)?;
                *proof = updated;
                info!(proof_id = %id, "proof expired");
            }
            return Err(ProofError::ProofNotValid {
                id: *id,
                status: proof.status,
            });
        }

        updated.verification_count += 1;
        updated.last_verified = Some(now);
        self.store.put(Collection::Proofs, id, &updated)?;
        *proof = updated;

        debug!(proof_id = %id, count = proof.verification_count, "proof verified");
        Ok(VerificationResult::of(&proof))
    }

    /// Status with expiry applied, without counting a verification.
    pub fn current_status(&self, id: &ProofId) -> Result<VerificationResult, ProofError> {
        let cell = self.cell(id)?;
        let mut proof = cell.lock();

        let mut updated = proof.clone();
        if updated.apply_expiry(self.clock.now()) {
            self.store.put(Collection::Proofs, id, &updated)?;
            *proof = updated;
            info!(proof_id = %id, "proof expired");
        }
        Ok(VerificationResult::of(&proof))
    }

    /// Aborts the prover job and marks the proof invalid ("cancelled").
    pub fn cancel_proof(&self, id: &ProofId) -> Result<ZkProof, ProofError> {
        let cell = self.cell(id)?;
        let mut proof = cell.lock();
        if proof.status != ProofStatus::Pending {
            return Err(ProofError::AlreadyResolved {
                id: *id,
                status: proof.status,
            });
        }

        let mut updated = proof.clone();
        updated.status = ProofStatus::Invalid;
        updated.invalid_reason = Some(CANCELLED_REASON.to_string());
        updated.resolved_at = Some(self.clock.now());
        self.store.put(Collection::Proofs, id, &updated)?;
        *proof = updated;

        if let Some((_, job)) = self.jobs.remove(id) {
            job.abort();
        }
        info!(proof_id = %id, "proof cancelled");
        Ok(proof.clone())
    }

    /// Re-issues the prover job for a pending proof whose job failed or was
    /// lost in a restart.
    pub fn resubmit(self: &Arc<Self>, id: &ProofId) -> Result<ZkProof, ProofError> {
        let runtime = Handle::try_current().map_err(|_| ProofError::NoRuntime)?;
        let cell = self.cell(id)?;
        let mut proof = cell.lock();
        if proof.status != ProofStatus::Pending {
            return Err(ProofError::AlreadyResolved {
                id: *id,
                status: proof.status,
            });
        }
        if self.jobs.contains_key(id) {
            return Err(ProofError::ProofJobInFlight(*id));
        }

        if proof.last_error.is_some() {
            let mut updated = proof.clone();
            updated.last_error = None;
            self.store.put(Collection::Proofs, id, &updated)?;
            *proof = updated;
        }
        self.spawn_job(&runtime, &proof);

        info!(proof_id = %id, "prover job resubmitted");
        Ok(proof.clone())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn proof(&self, id: &ProofId) -> Result<ZkProof, ProofError> {
        Ok(self.cell(id)?.lock().clone())
    }

    /// Proofs requested against an asset, oldest first.
    pub fn proofs_for_asset(&self, asset_id: &AssetId) -> Vec<ZkProof> {
        let cells: Vec<_> = self
            .proofs
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut proofs: Vec<ZkProof> = cells
            .iter()
            .map(|cell| cell.lock().clone())
            .filter(|p| p.asset_id == *asset_id)
            .collect();
        proofs.sort_by_key(|p| p.created_at);
        proofs
    }

    /// `true` while a prover job is running for `id`.
    pub fn has_job(&self, id: &ProofId) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.proofs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proofs.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
