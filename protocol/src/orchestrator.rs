//! # Orchestrator
//!
//! The command surface of the engine. It owns no state of its own: every
//! command routes to one of the four components, or chains a collaborator
//! call with a component command.
//!
//! ```text
//!   sync_balance ──► ChainConnector::report_balance ──► AssetLedger::upsert_asset
//!   request_proof ─► ProofRegistry ──(tokio task)──► ProverClient::prove
//!   authorize_and_execute ─► AgentEngine::authorize_spend
//!                           ─► AgentEngine::consume_token
//!                           ─► ChainConnector::execute_transfer
//!   confirm_transfer ─► AssetLedger::debit
//! ```
//!
//! Collaborator reads are retried with backoff. Transfers are not; a failed
//! transfer gives its token back so the caller can retry explicitly.

use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::agent::{
    AgentConfig, AgentEngine, AgentPatch, AgentStatus, AuthorizationToken, NewAgent, SpendEvent,
    TokenRecord,
};
use crate::clock::SharedClock;
use crate::collaborators::{
    with_retry, ChainConnector, ProverClient, RetryPolicy, TransferRequest, TxReference,
};
use crate::config::EngineConfig;
use crate::credit::{CreditLine, CreditLineManager, CreditLinePatch, CreditLineStatus, OpenCreditLine};
use crate::crypto::{EngineKeypair, EnginePublicKey};
use crate::error::{EngineError, EngineResult};
use crate::ledger::{Asset, AssetLedger, AssetSnapshot, AssetSource, LockRequest, LockedBalance};
use crate::proof::{ProofRegistry, ProofRequest, ProverVerdict, VerificationResult, ZkProof};
use crate::storage::Store;
use crate::types::{AgentId, AssetId, ChainId, CreditLineId, LockId, ProofId, TokenId, UserId};

// ---------------------------------------------------------------------------
// Command payloads
// ---------------------------------------------------------------------------

/// Input to `sync_balance`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncBalance {
    pub user_id: UserId,
    pub ticker: String,
    pub source: AssetSource,
}

/// Input to `authorize_and_execute`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendRequest {
    pub agent_id: AgentId,
    pub amount: u64,
    pub chain_id: ChainId,
    pub recipient: String,
}

/// An authorized spend the collaborator accepted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutedSpend {
    pub token: AuthorizationToken,
    pub tx: TxReference,
}

/// Entity counts for status reporting.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub assets: usize,
    pub proofs: usize,
    pub open_credit_lines: usize,
    pub active_agents: usize,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Facade over the ledger, proof registry, credit manager and agent engine.
pub struct Orchestrator {
    ledger: Arc<AssetLedger>,
    proofs: Arc<ProofRegistry>,
    credit: Arc<CreditLineManager>,
    agents: Arc<AgentEngine>,
    chain: Arc<dyn ChainConnector>,
    retry: RetryPolicy,
    config: EngineConfig,
    store: Store,
}

impl Orchestrator {
    /// Loads every component from `store`.
    pub fn open(
        store: Store,
        clock: SharedClock,
        config: EngineConfig,
        keypair: EngineKeypair,
        chain: Arc<dyn ChainConnector>,
        prover: Arc<dyn ProverClient>,
    ) -> EngineResult<Self> {
        let ledger = Arc::new(AssetLedger::new(store.clone(), clock.clone())?);
        Self::assemble(ledger, store, clock, config, keypair, chain, prover)
    }

    /// Like [`Orchestrator::open`] but around an already loaded ledger, for
    /// provers that read balances from it.
    pub fn assemble(
        ledger: Arc<AssetLedger>,
        store: Store,
        clock: SharedClock,
        config: EngineConfig,
        keypair: EngineKeypair,
        chain: Arc<dyn ChainConnector>,
        prover: Arc<dyn ProverClient>,
    ) -> EngineResult<Self> {
        let proofs = ProofRegistry::new(store.clone(), clock.clone(), config.clone(), prover)?;
        let credit = Arc::new(CreditLineManager::new(
            store.clone(),
            clock.clone(),
            Arc::clone(&ledger),
            config.collateral_ratio_bps,
        )?);
        let agents = Arc::new(AgentEngine::new(
            store.clone(),
            clock,
            keypair,
            config.token_ttl(),
            Arc::clone(&proofs),
            Arc::clone(&credit),
        )?);
        let retry = RetryPolicy::default().with_max_retries(config.collaborator_read_retries);

        info!(
            assets = ledger.len(),
            proofs = proofs.len(),
            collateral_ratio_bps = config.collateral_ratio_bps,
            "engine loaded"
        );
        Ok(Self {
            ledger,
            proofs,
            credit,
            agents,
            chain,
            retry,
            config,
            store,
        })
    }

    /// Replaces the collaborator retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn ledger(&self) -> &Arc<AssetLedger> {
        &self.ledger
    }

    pub fn proofs(&self) -> &Arc<ProofRegistry> {
        &self.proofs
    }

    pub fn credit(&self) -> &Arc<CreditLineManager> {
        &self.credit
    }

    pub fn agents(&self) -> &Arc<AgentEngine> {
        &self.agents
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Flushes pending sled writes.
    pub fn flush(&self) -> EngineResult<()> {
        self.store.flush()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Assets
    // -----------------------------------------------------------------------

    /// Pulls the current balance from the chain or exchange and stores it.
    #[instrument(skip(self, request), fields(user = %request.user_id, ticker = %request.ticker))]
    pub async fn sync_balance(&self, request: SyncBalance) -> EngineResult<Asset> {
        let report = with_retry(&self.retry, "report_balance", || {
            self.chain
                .report_balance(&request.user_id, &request.ticker, &request.source)
        })
        .await?;

        let asset = self.ledger.upsert_asset(AssetSnapshot {
            user_id: request.user_id,
            ticker: request.ticker,
            balance: report.balance,
            usd_price_micros: report.usd_price_micros,
            source: request.source,
        })?;
        Ok(asset)
    }

    /// Stores a snapshot reported out of band.
    pub fn upsert_asset(&self, snapshot: AssetSnapshot) -> EngineResult<Asset> {
        Ok(self.ledger.upsert_asset(snapshot)?)
    }

    #[instrument(skip(self, request), fields(amount = request.amount))]
    pub fn lock_balance(&self, asset_id: &AssetId, request: LockRequest) -> EngineResult<LockedBalance> {
        Ok(self.ledger.lock_balance(asset_id, request)?)
    }

    #[instrument(skip(self))]
    pub fn unlock_balance(&self, lock_id: &LockId) -> EngineResult<LockedBalance> {
        Ok(self.ledger.unlock_balance(lock_id, &*self.credit)?)
    }

    /// Confirmation callback for a transfer that left `asset_id`.
    #[instrument(skip(self))]
    pub fn confirm_transfer(&self, asset_id: &AssetId, amount: u64) -> EngineResult<Asset> {
        Ok(self.ledger.debit(asset_id, amount)?)
    }

    // -----------------------------------------------------------------------
    // Proofs
    // -----------------------------------------------------------------------

    /// Starts a proof over an existing asset.
    #[instrument(skip(self, request), fields(asset_id = %request.asset_id, kind = request.statement.kind().as_str()))]
    pub fn request_proof(&self, request: &ProofRequest) -> EngineResult<ZkProof> {
        let asset = self.ledger.asset(&request.asset_id)?;
        Ok(self.proofs.request_proof(request, &asset.ticker)?)
    }

    /// Verdict delivered by an external prover.
    #[instrument(skip(self, verdict), fields(valid = verdict.valid))]
    pub fn prover_callback(&self, proof_id: &ProofId, verdict: ProverVerdict) -> EngineResult<ZkProof> {
        Ok(self.proofs.resolve_proof(proof_id, verdict)?)
    }

    pub fn verify_proof(&self, proof_id: &ProofId) -> EngineResult<VerificationResult> {
        Ok(self.proofs.verify(proof_id)?)
    }

    pub fn proof_status(&self, proof_id: &ProofId) -> EngineResult<VerificationResult> {
        Ok(self.proofs.current_status(proof_id)?)
    }

    #[instrument(skip(self))]
    pub fn cancel_proof(&self, proof_id: &ProofId) -> EngineResult<ZkProof> {
        Ok(self.proofs.cancel_proof(proof_id)?)
    }

    #[instrument(skip(self))]
    pub fn resubmit_proof(&self, proof_id: &ProofId) -> EngineResult<ZkProof> {
        Ok(self.proofs.resubmit(proof_id)?)
    }

    // -----------------------------------------------------------------------
    // Credit lines
    // -----------------------------------------------------------------------

    #[instrument(skip(self, request), fields(user = %request.user_id, limit = request.limit))]
    pub fn open_credit_line(&self, request: OpenCreditLine) -> EngineResult<CreditLine> {
        Ok(self.credit.open(request)?)
    }

    /// Draws (`delta > 0`) or repays (`delta < 0`) outside of an agent spend.
    #[instrument(skip(self))]
    pub fn adjust_credit(&self, line_id: &CreditLineId, delta: i64) -> EngineResult<CreditLine> {
        Ok(self.credit.adjust_used(line_id, delta)?)
    }

    #[instrument(skip(self, patch))]
    pub fn edit_credit_line(
        &self,
        line_id: &CreditLineId,
        patch: CreditLinePatch,
    ) -> EngineResult<CreditLine> {
        Ok(self.credit.edit_credit_line(line_id, patch)?)
    }

    #[instrument(skip(self))]
    pub fn set_credit_line_status(
        &self,
        line_id: &CreditLineId,
        status: CreditLineStatus,
    ) -> EngineResult<CreditLine> {
        Ok(self.credit.set_status(line_id, status)?)
    }

    #[instrument(skip(self))]
    pub fn close_credit_line(&self, line_id: &CreditLineId) -> EngineResult<CreditLine> {
        Ok(self.credit.close(line_id)?)
    }

    // -----------------------------------------------------------------------
    // Agents
    // -----------------------------------------------------------------------

    /// Creates a pending agent. The linked proof must be over one of the
    /// user's own assets.
    #[instrument(skip(self, request), fields(user = %request.user_id, name = %request.name))]
    pub fn create_agent(&self, request: NewAgent) -> EngineResult<AgentConfig> {
        self.check_proof_owner(&request.user_id, &request.linked_proof_id)?;
        Ok(self.agents.create_agent(request)?)
    }

    #[instrument(skip(self, patch))]
    pub fn edit_agent(&self, agent_id: &AgentId, patch: AgentPatch) -> EngineResult<AgentConfig> {
        if let Some(proof_id) = &patch.linked_proof_id {
            let agent = self.agents.agent(agent_id)?;
            self.check_proof_owner(&agent.user_id, proof_id)?;
        }
        Ok(self.agents.edit_agent(agent_id, patch)?)
    }

    #[instrument(skip(self))]
    pub fn activate_agent(&self, agent_id: &AgentId) -> EngineResult<AgentConfig> {
        Ok(self.agents.activate(agent_id)?)
    }

    #[instrument(skip(self))]
    pub fn toggle_agent(&self, agent_id: &AgentId, status: AgentStatus) -> EngineResult<AgentConfig> {
        Ok(self.agents.toggle_status(agent_id, status)?)
    }

    #[instrument(skip(self))]
    pub fn delete_agent(&self, agent_id: &AgentId) -> EngineResult<AgentConfig> {
        Ok(self.agents.delete_agent(agent_id)?)
    }

    fn check_proof_owner(&self, user_id: &str, proof_id: &ProofId) -> EngineResult<()> {
        let proof = self.proofs.proof(proof_id)?;
        let owner = self.ledger.owner_of(&proof.asset_id)?;
        if owner != user_id {
            return Err(EngineError::Invalid(format!(
                "proof {proof_id} is over another user's asset"
            )));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Spending
    // -----------------------------------------------------------------------

    /// Authorizes a spend and returns the token without executing it.
    #[instrument(skip(self))]
    pub fn authorize_spend(
        &self,
        agent_id: &AgentId,
        amount: u64,
        chain_id: ChainId,
    ) -> EngineResult<AuthorizationToken> {
        Ok(self.agents.authorize_spend(agent_id, amount, chain_id)?)
    }

    /// Authorizes, redeems the token and hands the transfer to the chain
    /// collaborator.
    #[instrument(skip(self, request), fields(agent_id = %request.agent_id, amount = request.amount, chain = %request.chain_id))]
    pub async fn authorize_and_execute(&self, request: SpendRequest) -> EngineResult<ExecutedSpend> {
        let token = self
            .agents
            .authorize_spend(&request.agent_id, request.amount, request.chain_id)?;
        let tx = self.execute_with_token(&token, request.recipient).await?;
        Ok(ExecutedSpend { token, tx })
    }

    /// Redeems `token` and submits its transfer. The transfer is never
    /// retried here. After a transient failure the token is given back so
    /// the caller can resubmit before it expires; a rejected transfer voids
    /// the authorization.
    #[instrument(skip(self, token, recipient), fields(token_id = %token.id))]
    pub async fn execute_with_token(
        &self,
        token: &AuthorizationToken,
        recipient: String,
    ) -> EngineResult<TxReference> {
        self.agents.consume_token(token)?;
        let transfer = TransferRequest {
            token: token.clone(),
            amount: token.amount,
            recipient,
            chain_id: token.chain_id,
        };

        match self.chain.execute_transfer(&transfer).await {
            Ok(tx) => {
                info!(token_id = %token.id, tx_hash = %tx.tx_hash, "transfer submitted");
                Ok(tx)
            }
            Err(e) if e.is_transient() => {
                warn!(token_id = %token.id, error = %e, "transfer failed, restoring token");
                if let Err(restore) = self.agents.restore_token(&token.id) {
                    warn!(token_id = %token.id, error = %restore, "token restore failed");
                }
                Err(e.into())
            }
            Err(e) => {
                warn!(token_id = %token.id, error = %e, "transfer rejected, voiding authorization");
                if let Err(void) = self.agents.void_authorization(&token.id) {
                    warn!(token_id = %token.id, error = %void, "authorization void failed");
                }
                Err(e.into())
            }
        }
    }

    /// Releases the spend and credit held by restored tokens that expired
    /// without being redeemed.
    pub fn release_lapsed_authorizations(&self) -> usize {
        let released = self.agents.void_lapsed_tokens();
        if released > 0 {
            info!(released, "lapsed authorizations released");
        }
        released
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn asset(&self, asset_id: &AssetId) -> EngineResult<Asset> {
        Ok(self.ledger.asset(asset_id)?)
    }

    pub fn assets_for_user(&self, user_id: &str) -> Vec<Asset> {
        self.ledger.assets_for_user(user_id)
    }

    pub fn locks_for_asset(&self, asset_id: &AssetId) -> EngineResult<Vec<LockedBalance>> {
        Ok(self.ledger.locks_for_asset(asset_id)?)
    }

    pub fn free_balance(&self, asset_id: &AssetId) -> EngineResult<u64> {
        Ok(self.ledger.free_balance(asset_id)?)
    }

    pub fn proof(&self, proof_id: &ProofId) -> EngineResult<ZkProof> {
        Ok(self.proofs.proof(proof_id)?)
    }

    pub fn proofs_for_asset(&self, asset_id: &AssetId) -> Vec<ZkProof> {
        self.proofs.proofs_for_asset(asset_id)
    }

    pub fn credit_line(&self, line_id: &CreditLineId) -> EngineResult<CreditLine> {
        Ok(self.credit.line(line_id)?)
    }

    pub fn credit_lines_for_user(&self, user_id: &str) -> Vec<CreditLine> {
        self.credit.lines_for_user(user_id)
    }

    pub fn utilization_rate(&self, line_id: &CreditLineId) -> EngineResult<f64> {
        Ok(self.credit.utilization_rate(line_id)?)
    }

    pub fn available_credit(&self, line_id: &CreditLineId) -> EngineResult<u64> {
        Ok(self.credit.available_credit(line_id)?)
    }

    pub fn agent(&self, agent_id: &AgentId) -> EngineResult<AgentConfig> {
        Ok(self.agents.agent(agent_id)?)
    }

    pub fn agents_for_user(&self, user_id: &str) -> Vec<AgentConfig> {
        self.agents.agents_for_user(user_id)
    }

    pub fn agent_spends(&self, agent_id: &AgentId) -> EngineResult<Vec<SpendEvent>> {
        Ok(self.agents.spends(agent_id)?)
    }

    pub fn rolling_spend(&self, agent_id: &AgentId, window: Duration) -> EngineResult<u64> {
        Ok(self.agents.rolling_spend(agent_id, window)?)
    }

    pub fn token(&self, token_id: &TokenId) -> EngineResult<TokenRecord> {
        Ok(self.agents.token(token_id)?)
    }

    /// Key execution collaborators use to check tokens offline.
    pub fn public_key(&self) -> EnginePublicKey {
        self.agents.public_key()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            assets: self.ledger.len(),
            proofs: self.proofs.len(),
            open_credit_lines: self.credit.open_line_count(),
            active_agents: self.agents.active_agent_count(),
        }
    }
}
