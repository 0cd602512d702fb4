//! # Agent Authorization Engine
//!
//! Decides whether an agent may spend, and issues the signed single-use
//! token that lets an execution collaborator act on the decision.
//!
//! `authorize_spend` runs its checks in a fixed order:
//!
//! 1. agent exists and is active, with the `execute` permission
//! 2. chain is in the agent's allow-list
//! 3. linked proof is valid with its threshold met (expiry applied)
//! 4. per-transaction, rolling 24h and rolling 30d limits
//! 5. the linked credit line, if any, accepts the draw
//!
//! The agent's mutex is held from the first check to the last write, so two
//! concurrent authorizations can't both fit under the same daily limit.
//! Lock order is agent → proof, and agent → credit line → asset.

use std::sync::Arc;

use chrono::Duration;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::{
    AgentConfig, AgentError, AgentPatch, AgentRecord, AgentStatus, NewAgent, Permission,
    SpendEvent,
};
use super::token::{AuthorizationToken, TokenClaims, TokenRecord};
use crate::clock::SharedClock;
use crate::config::{DAILY_WINDOW, MONTHLY_WINDOW};
use crate::credit::{CreditError, CreditLineManager, CreditLineStatus};
use crate::crypto::{EngineKeypair, EnginePublicKey};
use crate::proof::{ProofError, ProofRegistry};
use crate::storage::{Collection, Store, Write};
use crate::types::{AgentId, ChainId, CreditLineId, ProofId, TokenId};

fn daily_window() -> Duration {
    Duration::seconds(DAILY_WINDOW.as_secs() as i64)
}

fn monthly_window() -> Duration {
    Duration::seconds(MONTHLY_WINDOW.as_secs() as i64)
}

/// Agent configurations, spend history and authorization tokens.
pub struct AgentEngine {
    agents: DashMap<AgentId, Arc<Mutex<AgentRecord>>>,
    tokens: DashMap<TokenId, Arc<Mutex<TokenRecord>>>,
    proofs: Arc<ProofRegistry>,
    credit: Arc<CreditLineManager>,
    keypair: EngineKeypair,
    store: Store,
    clock: SharedClock,
    token_ttl: Duration,
}

impl AgentEngine {
    /// Loads persisted agents and tokens.
    pub fn new(
        store: Store,
        clock: SharedClock,
        keypair: EngineKeypair,
        token_ttl: Duration,
        proofs: Arc<ProofRegistry>,
        credit: Arc<CreditLineManager>,
    ) -> Result<Self, AgentError> {
        let engine = Self {
            agents: DashMap::new(),
            tokens: DashMap::new(),
            proofs,
            credit,
            keypair,
            store,
            clock,
            token_ttl,
        };

        let agents: Vec<AgentRecord> = engine.store.load_all(Collection::Agents)?;
        for record in agents {
            engine
                .agents
                .insert(record.config.id, Arc::new(Mutex::new(record)));
        }
        let tokens: Vec<TokenRecord> = engine.store.load_all(Collection::Tokens)?;
        for record in tokens {
            engine
                .tokens
                .insert(record.token.id, Arc::new(Mutex::new(record)));
        }
        debug!(
            agents = engine.agents.len(),
            tokens = engine.tokens.len(),
            "agent engine loaded"
        );
        Ok(engine)
    }

    fn cell(&self, id: &AgentId) -> Result<Arc<Mutex<AgentRecord>>, AgentError> {
        self.agents
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(AgentError::AgentNotFound(*id))
    }

    /// Fails if the agent was deleted while the caller waited for its mutex.
    /// Deletion removes the map entry with the mutex held.
    fn ensure_live(&self, id: &AgentId) -> Result<(), AgentError> {
        if self.agents.contains_key(id) {
            Ok(())
        } else {
            Err(AgentError::AgentNotFound(*id))
        }
    }

    fn token_cell(&self, id: &TokenId) -> Result<Arc<Mutex<TokenRecord>>, AgentError> {
        self.tokens
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(AgentError::TokenNotFound(*id))
    }

    /// Current proof status as seen by authorization.
    fn check_proof(&self, agent_id: &AgentId, proof_id: &ProofId) -> Result<(), AgentError> {
        match self.proofs.current_status(proof_id) {
            Ok(result) if result.is_usable() => Ok(()),
            Ok(result) => Err(AgentError::ProofInvalid {
                agent_id: *agent_id,
                proof_id: *proof_id,
                status: Some(result.status),
            }),
            Err(ProofError::ProofNotFound(_)) => Err(AgentError::ProofInvalid {
                agent_id: *agent_id,
                proof_id: *proof_id,
                status: None,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// The line must exist and belong to the agent's user.
    fn check_line_owner(&self, config: &AgentConfig, line_id: &CreditLineId) -> Result<(), AgentError> {
        let line = self.credit.line(line_id)?;
        if line.user_id != config.user_id {
            return Err(AgentError::Invalid(format!(
                "credit line {line_id} belongs to another user"
            )));
        }
        Ok(())
    }

    /// Activation preconditions: usable proof and, if linked, an active line.
    fn check_activation(&self, config: &AgentConfig) -> Result<(), AgentError> {
        self.check_proof(&config.id, &config.linked_proof_id)?;
        if let Some(line_id) = &config.credit_line_id {
            let line = self.credit.line(line_id)?;
            if line.status != CreditLineStatus::Active {
                return Err(CreditError::LineNotActive {
                    line_id: *line_id,
                    status: line.status,
                }
                .into());
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Authorization
    // -----------------------------------------------------------------------

    /// Authorizes `amount` on `chain_id` for `agent_id` and returns a signed,
    /// single-use token.
    ///
    /// On success the spend is recorded against the rolling windows and, for
    /// agents linked to a credit line, drawn on the line. On any failure
    /// nothing is recorded.
    pub fn authorize_spend(
        &self,
        agent_id: &AgentId,
        amount: u64,
        chain_id: ChainId,
    ) -> Result<AuthorizationToken, AgentError> {
        if amount == 0 {
            return Err(AgentError::ZeroAmount);
        }
        let cell = self.cell(agent_id)?;
        let mut record = cell.lock();
        self.ensure_live(agent_id)?;
        let config = &record.config;

        if config.status != AgentStatus::Active {
            return Err(AgentError::AgentNotActive {
                agent_id: *agent_id,
                status: config.status,
            });
        }
        if !config.has_permission(Permission::Execute) {
            return Err(AgentError::MissingPermission {
                agent_id: *agent_id,
                permission: Permission::Execute,
            });
        }
        if !config.allows_chain(chain_id) {
            return Err(AgentError::ChainNotAllowed {
                agent_id: *agent_id,
                chain: chain_id,
            });
        }
        self.check_proof(agent_id, &config.linked_proof_id)?;

        if amount > config.spending_limit_per_tx {
            return Err(AgentError::PerTxLimitExceeded {
                limit: config.spending_limit_per_tx,
                requested: amount,
            });
        }
        let now = self.clock.now();
        let spent_today = record.spent_within(daily_window(), now);
        if spent_today.saturating_add(amount) > config.daily_limit {
            return Err(AgentError::DailyLimitExceeded {
                limit: config.daily_limit,
                spent: spent_today,
                requested: amount,
            });
        }
        if let Some(monthly) = config.monthly_limit {
            let spent_month = record.spent_within(monthly_window(), now);
            if spent_month.saturating_add(amount) > monthly {
                return Err(AgentError::MonthlyLimitExceeded {
                    limit: monthly,
                    spent: spent_month,
                    requested: amount,
                });
            }
        }

        let line_id = config.credit_line_id;
        let delta = i64::try_from(amount)
            .map_err(|_| AgentError::Invalid(format!("amount {amount} is too large")))?;
        if let Some(line_id) = &line_id {
            self.credit.adjust_used(line_id, delta)?;
        }

        let token = TokenClaims {
            id: Uuid::new_v4(),
            agent_id: *agent_id,
            user_id: config.user_id.clone(),
            amount,
            chain_id,
            issued_at: now,
            expires_at: now + self.token_ttl,
            credit_line_id: line_id,
        }
        .sign(&self.keypair);

        let mut updated = record.clone();
        updated.spends.push(SpendEvent {
            token_id: token.id,
            amount,
            chain_id,
            at: now,
        });
        updated.config.last_active = Some(now);
        let token_record = TokenRecord {
            token: token.clone(),
            consumed_at: None,
            restored_at: None,
        };

        let persisted = Write::put(Collection::Tokens, &token.id, &token_record)
            .and_then(|token_write| {
                let agent_write = Write::put(Collection::Agents, agent_id, &updated)?;
                self.store.commit_pair(token_write, agent_write)
            });
        if let Err(e) = persisted {
            if let Some(line_id) = &line_id {
                if let Err(undo) = self.credit.adjust_used(line_id, -delta) {
                    warn!(%line_id, amount, error = %undo, "failed to undo credit draw");
                }
            }
            return Err(e.into());
        }

        *record = updated;
        self.tokens
            .insert(token.id, Arc::new(Mutex::new(token_record)));

        info!(
            agent_id = %agent_id,
            token_id = %token.id,
            amount,
            chain = %chain_id,
            spent_today = spent_today + amount,
            "spend authorized"
        );
        Ok(token)
    }

    /// Redeems a token. It must carry the engine's signature, match the
    /// issued token, be unexpired and unused, and its agent must still
    /// exist.
    pub fn consume_token(&self, token: &AuthorizationToken) -> Result<TokenRecord, AgentError> {
        if !token.verify_signature(&self.keypair.public_key()) {
            return Err(AgentError::TokenSignatureInvalid(token.id));
        }
        let cell = self.token_cell(&token.id)?;
        let mut record = cell.lock();
        if record.token != *token {
            return Err(AgentError::TokenSignatureInvalid(token.id));
        }
        if record.consumed_at.is_some() {
            return Err(AgentError::TokenAlreadyUsed(token.id));
        }
        let now = self.clock.now();
        if token.is_expired(now) {
            return Err(AgentError::TokenExpired {
                token_id: token.id,
                expired_at: token.expires_at,
            });
        }
        if !self.agents.contains_key(&token.agent_id) {
            return Err(AgentError::AgentNotFound(token.agent_id));
        }

        let mut updated = record.clone();
        updated.consumed_at = Some(now);
        self.store.put(Collection::Tokens, &token.id, &updated)?;
        *record = updated;

        debug!(token_id = %token.id, agent_id = %token.agent_id, "token consumed");
        Ok(record.clone())
    }

    /// Re-arms a consumed token after its transfer failed, so the caller can
    /// retry execution within the token's lifetime.
    pub fn restore_token(&self, token_id: &TokenId) -> Result<TokenRecord, AgentError> {
        let cell = self.token_cell(token_id)?;
        let mut record = cell.lock();
        if record.consumed_at.is_none() {
            return Err(AgentError::TokenNotUsed(*token_id));
        }

        let mut updated = record.clone();
        updated.consumed_at = None;
        updated.restored_at = Some(self.clock.now());
        self.store.put(Collection::Tokens, token_id, &updated)?;
        *record = updated;

        info!(token_id = %token_id, "token restored");
        Ok(record.clone())
    }

    /// Cancels an authorization whose transfer never happened. The spend
    /// event leaves the rolling windows, a credit draw is repaid, and the
    /// token is deleted. Fails with the authorization intact if the
    /// repayment or the write is refused.
    pub fn void_authorization(&self, token_id: &TokenId) -> Result<AuthorizationToken, AgentError> {
        let agent_id = self.token_cell(token_id)?.lock().token.agent_id;
        let cell = self.cell(&agent_id)?;
        let mut record = cell.lock();
        self.ensure_live(&agent_id)?;
        let token_cell = self.token_cell(token_id)?;
        let token_record = token_cell.lock();
        let token = token_record.token.clone();

        let mut updated = record.clone();
        updated.spends.retain(|event| event.token_id != token.id);
        let delta = i64::try_from(token.amount)
            .map_err(|_| AgentError::Invalid(format!("amount {} is too large", token.amount)))?;
        if let Some(line_id) = &token.credit_line_id {
            self.credit.adjust_used(line_id, -delta)?;
        }

        let persisted = Write::put(Collection::Agents, &agent_id, &updated).and_then(|agent_write| {
            self.store
                .commit_pair(agent_write, Write::delete(Collection::Tokens, token_id))
        });
        if let Err(e) = persisted {
            if let Some(line_id) = &token.credit_line_id {
                if let Err(redo) = self.credit.adjust_used(line_id, delta) {
                    warn!(%line_id, amount = token.amount, error = %redo, "failed to redo credit draw");
                }
            }
            return Err(e.into());
        }

        *record = updated;
        drop(token_record);
        self.tokens.remove(token_id);

        info!(
            agent_id = %agent_id,
            token_id = %token_id,
            amount = token.amount,
            "authorization voided"
        );
        Ok(token)
    }

    /// Voids every restored token that expired unredeemed. Returns how many
    /// were released.
    pub fn void_lapsed_tokens(&self) -> usize {
        let now = self.clock.now();
        let cells: Vec<_> = self
            .tokens
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let lapsed: Vec<TokenId> = cells
            .iter()
            .filter_map(|cell| {
                let record = cell.lock();
                record.is_lapsed(now).then_some(record.token.id)
            })
            .collect();

        let mut released = 0;
        for token_id in &lapsed {
            match self.void_authorization(token_id) {
                Ok(_) => released += 1,
                Err(e) => warn!(token_id = %token_id, error = %e, "failed to release lapsed token"),
            }
        }
        released
    }

    // -----------------------------------------------------------------------
    // Agent lifecycle
    // -----------------------------------------------------------------------

    /// Creates a pending agent.
    ///
    /// The linked proof must exist; it needn't be valid yet. A linked credit
    /// line must exist and belong to the same user.
    pub fn create_agent(&self, request: NewAgent) -> Result<AgentConfig, AgentError> {
        let now = self.clock.now();
        let config = AgentConfig {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            name: request.name.trim().to_string(),
            status: AgentStatus::Pending,
            permissions: request.permissions,
            spending_limit_per_tx: request.spending_limit_per_tx,
            daily_limit: request.daily_limit,
            monthly_limit: request.monthly_limit,
            allowed_chains: request.allowed_chains,
            linked_proof_id: request.linked_proof_id,
            credit_line_id: request.credit_line_id,
            created_at: now,
            updated_at: now,
            last_active: None,
        };
        config.validate()?;
        self.proofs.proof(&config.linked_proof_id)?;
        if let Some(line_id) = &config.credit_line_id {
            self.check_line_owner(&config, line_id)?;
        }

        let record = AgentRecord {
            config: config.clone(),
            spends: Vec::new(),
        };
        self.store.put(Collection::Agents, &config.id, &record)?;
        self.agents.insert(config.id, Arc::new(Mutex::new(record)));

        info!(
            agent_id = %config.id,
            user = %config.user_id,
            name = %config.name,
            daily_limit = config.daily_limit,
            "agent created"
        );
        Ok(config)
    }

    /// Promotes a pending (or paused) agent to active once its proof is
    /// usable and its credit line, if any, is active.
    pub fn activate(&self, agent_id: &AgentId) -> Result<AgentConfig, AgentError> {
        let cell = self.cell(agent_id)?;
        let mut record = cell.lock();
        self.ensure_live(agent_id)?;
        if record.config.status == AgentStatus::Active {
            return Ok(record.config.clone());
        }
        record.config.validate()?;
        self.check_activation(&record.config)?;

        let mut updated = record.clone();
        updated.config.status = AgentStatus::Active;
        updated.config.updated_at = self.clock.now();
        self.store.put(Collection::Agents, agent_id, &updated)?;
        *record = updated;

        info!(agent_id = %agent_id, "agent activated");
        Ok(record.config.clone())
    }

    /// Flips an agent between active and paused. Pending agents go through
    /// [`AgentEngine::activate`] instead.
    pub fn toggle_status(
        &self,
        agent_id: &AgentId,
        status: AgentStatus,
    ) -> Result<AgentConfig, AgentError> {
        if status == AgentStatus::Pending {
            return Err(AgentError::Invalid("cannot toggle an agent back to pending".into()));
        }
        let cell = self.cell(agent_id)?;
        let mut record = cell.lock();
        self.ensure_live(agent_id)?;
        if record.config.status == AgentStatus::Pending {
            return Err(AgentError::Invalid(
                "pending agents must be activated first".into(),
            ));
        }
        if record.config.status == status {
            return Ok(record.config.clone());
        }

        let mut updated = record.clone();
        updated.config.status = status;
        updated.config.updated_at = self.clock.now();
        self.store.put(Collection::Agents, agent_id, &updated)?;
        *record = updated;

        info!(agent_id = %agent_id, status = ?status, "agent status changed");
        Ok(record.config.clone())
    }

    /// Applies `patch`. An active agent whose new configuration no longer
    /// passes activation falls back to pending.
    pub fn edit_agent(&self, agent_id: &AgentId, patch: AgentPatch) -> Result<AgentConfig, AgentError> {
        let cell = self.cell(agent_id)?;
        let mut record = cell.lock();
        self.ensure_live(agent_id)?;

        let mut updated = record.clone();
        patch.apply(&mut updated.config);
        updated.config.name = updated.config.name.trim().to_string();
        updated.config.validate()?;
        if updated.config.linked_proof_id != record.config.linked_proof_id {
            self.proofs.proof(&updated.config.linked_proof_id)?;
        }
        if let Some(line_id) = &updated.config.credit_line_id {
            if record.config.credit_line_id.as_ref() != Some(line_id) {
                self.check_line_owner(&updated.config, line_id)?;
            }
        }
        if updated.config.status == AgentStatus::Active {
            if let Err(e) = self.check_activation(&updated.config) {
                warn!(agent_id = %agent_id, reason = %e, "edited agent falls back to pending");
                updated.config.status = AgentStatus::Pending;
            }
        }
        updated.config.updated_at = self.clock.now();
        self.store.put(Collection::Agents, agent_id, &updated)?;
        *record = updated;

        info!(agent_id = %agent_id, status = ?record.config.status, "agent updated");
        Ok(record.config.clone())
    }

    /// Removes the agent and its tokens. Tokens already handed out stop
    /// redeeming.
    pub fn delete_agent(&self, agent_id: &AgentId) -> Result<AgentConfig, AgentError> {
        let cell = self.cell(agent_id)?;
        let record = cell.lock();
        self.ensure_live(agent_id)?;

        self.store.delete(Collection::Agents, agent_id)?;
        self.agents.remove(agent_id);

        let cells: Vec<_> = self
            .tokens
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let token_ids: Vec<TokenId> = cells
            .iter()
            .map(|cell| cell.lock().token.clone())
            .filter(|token| token.agent_id == *agent_id)
            .map(|token| token.id)
            .collect();
        for token_id in &token_ids {
            if let Err(e) = self.store.delete(Collection::Tokens, token_id) {
                warn!(token_id = %token_id, error = %e, "failed to delete token of removed agent");
            }
            self.tokens.remove(token_id);
        }

        info!(agent_id = %agent_id, tokens = token_ids.len(), "agent deleted");
        Ok(record.config.clone())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Sum of the agent's spends over the trailing `window`.
    pub fn rolling_spend(&self, agent_id: &AgentId, window: Duration) -> Result<u64, AgentError> {
        let cell = self.cell(agent_id)?;
        let record = cell.lock();
        Ok(record.spent_within(window, self.clock.now()))
    }

    pub fn agent(&self, agent_id: &AgentId) -> Result<AgentConfig, AgentError> {
        Ok(self.cell(agent_id)?.lock().config.clone())
    }

    /// Spend history, oldest first.
    pub fn spends(&self, agent_id: &AgentId) -> Result<Vec<SpendEvent>, AgentError> {
        Ok(self.cell(agent_id)?.lock().spends.clone())
    }

    /// A user's agents, oldest first.
    pub fn agents_for_user(&self, user_id: &str) -> Vec<AgentConfig> {
        let cells: Vec<_> = self
            .agents
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut agents: Vec<AgentConfig> = cells
            .iter()
            .map(|cell| cell.lock().config.clone())
            .filter(|c| c.user_id == user_id)
            .collect();
        agents.sort_by_key(|c| c.created_at);
        agents
    }

    pub fn token(&self, token_id: &TokenId) -> Result<TokenRecord, AgentError> {
        Ok(self.token_cell(token_id)?.lock().clone())
    }

    pub fn active_agent_count(&self) -> usize {
        let cells: Vec<_> = self
            .agents
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        cells
            .iter()
            .filter(|cell| cell.lock().config.status == AgentStatus::Active)
            .count()
    }

    /// Key that verifies issued tokens.
    pub fn public_key(&self) -> EnginePublicKey {
        self.keypair.public_key()
    }

    pub fn token_ttl(&self) -> Duration {
        self.token_ttl
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::collaborators::{CollaboratorError, ProverClient};
    use crate::config::{EngineConfig, DEFAULT_COLLATERAL_RATIO_BPS};
    use crate::credit::OpenCreditLine;
    use crate::ledger::{AssetLedger, AssetSnapshot, AssetSource, LockPurpose, LockRequest};
    use crate::proof::{ProofJob, ProofRequest, ProofStatement, ProverVerdict};
    use crate::types::AssetId;
    use async_trait::async_trait;

    /// Never answers; tests resolve proofs by hand.
    struct ManualProver;

    #[async_trait]
    impl ProverClient for ManualProver {
        async fn prove(&self, _job: ProofJob) -> Result<ProverVerdict, CollaboratorError> {
            std::future::pending().await
        }
    }

    struct Fixture {
        ledger: Arc<AssetLedger>,
        proofs: Arc<ProofRegistry>,
        credit: Arc<CreditLineManager>,
        engine: AgentEngine,
        clock: ManualClock,
        asset_id: AssetId,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::starting_at_recent();
        let store = Store::open_temporary().expect("temp store");
        let ledger = Arc::new(AssetLedger::new(store.clone(), clock.shared()).unwrap());
        let proofs = ProofRegistry::new(
            store.clone(),
            clock.shared(),
            EngineConfig::default(),
            Arc::new(ManualProver),
        )
        .unwrap();
        let credit = Arc::new(
            CreditLineManager::new(
                store.clone(),
                clock.shared(),
                Arc::clone(&ledger),
                DEFAULT_COLLATERAL_RATIO_BPS,
            )
            .unwrap(),
        );
        let engine = AgentEngine::new(
            store,
            clock.shared(),
            EngineKeypair::generate(),
            Duration::minutes(5),
            Arc::clone(&proofs),
            Arc::clone(&credit),
        )
        .unwrap();
        let asset_id = ledger
            .upsert_asset(AssetSnapshot {
                user_id: "alice".into(),
                ticker: "USDC".into(),
                balance: 10_000,
                usd_price_micros: 1_000_000,
                source: AssetSource::Wallet {
                    address: "0xa11ce".into(),
                },
            })
            .unwrap()
            .id;
        Fixture {
            ledger,
            proofs,
            credit,
            engine,
            clock,
            asset_id,
        }
    }

    impl Fixture {
        fn valid_proof(&self) -> ProofId {
            let proof = self
                .proofs
                .request_proof(
                    &ProofRequest {
                        asset_id: self.asset_id,
                        statement: ProofStatement::Balance { threshold: 1_000 },
                        validity_secs: None,
                    },
                    "USDC",
                )
                .unwrap();
            self.proofs
                .resolve_proof(&proof.id, ProverVerdict::accepted(true))
                .unwrap();
            proof.id
        }

        fn new_agent(&self, proof_id: ProofId, line: Option<CreditLineId>) -> NewAgent {
            NewAgent {
                user_id: "alice".into(),
                name: "shopper".into(),
                permissions: [Permission::Read, Permission::Execute].into_iter().collect(),
                spending_limit_per_tx: 100,
                daily_limit: 300,
                monthly_limit: None,
                allowed_chains: vec![ChainId(8453)],
                linked_proof_id: proof_id,
                credit_line_id: line,
            }
        }

        fn active_agent(&self, line: Option<CreditLineId>) -> AgentId {
            let proof_id = self.valid_proof();
            let agent = self.engine.create_agent(self.new_agent(proof_id, line)).unwrap();
            self.engine.activate(&agent.id).unwrap();
            agent.id
        }
    }

    #[tokio::test]
    async fn created_agents_start_pending() {
        let f = fixture();
        let proof_id = f.valid_proof();
        let agent = f.engine.create_agent(f.new_agent(proof_id, None)).unwrap();
        assert_eq!(agent.status, AgentStatus::Pending);
        assert!(matches!(
            f.engine.authorize_spend(&agent.id, 10, ChainId(8453)),
            Err(AgentError::AgentNotActive { .. })
        ));
    }

    #[tokio::test]
    async fn daily_limit_is_enforced() {
        let f = fixture();
        let agent = f.active_agent(None);

        for _ in 0..3 {
            f.engine.authorize_spend(&agent, 90, ChainId(8453)).unwrap();
        }
        let err = f.engine.authorize_spend(&agent, 90, ChainId(8453)).unwrap_err();
        assert!(matches!(
            err,
            AgentError::DailyLimitExceeded {
                limit: 300,
                spent: 270,
                requested: 90
            }
        ));
        assert_eq!(f.engine.rolling_spend(&agent, daily_window()).unwrap(), 270);

        // the window rolls
        f.clock.advance(Duration::hours(24));
        f.engine.authorize_spend(&agent, 90, ChainId(8453)).unwrap();
    }

    #[tokio::test]
    async fn per_tx_and_chain_checks() {
        let f = fixture();
        let agent = f.active_agent(None);
        assert!(matches!(
            f.engine.authorize_spend(&agent, 101, ChainId(8453)),
            Err(AgentError::PerTxLimitExceeded {
                limit: 100,
                requested: 101
            })
        ));
        assert!(matches!(
            f.engine.authorize_spend(&agent, 10, ChainId(1)),
            Err(AgentError::ChainNotAllowed { .. })
        ));
        assert!(matches!(
            f.engine.authorize_spend(&agent, 0, ChainId(8453)),
            Err(AgentError::ZeroAmount)
        ));
        assert!(f.engine.spends(&agent).unwrap().is_empty());
    }

    #[tokio::test]
    async fn monthly_limit_is_enforced() {
        let f = fixture();
        let agent = f.active_agent(None);
        f.engine
            .edit_agent(
                &agent,
                AgentPatch {
                    monthly_limit: Some(400),
                    ..Default::default()
                },
            )
            .unwrap();

        f.engine.authorize_spend(&agent, 100, ChainId(8453)).unwrap();
        f.engine.authorize_spend(&agent, 100, ChainId(8453)).unwrap();
        f.clock.advance(Duration::days(2));
        f.engine.authorize_spend(&agent, 100, ChainId(8453)).unwrap();
        f.engine.authorize_spend(&agent, 100, ChainId(8453)).unwrap();
        assert!(matches!(
            f.engine.authorize_spend(&agent, 1, ChainId(8453)),
            Err(AgentError::MonthlyLimitExceeded { limit: 400, .. })
        ));
    }

    #[tokio::test]
    async fn expired_proof_blocks_authorization() {
        let f = fixture();
        let agent = f.active_agent(None);
        f.clock.advance(Duration::days(8));
        let err = f.engine.authorize_spend(&agent, 10, ChainId(8453)).unwrap_err();
        assert!(matches!(
            err,
            AgentError::ProofInvalid {
                status: Some(crate::proof::ProofStatus::Expired),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unmet_threshold_blocks_activation() {
        let f = fixture();
        let proof = f
            .proofs
            .request_proof(
                &ProofRequest {
                    asset_id: f.asset_id,
                    statement: ProofStatement::Balance { threshold: 50_000 },
                    validity_secs: None,
                },
                "USDC",
            )
            .unwrap();
        f.proofs
            .resolve_proof(&proof.id, ProverVerdict::accepted(false))
            .unwrap();
        let agent = f.engine.create_agent(f.new_agent(proof.id, None)).unwrap();
        assert!(matches!(
            f.engine.activate(&agent.id),
            Err(AgentError::ProofInvalid { .. })
        ));
    }

    #[tokio::test]
    async fn tokens_are_single_use() {
        let f = fixture();
        let agent = f.active_agent(None);
        let token = f.engine.authorize_spend(&agent, 50, ChainId(8453)).unwrap();
        assert!(token.verify_signature(&f.engine.public_key()));

        f.engine.consume_token(&token).unwrap();
        assert!(matches!(
            f.engine.consume_token(&token),
            Err(AgentError::TokenAlreadyUsed(_))
        ));

        f.engine.restore_token(&token.id).unwrap();
        f.engine.consume_token(&token).unwrap();
    }

    #[tokio::test]
    async fn voided_authorization_frees_the_budget() {
        let f = fixture();
        let agent = f.active_agent(None);
        let kept = f.engine.authorize_spend(&agent, 100, ChainId(8453)).unwrap();
        let voided = f.engine.authorize_spend(&agent, 100, ChainId(8453)).unwrap();
        f.engine.consume_token(&voided).unwrap();

        f.engine.void_authorization(&voided.id).unwrap();
        assert_eq!(f.engine.rolling_spend(&agent, daily_window()).unwrap(), 100);
        let spends = f.engine.spends(&agent).unwrap();
        assert_eq!(spends.len(), 1);
        assert_eq!(spends[0].token_id, kept.id);
        assert!(matches!(
            f.engine.consume_token(&voided),
            Err(AgentError::TokenNotFound(_))
        ));
        assert!(matches!(
            f.engine.void_authorization(&voided.id),
            Err(AgentError::TokenNotFound(_))
        ));

        f.engine.authorize_spend(&agent, 100, ChainId(8453)).unwrap();
        f.engine.authorize_spend(&agent, 100, ChainId(8453)).unwrap();
    }

    #[tokio::test]
    async fn only_restored_tokens_lapse() {
        let f = fixture();
        let agent = f.active_agent(None);
        let unused = f.engine.authorize_spend(&agent, 30, ChainId(8453)).unwrap();
        let restored = f.engine.authorize_spend(&agent, 40, ChainId(8453)).unwrap();
        f.engine.consume_token(&restored).unwrap();
        f.engine.restore_token(&restored.id).unwrap();

        assert_eq!(f.engine.void_lapsed_tokens(), 0);
        f.clock.advance(Duration::minutes(6));
        assert_eq!(f.engine.void_lapsed_tokens(), 1);

        assert_eq!(f.engine.rolling_spend(&agent, daily_window()).unwrap(), 30);
        assert!(f.engine.token(&unused.id).is_ok());
        assert!(f.engine.token(&restored.id).is_err());
    }

    #[tokio::test]
    async fn expired_or_forged_tokens_rejected() {
        let f = fixture();
        let agent = f.active_agent(None);
        let token = f.engine.authorize_spend(&agent, 50, ChainId(8453)).unwrap();

        let mut forged = token.clone();
        forged.amount = 100;
        assert!(matches!(
            f.engine.consume_token(&forged),
            Err(AgentError::TokenSignatureInvalid(_))
        ));

        f.clock.advance(Duration::minutes(6));
        assert!(matches!(
            f.engine.consume_token(&token),
            Err(AgentError::TokenExpired { .. })
        ));
    }

    #[tokio::test]
    async fn deleted_agent_tokens_stop_working() {
        let f = fixture();
        let agent = f.active_agent(None);
        let token = f.engine.authorize_spend(&agent, 50, ChainId(8453)).unwrap();
        f.engine.delete_agent(&agent).unwrap();

        assert!(matches!(
            f.engine.consume_token(&token),
            Err(AgentError::TokenNotFound(_))
        ));
        assert!(matches!(
            f.engine.agent(&agent),
            Err(AgentError::AgentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn toggle_between_active_and_paused() {
        let f = fixture();
        let agent = f.active_agent(None);
        let paused = f.engine.toggle_status(&agent, AgentStatus::Paused).unwrap();
        assert_eq!(paused.status, AgentStatus::Paused);
        assert!(matches!(
            f.engine.authorize_spend(&agent, 10, ChainId(8453)),
            Err(AgentError::AgentNotActive { .. })
        ));
        f.engine.toggle_status(&agent, AgentStatus::Active).unwrap();
        f.engine.authorize_spend(&agent, 10, ChainId(8453)).unwrap();
        assert_eq!(f.engine.active_agent_count(), 1);
    }

    #[tokio::test]
    async fn editing_to_an_unusable_proof_falls_back_to_pending() {
        let f = fixture();
        let agent = f.active_agent(None);
        let pending = f
            .proofs
            .request_proof(
                &ProofRequest {
                    asset_id: f.asset_id,
                    statement: ProofStatement::Ownership,
                    validity_secs: None,
                },
                "USDC",
            )
            .unwrap();
        let edited = f
            .engine
            .edit_agent(
                &agent,
                AgentPatch {
                    linked_proof_id: Some(pending.id),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(edited.status, AgentStatus::Pending);
    }

    #[tokio::test]
    async fn credit_linked_agent_draws_on_line() {
        let f = fixture();
        f.ledger
            .lock_balance(&f.asset_id, LockRequest::new(5_000, LockPurpose::CreditBacking))
            .unwrap();
        let line = f
            .credit
            .open(OpenCreditLine {
                user_id: "alice".into(),
                limit: 150,
                collateral_asset_ids: vec![f.asset_id],
                interest_rate_bps: 500,
                expires_at: f.clock.now() + Duration::days(90),
            })
            .unwrap();
        let agent = f.active_agent(Some(line.id));

        let token = f.engine.authorize_spend(&agent, 100, ChainId(8453)).unwrap();
        assert_eq!(token.credit_line_id, Some(line.id));
        assert_eq!(f.credit.line(&line.id).unwrap().used, 100);

        let err = f.engine.authorize_spend(&agent, 60, ChainId(8453)).unwrap_err();
        assert!(matches!(
            err,
            AgentError::Credit(CreditError::CreditLimitExceeded { .. })
        ));
        // a rejected draw records no spend
        assert_eq!(f.engine.spends(&agent).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn foreign_credit_line_rejected() {
        let f = fixture();
        let bob_asset = f
            .ledger
            .upsert_asset(AssetSnapshot {
                user_id: "bob".into(),
                ticker: "ETH".into(),
                balance: 10,
                usd_price_micros: 1,
                source: AssetSource::Exchange {
                    name: "kraken".into(),
                },
            })
            .unwrap();
        f.ledger
            .lock_balance(&bob_asset.id, LockRequest::new(10, LockPurpose::CreditBacking))
            .unwrap();
        let line = f
            .credit
            .open(OpenCreditLine {
                user_id: "bob".into(),
                limit: 10,
                collateral_asset_ids: vec![bob_asset.id],
                interest_rate_bps: 0,
                expires_at: f.clock.now() + Duration::days(1),
            })
            .unwrap();
        let proof_id = f.valid_proof();
        assert!(matches!(
            f.engine.create_agent(f.new_agent(proof_id, Some(line.id))),
            Err(AgentError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_authorizations_respect_daily_limit() {
        let f = Arc::new(fixture());
        let agent = f.active_agent(None);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let f = Arc::clone(&f);
                std::thread::spawn(move || f.engine.authorize_spend(&agent, 90, ChainId(8453)).is_ok())
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(granted, 3);
        assert_eq!(f.engine.rolling_spend(&agent, daily_window()).unwrap(), 270);
    }

    #[tokio::test]
    async fn agents_and_tokens_survive_restart() {
        let clock = ManualClock::starting_at_recent();
        let dir = tempfile::tempdir().unwrap();
        let keypair = EngineKeypair::generate();
        let (agent_id, token) = {
            let store = Store::open(dir.path()).unwrap();
            let ledger = Arc::new(AssetLedger::new(store.clone(), clock.shared()).unwrap());
            let proofs = ProofRegistry::new(
                store.clone(),
                clock.shared(),
                EngineConfig::default(),
                Arc::new(ManualProver),
            )
            .unwrap();
            let credit = Arc::new(
                CreditLineManager::new(store.clone(), clock.shared(), ledger.clone(), 10_000)
                    .unwrap(),
            );
            let engine = AgentEngine::new(
                store.clone(),
                clock.shared(),
                keypair.clone(),
                Duration::minutes(5),
                proofs.clone(),
                credit,
            )
            .unwrap();
            let asset = ledger
                .upsert_asset(AssetSnapshot {
                    user_id: "alice".into(),
                    ticker: "USDC".into(),
                    balance: 1_000,
                    usd_price_micros: 1_000_000,
                    source: AssetSource::Wallet {
                        address: "0xa11ce".into(),
                    },
                })
                .unwrap();
            let proof = proofs
                .request_proof(
                    &ProofRequest {
                        asset_id: asset.id,
                        statement: ProofStatement::Ownership,
                        validity_secs: None,
                    },
                    "USDC",
                )
                .unwrap();
            proofs
                .resolve_proof(&proof.id, ProverVerdict::accepted(true))
                .unwrap();
            let agent = engine
                .create_agent(NewAgent {
                    user_id: "alice".into(),
                    name: "bot".into(),
                    permissions: [Permission::Execute].into_iter().collect(),
                    spending_limit_per_tx: 100,
                    daily_limit: 300,
                    monthly_limit: None,
                    allowed_chains: vec![ChainId(1)],
                    linked_proof_id: proof.id,
                    credit_line_id: None,
                })
                .unwrap();
            engine.activate(&agent.id).unwrap();
            let token = engine.authorize_spend(&agent.id, 80, ChainId(1)).unwrap();
            store.flush().unwrap();
            (agent.id, token)
        };

        let store = Store::open(dir.path()).unwrap();
        let ledger = Arc::new(AssetLedger::new(store.clone(), clock.shared()).unwrap());
        let proofs = ProofRegistry::new(
            store.clone(),
            clock.shared(),
            EngineConfig::default(),
            Arc::new(ManualProver),
        )
        .unwrap();
        let credit =
            Arc::new(CreditLineManager::new(store.clone(), clock.shared(), ledger, 10_000).unwrap());
        let engine = AgentEngine::new(
            store,
            clock.shared(),
            keypair,
            Duration::minutes(5),
            proofs,
            credit,
        )
        .unwrap();

        assert_eq!(engine.agent(&agent_id).unwrap().status, AgentStatus::Active);
        assert_eq!(engine.rolling_spend(&agent_id, daily_window()).unwrap(), 80);
        engine.consume_token(&token).unwrap();
    }
}
