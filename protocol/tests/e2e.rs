//! End-to-end integration tests for the ZKredit engine.
//!
//! These drive the public orchestrator the way the node does: balances come
//! in, proofs get requested and resolved, credit lines open against locked
//! collateral, agents spend. Each test builds its own engine over a
//! temporary sled store and a manual clock, so expiry and rolling windows
//! are tested by moving time rather than waiting for it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Duration;
use parking_lot::Mutex;

use zkredit_protocol::agent::{AgentError, AgentStatus, NewAgent, Permission};
use zkredit_protocol::clock::ManualClock;
use zkredit_protocol::collaborators::{
    BalanceReport, ChainConnector, CollaboratorError, ProverClient, RetryPolicy, TransferRequest,
    TxReference,
};
use zkredit_protocol::config::EngineConfig;
use zkredit_protocol::credit::{CreditError, OpenCreditLine};
use zkredit_protocol::crypto::EngineKeypair;
use zkredit_protocol::ledger::{AssetSnapshot, AssetSource, LedgerError, LockPurpose, LockRequest};
use zkredit_protocol::orchestrator::SpendRequest;
use zkredit_protocol::proof::{
    ProofError, ProofJob, ProofRequest, ProofStatement, ProofStatus, ProverVerdict,
};
use zkredit_protocol::storage::Store;
use zkredit_protocol::types::{AgentId, AssetId, ChainId, ProofId};
use zkredit_protocol::{EngineError, ErrorKind, Orchestrator};

// ---------------------------------------------------------------------------
// Collaborator doubles
// ---------------------------------------------------------------------------

/// In-memory chain: balances by (user, ticker), transfers recorded. Set
/// `transfer_failure` to make every transfer fail with that error.
#[derive(Default)]
struct MemoryChain {
    balances: Mutex<HashMap<(String, String), u64>>,
    transfers: Mutex<Vec<TransferRequest>>,
    transfer_failure: Mutex<Option<CollaboratorError>>,
}

#[async_trait]
impl ChainConnector for MemoryChain {
    async fn report_balance(
        &self,
        user_id: &str,
        ticker: &str,
        _source: &AssetSource,
    ) -> Result<BalanceReport, CollaboratorError> {
        let balance = self
            .balances
            .lock()
            .get(&(user_id.to_string(), ticker.to_string()))
            .copied()
            .ok_or_else(|| CollaboratorError::rejected("chain", "unknown account"))?;
        Ok(BalanceReport {
            balance,
            usd_price_micros: 1_000_000,
        })
    }

    async fn execute_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<TxReference, CollaboratorError> {
        if let Some(e) = self.transfer_failure.lock().clone() {
            return Err(e);
        }
        self.transfers.lock().push(request.clone());
        Ok(TxReference {
            chain_id: request.chain_id,
            tx_hash: format!("0x{}", request.token.id.simple()),
        })
    }
}

/// Never answers on its own; tests deliver verdicts through the callback.
struct CallbackProver;

#[async_trait]
impl ProverClient for CallbackProver {
    async fn prove(&self, _job: ProofJob) -> Result<ProverVerdict, CollaboratorError> {
        std::future::pending().await
    }
}

/// Answers every job after a short delay.
struct SlowAcceptingProver;

#[async_trait]
impl ProverClient for SlowAcceptingProver {
    async fn prove(&self, _job: ProofJob) -> Result<ProverVerdict, CollaboratorError> {
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        Ok(ProverVerdict::accepted(true))
    }
}

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

struct Harness {
    orch: Arc<Orchestrator>,
    chain: Arc<MemoryChain>,
    clock: ManualClock,
}

fn setup_with(store: Store, clock: ManualClock, prover: Arc<dyn ProverClient>) -> Harness {
    let chain = Arc::new(MemoryChain::default());
    let orch = Orchestrator::open(
        store,
        clock.shared(),
        EngineConfig::default(),
        EngineKeypair::from_seed(&[7u8; 32]),
        Arc::clone(&chain) as Arc<dyn ChainConnector>,
        prover,
    )
    .expect("engine opens")
    .with_retry_policy(RetryPolicy::immediate(1));
    Harness {
        orch: Arc::new(orch),
        chain,
        clock,
    }
}

fn setup() -> Harness {
    setup_with(
        Store::open_temporary().expect("temp store"),
        ManualClock::starting_at_recent(),
        Arc::new(CallbackProver),
    )
}

fn wallet() -> AssetSource {
    AssetSource::Wallet {
        address: "0xa11ce".into(),
    }
}

impl Harness {
    fn asset(&self, ticker: &str, balance: u64) -> AssetId {
        self.orch
            .upsert_asset(AssetSnapshot {
                user_id: "alice".into(),
                ticker: ticker.into(),
                balance,
                usd_price_micros: 1_000_000,
                source: wallet(),
            })
            .expect("asset stored")
            .id
    }

    fn valid_proof(&self, asset_id: AssetId) -> ProofId {
        let proof = self
            .orch
            .request_proof(&ProofRequest {
                asset_id,
                statement: ProofStatement::Balance { threshold: 100 },
                validity_secs: None,
            })
            .expect("proof requested");
        self.orch
            .prover_callback(&proof.id, ProverVerdict::accepted(true))
            .expect("proof resolved");
        proof.id
    }

    fn agent(&self, proof_id: ProofId, line: Option<uuid::Uuid>) -> AgentId {
        let agent = self
            .orch
            .create_agent(NewAgent {
                user_id: "alice".into(),
                name: "groceries".into(),
                permissions: [Permission::Read, Permission::Execute].into_iter().collect(),
                spending_limit_per_tx: 100,
                daily_limit: 300,
                monthly_limit: Some(2_000),
                allowed_chains: vec![ChainId(1), ChainId(8453)],
                linked_proof_id: proof_id,
                credit_line_id: line,
            })
            .expect("agent created");
        self.orch.activate_agent(&agent.id).expect("agent active");
        agent.id
    }

    fn credit_line(&self, asset_id: AssetId, limit: u64) -> uuid::Uuid {
        self.orch
            .open_credit_line(OpenCreditLine {
                user_id: "alice".into(),
                limit,
                collateral_asset_ids: vec![asset_id],
                interest_rate_bps: 850,
                expires_at: self.clock.shared().now() + Duration::days(180),
            })
            .expect("line opened")
            .id
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[test]
fn locks_never_exceed_balance() {
    let h = setup();
    let asset = h.asset("USDC", 40);

    let err = h
        .orch
        .lock_balance(&asset, LockRequest::new(50, LockPurpose::AgentOperations))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Ledger(LedgerError::InsufficientBalance {
            free: 40,
            requested: 50,
            ..
        })
    ));

    h.orch
        .lock_balance(&asset, LockRequest::new(40, LockPurpose::AgentOperations))
        .unwrap();
    let err = h
        .orch
        .lock_balance(&asset, LockRequest::new(1, LockPurpose::DirectTransactions))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PolicyViolation);
    assert_eq!(h.orch.free_balance(&asset).unwrap(), 0);
}

#[test]
fn snapshot_below_locked_total_is_rejected() {
    let h = setup();
    let asset = h.asset("ETH", 1_000);
    h.orch
        .lock_balance(&asset, LockRequest::new(600, LockPurpose::CreditBacking))
        .unwrap();

    let err = h
        .orch
        .upsert_asset(AssetSnapshot {
            user_id: "alice".into(),
            ticker: "eth".into(),
            balance: 500,
            usd_price_micros: 1,
            source: wallet(),
        })
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Ledger(LedgerError::LockedExceedsBalance { .. })
    ));
    assert_eq!(h.orch.asset(&asset).unwrap().balance, 1_000);
}

#[tokio::test]
async fn sync_balance_creates_then_updates_one_asset() {
    let h = setup();
    h.chain
        .balances
        .lock()
        .insert(("alice".into(), "BTC".into()), 3);
    let first = h
        .orch
        .sync_balance(zkredit_protocol::orchestrator::SyncBalance {
            user_id: "alice".into(),
            ticker: "BTC".into(),
            source: wallet(),
        })
        .await
        .unwrap();

    h.chain
        .balances
        .lock()
        .insert(("alice".into(), "BTC".into()), 5);
    let second = h
        .orch
        .sync_balance(zkredit_protocol::orchestrator::SyncBalance {
            user_id: "alice".into(),
            ticker: "btc".into(),
            source: wallet(),
        })
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.balance, 5);
    assert_eq!(h.orch.assets_for_user("alice").len(), 1);
}

// ---------------------------------------------------------------------------
// Proofs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rejected_proof_cannot_be_verified() {
    let h = setup();
    let asset = h.asset("USDC", 10);
    let proof = h
        .orch
        .request_proof(&ProofRequest {
            asset_id: asset,
            statement: ProofStatement::Balance { threshold: 1_000 },
            validity_secs: None,
        })
        .unwrap();
    assert_eq!(proof.status, ProofStatus::Pending);

    let resolved = h
        .orch
        .prover_callback(&proof.id, ProverVerdict::rejected("balance below threshold"))
        .unwrap();
    assert_eq!(resolved.status, ProofStatus::Invalid);

    let err = h.orch.verify_proof(&proof.id).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Proof(ProofError::ProofNotValid {
            status: ProofStatus::Invalid,
            ..
        })
    ));
}

#[tokio::test]
async fn verification_counts_without_changing_status() {
    let h = setup();
    let asset = h.asset("USDC", 500);
    let proof_id = h.valid_proof(asset);

    let first = h.orch.verify_proof(&proof_id).unwrap();
    let second = h.orch.verify_proof(&proof_id).unwrap();
    assert_eq!(first.status, ProofStatus::Valid);
    assert_eq!(second.status, ProofStatus::Valid);
    assert_eq!(second.verification_count, first.verification_count + 1);
}

#[tokio::test]
async fn cancelled_proof_rejects_late_resolution() {
    let h = setup();
    let asset = h.asset("USDC", 500);
    let proof = h
        .orch
        .request_proof(&ProofRequest {
            asset_id: asset,
            statement: ProofStatement::Ownership,
            validity_secs: None,
        })
        .unwrap();

    let cancelled = h.orch.cancel_proof(&proof.id).unwrap();
    assert_eq!(cancelled.status, ProofStatus::Invalid);
    assert_eq!(cancelled.invalid_reason.as_deref(), Some("cancelled"));

    let err = h
        .orch
        .prover_callback(&proof.id, ProverVerdict::accepted(true))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn background_prover_resolves_proof() {
    let h = setup_with(
        Store::open_temporary().unwrap(),
        ManualClock::starting_at_recent(),
        Arc::new(SlowAcceptingProver),
    );
    let asset = h.asset("USDC", 500);
    let proof = h
        .orch
        .request_proof(&ProofRequest {
            asset_id: asset,
            statement: ProofStatement::Balance { threshold: 100 },
            validity_secs: Some(3_600),
        })
        .unwrap();
    assert_eq!(proof.status, ProofStatus::Pending);

    let mut status = ProofStatus::Pending;
    for _ in 0..200 {
        status = h.orch.proof(&proof.id).unwrap().status;
        if status != ProofStatus::Pending {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
    assert_eq!(status, ProofStatus::Valid);
}

#[tokio::test]
async fn proof_for_unknown_asset_is_not_found() {
    let h = setup();
    let err = h
        .orch
        .request_proof(&ProofRequest {
            asset_id: uuid::Uuid::new_v4(),
            statement: ProofStatement::Ownership,
            validity_secs: None,
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ---------------------------------------------------------------------------
// Credit lines
// ---------------------------------------------------------------------------

#[test]
fn credit_line_draw_repay_close() {
    let h = setup();
    let asset = h.asset("USDC", 2_000);
    h.orch
        .lock_balance(&asset, LockRequest::new(1_000, LockPurpose::CreditBacking))
        .unwrap();
    let line = h.credit_line(asset, 1_000);

    h.orch.adjust_credit(&line, 500).unwrap();
    let err = h.orch.close_credit_line(&line).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Credit(CreditError::NonZeroBalance { used: 500, .. })
    ));
    assert!((h.orch.utilization_rate(&line).unwrap() - 50.0).abs() < f64::EPSILON);

    h.orch.adjust_credit(&line, -500).unwrap();
    let closed = h.orch.close_credit_line(&line).unwrap();
    assert!(closed.status.is_terminal());
}

#[test]
fn credit_line_never_exceeds_limit() {
    let h = setup();
    let asset = h.asset("USDC", 2_000);
    h.orch
        .lock_balance(&asset, LockRequest::new(2_000, LockPurpose::CreditBacking))
        .unwrap();
    let line = h.credit_line(asset, 1_000);

    h.orch.adjust_credit(&line, 999).unwrap();
    let err = h.orch.adjust_credit(&line, 2).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Credit(CreditError::CreditLimitExceeded { .. })
    ));
    let err = h.orch.adjust_credit(&line, -1_000).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Credit(CreditError::NegativeUsage { .. })
    ));
    assert_eq!(h.orch.credit_line(&line).unwrap().used, 999);
}

#[test]
fn outstanding_credit_pins_its_collateral() {
    let h = setup();
    let asset = h.asset("USDC", 2_000);
    let lock = h
        .orch
        .lock_balance(&asset, LockRequest::new(1_000, LockPurpose::CreditBacking))
        .unwrap();
    let line = h.credit_line(asset, 1_000);
    h.orch.adjust_credit(&line, 400).unwrap();

    let err = h.orch.unlock_balance(&lock.id).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Ledger(LedgerError::LockInUse {
            required: 400,
            remaining: 0,
            ..
        })
    ));

    h.orch.adjust_credit(&line, -400).unwrap();
    h.orch.unlock_balance(&lock.id).unwrap();
    assert_eq!(h.orch.free_balance(&asset).unwrap(), 2_000);
}

#[test]
fn collateral_backs_one_line_at_a_time() {
    let h = setup();
    let asset = h.asset("USDC", 2_000);
    h.orch
        .lock_balance(&asset, LockRequest::new(1_000, LockPurpose::CreditBacking))
        .unwrap();
    let first = h.credit_line(asset, 500);

    let err = h
        .orch
        .open_credit_line(OpenCreditLine {
            user_id: "alice".into(),
            limit: 500,
            collateral_asset_ids: vec![asset],
            interest_rate_bps: 0,
            expires_at: h.clock.shared().now() + Duration::days(30),
        })
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Credit(CreditError::CollateralAlreadyPledged { .. })
    ));

    h.orch.close_credit_line(&first).unwrap();
    h.credit_line(asset, 500);
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

#[tokio::test]
async fn agent_daily_limit_end_to_end() {
    let h = setup();
    let asset = h.asset("USDC", 5_000);
    let proof = h.valid_proof(asset);
    let agent = h.agent(proof, None);

    for _ in 0..3 {
        h.orch
            .authorize_and_execute(SpendRequest {
                agent_id: agent,
                amount: 90,
                chain_id: ChainId(8453),
                recipient: "0xc0ffee".into(),
            })
            .await
            .unwrap();
    }
    let err = h
        .orch
        .authorize_and_execute(SpendRequest {
            agent_id: agent,
            amount: 90,
            chain_id: ChainId(8453),
            recipient: "0xc0ffee".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Agent(AgentError::DailyLimitExceeded { .. })
    ));
    assert_eq!(h.chain.transfers.lock().len(), 3);

    let confirmed = h.orch.confirm_transfer(&asset, 270).unwrap();
    assert_eq!(confirmed.balance, 4_730);
}

#[tokio::test]
async fn expired_proof_blocks_authorization() {
    let h = setup();
    let asset = h.asset("USDC", 5_000);
    let proof = h.valid_proof(asset);
    let agent = h.agent(proof, None);

    h.orch.authorize_spend(&agent, 10, ChainId(1)).unwrap();
    h.clock.advance(Duration::days(7) + Duration::seconds(1));

    let err = h.orch.authorize_spend(&agent, 10, ChainId(1)).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Agent(AgentError::ProofInvalid {
            status: Some(ProofStatus::Expired),
            ..
        })
    ));
    assert_eq!(h.orch.proof(&proof).unwrap().status, ProofStatus::Expired);
}

#[tokio::test]
async fn credit_backed_agent_is_capped_by_line() {
    let h = setup();
    let asset = h.asset("USDC", 5_000);
    h.orch
        .lock_balance(&asset, LockRequest::new(150, LockPurpose::CreditBacking))
        .unwrap();
    let line = h.credit_line(asset, 1_000);
    let proof = h.valid_proof(asset);
    let agent = h.agent(proof, Some(line));

    h.orch.authorize_spend(&agent, 100, ChainId(1)).unwrap();
    let err = h.orch.authorize_spend(&agent, 100, ChainId(1)).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Agent(AgentError::Credit(CreditError::InsufficientCollateral {
            required: 200,
            available: 150
        }))
    ));
    assert_eq!(h.orch.credit_line(&line).unwrap().used, 100);
    assert_eq!(h.orch.agent_spends(&agent).unwrap().len(), 1);
}

fn spend(agent_id: AgentId, amount: u64) -> SpendRequest {
    SpendRequest {
        agent_id,
        amount,
        chain_id: ChainId(8453),
        recipient: "0xb0b".into(),
    }
}

#[tokio::test]
async fn rejected_transfer_releases_spend_and_credit() {
    let h = setup();
    let asset = h.asset("USDC", 5_000);
    h.orch
        .lock_balance(&asset, LockRequest::new(1_000, LockPurpose::CreditBacking))
        .unwrap();
    let line = h.credit_line(asset, 1_000);
    let proof = h.valid_proof(asset);
    let agent = h.agent(proof, Some(line));
    *h.chain.transfer_failure.lock() = Some(CollaboratorError::rejected("chain", "nonce too low"));

    let err = h.orch.authorize_and_execute(spend(agent, 80)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExternalCollaborator);
    assert_eq!(h.orch.rolling_spend(&agent, Duration::hours(24)).unwrap(), 0);
    assert!(h.orch.agent_spends(&agent).unwrap().is_empty());
    assert_eq!(h.orch.credit_line(&line).unwrap().used, 0);
    assert!(h.chain.transfers.lock().is_empty());

    // the whole daily budget is still there
    *h.chain.transfer_failure.lock() = None;
    for _ in 0..3 {
        h.orch.authorize_and_execute(spend(agent, 100)).await.unwrap();
    }
    assert_eq!(h.orch.credit_line(&line).unwrap().used, 300);
}

#[tokio::test]
async fn unavailable_chain_keeps_token_until_it_lapses() {
    let h = setup();
    let asset = h.asset("USDC", 5_000);
    h.orch
        .lock_balance(&asset, LockRequest::new(1_000, LockPurpose::CreditBacking))
        .unwrap();
    let line = h.credit_line(asset, 1_000);
    let proof = h.valid_proof(asset);
    let agent = h.agent(proof, Some(line));
    *h.chain.transfer_failure.lock() = Some(CollaboratorError::unavailable("chain", "rpc down"));

    let token = h.orch.authorize_spend(&agent, 60, ChainId(8453)).unwrap();
    let err = h
        .orch
        .execute_with_token(&token, "0xb0b".into())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExternalCollaborator);
    let record = h.orch.token(&token.id).unwrap();
    assert!(record.consumed_at.is_none());
    assert!(record.restored_at.is_some());
    assert_eq!(h.orch.credit_line(&line).unwrap().used, 60);

    // still live: nothing to release
    assert_eq!(h.orch.release_lapsed_authorizations(), 0);

    h.clock.advance(Duration::minutes(6));
    assert_eq!(h.orch.release_lapsed_authorizations(), 1);
    assert_eq!(h.orch.rolling_spend(&agent, Duration::hours(24)).unwrap(), 0);
    assert_eq!(h.orch.credit_line(&line).unwrap().used, 0);
    assert_eq!(h.orch.token(&token.id).unwrap_err().kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn restored_token_can_be_resubmitted() {
    let h = setup();
    let asset = h.asset("USDC", 5_000);
    let proof = h.valid_proof(asset);
    let agent = h.agent(proof, None);
    *h.chain.transfer_failure.lock() = Some(CollaboratorError::unavailable("chain", "rpc down"));

    let token = h.orch.authorize_spend(&agent, 40, ChainId(8453)).unwrap();
    assert!(h.orch.execute_with_token(&token, "0xb0b".into()).await.is_err());

    *h.chain.transfer_failure.lock() = None;
    h.orch
        .execute_with_token(&token, "0xb0b".into())
        .await
        .unwrap();
    assert_eq!(h.chain.transfers.lock().len(), 1);
    assert_eq!(h.orch.rolling_spend(&agent, Duration::hours(24)).unwrap(), 40);

    // consumed tokens never lapse
    h.clock.advance(Duration::minutes(6));
    assert_eq!(h.orch.release_lapsed_authorizations(), 0);
    assert_eq!(h.orch.rolling_spend(&agent, Duration::hours(24)).unwrap(), 40);
}

#[tokio::test]
async fn paused_agent_cannot_spend() {
    let h = setup();
    let asset = h.asset("USDC", 5_000);
    let proof = h.valid_proof(asset);
    let agent = h.agent(proof, None);

    h.orch.toggle_agent(&agent, AgentStatus::Paused).unwrap();
    let err = h.orch.authorize_spend(&agent, 10, ChainId(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PolicyViolation);

    h.orch.delete_agent(&agent).unwrap();
    assert_eq!(
        h.orch.authorize_spend(&agent, 10, ChainId(1)).unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_authorizations_never_exceed_daily_limit() {
    let h = setup();
    let asset = h.asset("USDC", 5_000);
    let proof = h.valid_proof(asset);
    let agent = h.agent(proof, None);

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let orch = Arc::clone(&h.orch);
            tokio::spawn(async move { orch.authorize_spend(&agent, 40, ChainId(1)).is_ok() })
        })
        .collect();

    let mut granted = 0;
    for task in tasks {
        if task.await.unwrap() {
            granted += 1;
        }
    }
    assert_eq!(granted, 7);
    assert_eq!(h.orch.rolling_spend(&agent, Duration::hours(24)).unwrap(), 280);
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn state_survives_reopening_the_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = ManualClock::starting_at_recent();

    let (asset, line, agent, proof) = {
        let h = setup_with(
            Store::open(dir.path()).unwrap(),
            clock.clone(),
            Arc::new(CallbackProver),
        );
        let asset = h.asset("USDC", 3_000);
        h.orch
            .lock_balance(&asset, LockRequest::new(1_000, LockPurpose::CreditBacking))
            .unwrap();
        let line = h.credit_line(asset, 800);
        let proof = h.valid_proof(asset);
        let agent = h.agent(proof, Some(line));
        h.orch.authorize_spend(&agent, 75, ChainId(8453)).unwrap();
        h.orch.flush().unwrap();
        (asset, line, agent, proof)
    };

    let h = setup_with(
        Store::open(dir.path()).unwrap(),
        clock,
        Arc::new(CallbackProver),
    );
    assert_eq!(h.orch.asset(&asset).unwrap().balance, 3_000);
    assert_eq!(h.orch.free_balance(&asset).unwrap(), 2_000);
    assert_eq!(h.orch.credit_line(&line).unwrap().used, 75);
    assert_eq!(h.orch.proof(&proof).unwrap().status, ProofStatus::Valid);
    assert_eq!(h.orch.agent(&agent).unwrap().status, AgentStatus::Active);
    assert_eq!(h.orch.rolling_spend(&agent, Duration::hours(24)).unwrap(), 75);

    // pledges are rebuilt on load
    let lock = h.orch.locks_for_asset(&asset).unwrap()[0].clone();
    assert_eq!(
        h.orch.unlock_balance(&lock.id).unwrap_err().kind(),
        ErrorKind::PolicyViolation
    );
}
