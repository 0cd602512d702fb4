//! # Devnet Collaborators
//!
//! In-process stand-ins for the chain connector and the prover so a node
//! can run end to end on a laptop.
//!
//! - [`DevChainConnector`] keeps balances in memory (seeded through the API)
//!   and records transfers. It checks every token against the engine key
//!   before accepting a transfer, the way a real executor would.
//! - [`DevProver`] "proves" statements by reading the ledger after a short
//!   delay. It is not zero-knowledge, it is not even a proof, and it is
//!   exactly what you want when testing the rest of the pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use zkredit_protocol::collaborators::{
    BalanceReport, ChainConnector, CollaboratorError, ProverClient, TransferRequest, TxReference,
};
use zkredit_protocol::crypto::{blake3_hash, EnginePublicKey};
use zkredit_protocol::ledger::{AssetLedger, AssetSource};
use zkredit_protocol::proof::{ProofJob, ProofStatement, ProverVerdict};

const CHAIN: &str = "devnet-chain";
const PROVER: &str = "devnet-prover";

/// Balance seeded into the devnet chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevBalance {
    pub user_id: String,
    pub ticker: String,
    pub source: AssetSource,
    pub balance: u64,
    #[serde(default)]
    pub usd_price_micros: u64,
}

type BalanceKey = (String, String, AssetSource);

/// In-memory chain and exchange.
pub struct DevChainConnector {
    balances: RwLock<HashMap<BalanceKey, BalanceReport>>,
    transfers: Mutex<Vec<TransferRequest>>,
    engine_key: EnginePublicKey,
}

impl DevChainConnector {
    pub fn new(engine_key: EnginePublicKey) -> Self {
        Self {
            balances: RwLock::new(HashMap::new()),
            transfers: Mutex::new(Vec::new()),
            engine_key,
        }
    }

    pub fn set_balance(&self, seed: DevBalance) {
        let key = (seed.user_id, seed.ticker.to_uppercase(), seed.source);
        self.balances.write().insert(
            key,
            BalanceReport {
                balance: seed.balance,
                usd_price_micros: seed.usd_price_micros,
            },
        );
    }

    pub fn transfer_count(&self) -> usize {
        self.transfers.lock().len()
    }
}

#[async_trait]
impl ChainConnector for DevChainConnector {
    async fn report_balance(
        &self,
        user_id: &str,
        ticker: &str,
        source: &AssetSource,
    ) -> Result<BalanceReport, CollaboratorError> {
        let key = (user_id.to_string(), ticker.trim().to_uppercase(), source.clone());
        self.balances.read().get(&key).cloned().ok_or_else(|| {
            CollaboratorError::rejected(CHAIN, format!("no {ticker} account for {user_id}"))
        })
    }

    async fn execute_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<TxReference, CollaboratorError> {
        if !request.token.verify_signature(&self.engine_key) {
            return Err(CollaboratorError::rejected(CHAIN, "token signature invalid"));
        }
        if request.amount != request.token.amount || request.chain_id != request.token.chain_id {
            return Err(CollaboratorError::rejected(
                CHAIN,
                "transfer does not match its token",
            ));
        }

        let tx_hash = hex_digest(&request.token.digest(), &request.recipient);
        self.transfers.lock().push(request.clone());
        tracing::info!(
            token_id = %request.token.id,
            amount = request.amount,
            recipient = %request.recipient,
            %tx_hash,
            "devnet transfer executed"
        );
        Ok(TxReference {
            chain_id: request.chain_id,
            tx_hash,
        })
    }
}

fn hex_digest(token_digest: &[u8; 32], recipient: &str) -> String {
    let mut data = token_digest.to_vec();
    data.extend_from_slice(recipient.as_bytes());
    format!("0x{}", hex::encode(blake3_hash(&data)))
}

/// Answers proof jobs from the ledger's view of the asset.
pub struct DevProver {
    ledger: Arc<AssetLedger>,
    delay: Duration,
}

impl DevProver {
    pub fn new(ledger: Arc<AssetLedger>, delay: Duration) -> Self {
        Self { ledger, delay }
    }

    fn evaluate(&self, job: &ProofJob) -> ProverVerdict {
        let account = match self.ledger.account(&job.asset_id) {
            Ok(account) => account,
            Err(e) => return ProverVerdict::rejected(e.to_string()),
        };
        let threshold_met = match &job.statement {
            ProofStatement::Ownership => true,
            ProofStatement::Balance { threshold } => account.asset.balance >= *threshold,
            ProofStatement::Credit { min_credit } => account.credit_backing_total() >= *min_credit,
        };
        ProverVerdict {
            valid: true,
            threshold_met: Some(threshold_met),
            asset_type: Some(account.asset.ticker),
            reason: None,
        }
    }
}

#[async_trait]
impl ProverClient for DevProver {
    async fn prove(&self, job: ProofJob) -> Result<ProverVerdict, CollaboratorError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let verdict = self.evaluate(&job);
        tracing::debug!(
            proof_id = %job.proof_id,
            prover = PROVER,
            valid = verdict.valid,
            threshold_met = ?verdict.threshold_met,
            "devnet proof computed"
        );
        Ok(verdict)
    }
}
