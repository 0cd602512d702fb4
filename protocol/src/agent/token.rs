//! # Authorization Tokens
//!
//! A token is the engine's answer to "may this agent spend `amount` on
//! `chain`?". It is single-use, short-lived, and signed with the engine key
//! so an execution collaborator can check it without calling back.
//!
//! ## Digest layout
//!
//! ```text
//! blake3_derive_key("zkredit/authorization-token/v1",
//!     len‖id ‖ len‖agent_id ‖ len‖user_id ‖ len‖amount_le ‖ len‖chain_le
//!     ‖ len‖issued_at_ms_le ‖ len‖expires_at_ms_le ‖ len‖credit_line_id?)
//! ```
//!
//! The Ed25519 signature covers the 32-byte digest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TOKEN_DOMAIN;
use crate::crypto::{domain_separated_hash_parts, EngineKeypair, EnginePublicKey, EngineSignature};
use crate::types::{AgentId, ChainId, CreditLineId, TokenId, UserId};

/// Single-use spend authorization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationToken {
    pub id: TokenId,
    pub agent_id: AgentId,
    pub user_id: UserId,
    pub amount: u64,
    pub chain_id: ChainId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Line the spend was drawn on, if any.
    pub credit_line_id: Option<CreditLineId>,
    pub signature: EngineSignature,
}

/// Unsigned token fields, as assembled by the engine.
pub(crate) struct TokenClaims {
    pub id: TokenId,
    pub agent_id: AgentId,
    pub user_id: UserId,
    pub amount: u64,
    pub chain_id: ChainId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub credit_line_id: Option<CreditLineId>,
}

impl TokenClaims {
    fn digest(&self) -> [u8; 32] {
        let amount = self.amount.to_le_bytes();
        let chain = self.chain_id.0.to_le_bytes();
        let issued = self.issued_at.timestamp_millis().to_le_bytes();
        let expires = self.expires_at.timestamp_millis().to_le_bytes();
        let line: &[u8] = match &self.credit_line_id {
            Some(id) => id.as_bytes(),
            None => &[],
        };
        domain_separated_hash_parts(
            TOKEN_DOMAIN,
            &[
                self.id.as_bytes(),
                self.agent_id.as_bytes(),
                self.user_id.as_bytes(),
                &amount,
                &chain,
                &issued,
                &expires,
                line,
            ],
        )
    }

    pub(crate) fn sign(self, keypair: &EngineKeypair) -> AuthorizationToken {
        let signature = keypair.sign(&self.digest());
        AuthorizationToken {
            id: self.id,
            agent_id: self.agent_id,
            user_id: self.user_id,
            amount: self.amount,
            chain_id: self.chain_id,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            credit_line_id: self.credit_line_id,
            signature,
        }
    }
}

impl AuthorizationToken {
    fn claims(&self) -> TokenClaims {
        TokenClaims {
            id: self.id,
            agent_id: self.agent_id,
            user_id: self.user_id.clone(),
            amount: self.amount,
            chain_id: self.chain_id,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            credit_line_id: self.credit_line_id,
        }
    }

    /// Digest the signature covers.
    pub fn digest(&self) -> [u8; 32] {
        self.claims().digest()
    }

    /// `true` if the engine key behind `public_key` signed exactly these
    /// fields.
    pub fn verify_signature(&self, public_key: &EnginePublicKey) -> bool {
        public_key.verify(&self.digest(), &self.signature)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Stored token plus redemption state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token: AuthorizationToken,
    pub consumed_at: Option<DateTime<Utc>>,
    /// Set when a failed transfer gave the token back.
    #[serde(default)]
    pub restored_at: Option<DateTime<Utc>>,
}

impl TokenRecord {
    /// A restored token that ran out of time before anyone redeemed it.
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.restored_at.is_some() && self.consumed_at.is_none() && self.token.is_expired(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn claims(now: DateTime<Utc>) -> TokenClaims {
        TokenClaims {
            id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            user_id: "alice".into(),
            amount: 90,
            chain_id: ChainId(8453),
            issued_at: now,
            expires_at: now + Duration::minutes(5),
            credit_line_id: None,
        }
    }

    #[test]
    fn signed_token_verifies() {
        let kp = EngineKeypair::generate();
        let token = claims(Utc::now()).sign(&kp);
        assert!(token.verify_signature(&kp.public_key()));
    }

    #[test]
    fn tampered_amount_fails() {
        let kp = EngineKeypair::generate();
        let mut token = claims(Utc::now()).sign(&kp);
        token.amount = 9_000;
        assert!(!token.verify_signature(&kp.public_key()));
    }

    #[test]
    fn tampered_chain_or_line_fails() {
        let kp = EngineKeypair::generate();
        let original = claims(Utc::now()).sign(&kp);

        let mut token = original.clone();
        token.chain_id = ChainId(1);
        assert!(!token.verify_signature(&kp.public_key()));

        let mut token = original;
        token.credit_line_id = Some(Uuid::new_v4());
        assert!(!token.verify_signature(&kp.public_key()));
    }

    #[test]
    fn foreign_key_fails() {
        let token = claims(Utc::now()).sign(&EngineKeypair::generate());
        assert!(!token.verify_signature(&EngineKeypair::generate().public_key()));
    }

    #[test]
    fn expiry() {
        let now = Utc::now();
        let token = claims(now).sign(&EngineKeypair::generate());
        assert!(!token.is_expired(now + Duration::minutes(5)));
        assert!(token.is_expired(now + Duration::minutes(5) + Duration::milliseconds(1)));
    }
}
