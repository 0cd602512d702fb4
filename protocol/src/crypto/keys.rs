//! # Engine Signing Key
//!
//! Ed25519 keypair the engine signs authorization tokens with. Execution
//! collaborators hold only the public half, so they can check a token
//! offline before they move any funds.
//!
//! ## Security considerations
//!
//! - Private keys are zeroized on drop (ed25519-dalek does this for us).
//! - Fresh keys come from `OsRng`.
//! - Key bytes are never logged. `Debug` prints the public key only.

use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors from loading key material.
///
/// Deliberately vague about *why* parsing failed.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key: expected 32 hex-encoded bytes")]
    InvalidSecretKey,

    #[error("invalid public key: not a valid Ed25519 point")]
    InvalidPublicKey,
}

/// The engine's token-signing keypair.
///
/// Does NOT implement `Serialize`. Writing a secret key somewhere should be
/// an explicit call to [`EngineKeypair::secret_hex`], not a side effect of
/// putting a struct in a JSON response.
pub struct EngineKeypair {
    signing_key: SigningKey,
}

/// Public half of the engine key, safe to hand to collaborators.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnginePublicKey {
    bytes: [u8; 32],
}

/// An Ed25519 signature. Stored as `Vec<u8>` for serde; always 64 bytes when
/// produced by us, and anything else simply fails verification.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSignature {
    bytes: Vec<u8>,
}

impl EngineKeypair {
    /// Fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic keypair from a 32-byte seed. Tests and devnet only.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Load from a hex-encoded 32-byte secret, as written by `zkredit-node init`.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|_| KeyError::InvalidSecretKey)?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&seed))
    }

    /// Hex-encoded secret key. Handle with care.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn public_key(&self) -> EnginePublicKey {
        EnginePublicKey {
            bytes: self.signing_key.verifying_key().to_bytes(),
        }
    }

    /// Deterministic Ed25519 signature over `message`.
    pub fn sign(&self, message: &[u8]) -> EngineSignature {
        EngineSignature {
            bytes: self.signing_key.sign(message).to_bytes().to_vec(),
        }
    }

    pub fn verify(&self, message: &[u8], signature: &EngineSignature) -> bool {
        self.public_key().verify(message, signature)
    }
}

impl Clone for EngineKeypair {
    fn clone(&self) -> Self {
        Self::from_seed(&self.signing_key.to_bytes())
    }
}

impl fmt::Debug for EngineKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EngineKeypair(pub={})", self.public_key().to_hex())
    }
}

// ---------------------------------------------------------------------------
// EnginePublicKey
// ---------------------------------------------------------------------------

impl EnginePublicKey {
    /// Parses a hex public key and checks it is a valid curve point.
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let raw = hex::decode(s.trim()).map_err(|_| KeyError::InvalidPublicKey)?;
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidPublicKey)?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// `true` if `signature` is a valid signature over `message`.
    ///
    /// A boolean, not a `Result`: callers only ever want yes or no.
    pub fn verify(&self, message: &[u8], signature: &EngineSignature) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&self.bytes) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(signature.bytes.as_slice()) else {
            return false;
        };
        verifying_key
            .verify(message, &DalekSignature::from_bytes(&sig_bytes))
            .is_ok()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }
}

impl fmt::Display for EnginePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for EnginePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnginePublicKey({})", &self.to_hex()[..16])
    }
}

// ---------------------------------------------------------------------------
// EngineSignature
// ---------------------------------------------------------------------------

impl EngineSignature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// Parses a hex signature. Length is checked at verification time.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        Ok(Self {
            bytes: hex::decode(s)?,
        })
    }
}

impl fmt::Debug for EngineSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex_str = self.to_hex();
        let shown = hex_str.get(..16).unwrap_or(&hex_str);
        write!(f, "EngineSignature({shown}..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let kp = EngineKeypair::generate();
        let sig = kp.sign(b"authorize 90 on base");
        assert!(kp.verify(b"authorize 90 on base", &sig));
        assert!(!kp.verify(b"authorize 91 on base", &sig));
    }

    #[test]
    fn other_key_rejects() {
        let a = EngineKeypair::generate();
        let b = EngineKeypair::generate();
        let sig = a.sign(b"msg");
        assert!(!b.public_key().verify(b"msg", &sig));
    }

    #[test]
    fn hex_round_trip_keeps_identity() {
        let kp = EngineKeypair::generate();
        let restored = EngineKeypair::from_hex(&kp.secret_hex()).unwrap();
        assert_eq!(kp.public_key(), restored.public_key());

        let pk = EnginePublicKey::from_hex(&kp.public_key().to_hex()).unwrap();
        assert_eq!(pk, kp.public_key());
    }

    #[test]
    fn bad_hex_rejected() {
        assert!(matches!(
            EngineKeypair::from_hex("abcd"),
            Err(KeyError::InvalidSecretKey)
        ));
        assert!(EnginePublicKey::from_hex("zz").is_err());
    }

    #[test]
    fn truncated_signature_fails_quietly() {
        let kp = EngineKeypair::from_seed(&[7u8; 32]);
        let sig = EngineSignature::from_hex(&kp.sign(b"m").to_hex()[..64]).unwrap();
        assert!(!kp.verify(b"m", &sig));
    }

    #[test]
    fn debug_hides_secret() {
        let kp = EngineKeypair::from_seed(&[9u8; 32]);
        let dbg = format!("{kp:?}");
        assert!(!dbg.contains(&kp.secret_hex()));
    }
}
