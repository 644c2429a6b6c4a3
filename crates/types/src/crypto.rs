//! secp256k1 recoverable signatures.
//!
//! Protocol messages never carry the signer's identity explicitly: public
//! keys are recovered from the signatures over the message digest. Keys use
//! the secp256k1 curve with RFC 6979 deterministic nonces.

use crate::Digest;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use zeroize::Zeroize;

/// Errors from key handling and signature recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid public key encoding")]
    InvalidPublicKey,
    #[error("invalid signature encoding")]
    InvalidSignature,
    #[error("invalid private key")]
    InvalidPrivateKey,
    #[error("public key recovery failed")]
    RecoveryFailed,
    #[error("signing failed")]
    SigningFailed,
}

/// Signs digests on behalf of one identity.
///
/// Local keypairs adapt via [`KeyPair::provider`]; wallet-backed signers
/// supply their own closure. Providers may fail (a wallet can refuse), so
/// the result is surfaced rather than swallowed.
pub type SignatureProvider = Arc<dyn Fn(&Digest) -> Result<RecoverableSignature, CryptoError> + Send + Sync>;

/// Compressed secp256k1 public key (33 bytes).
#[serde_as]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(#[serde_as(as = "Bytes")] [u8; 33]);

impl PublicKey {
    /// Create from compressed SEC1 bytes (33 bytes, leading 0x02 or 0x03).
    pub fn from_bytes(bytes: [u8; 33]) -> Result<Self, CryptoError> {
        VerifyingKey::from_sec1_bytes(&bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self(bytes))
    }

    /// Raw compressed bytes.
    pub fn as_bytes(&self) -> &[u8; 33] {
        &self.0
    }

    fn from_verifying_key(key: &VerifyingKey) -> Self {
        let sec1 = key.to_sec1_bytes();
        let mut bytes = [0u8; 33];
        bytes.copy_from_slice(&sec1[..33]);
        Self(bytes)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..6]))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

/// ECDSA signature in `r||s` form plus the recovery id byte.
///
/// The recovery id lets the verifier recover the signer's public key from
/// the signed digest, so messages stay identity-free on the wire.
#[serde_as]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecoverableSignature {
    #[serde_as(as = "Bytes")]
    bytes: [u8; 64],
    recovery_id: u8,
}

impl RecoverableSignature {
    /// Reassemble from raw parts.
    pub fn from_parts(bytes: [u8; 64], recovery_id: u8) -> Self {
        Self { bytes, recovery_id }
    }

    /// Raw `r||s` bytes.
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.bytes
    }

    /// The recovery id byte.
    pub fn recovery_id(&self) -> u8 {
        self.recovery_id
    }

    /// Recover the public key that signed `digest`.
    pub fn recover(&self, digest: &Digest) -> Result<PublicKey, CryptoError> {
        let signature =
            Signature::from_slice(&self.bytes).map_err(|_| CryptoError::InvalidSignature)?;
        let recovery_id =
            RecoveryId::from_byte(self.recovery_id).ok_or(CryptoError::InvalidSignature)?;
        let key = VerifyingKey::recover_from_prehash(digest.as_bytes(), &signature, recovery_id)
            .map_err(|_| CryptoError::RecoveryFailed)?;
        Ok(PublicKey::from_verifying_key(&key))
    }
}

impl fmt::Debug for RecoverableSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RecoverableSignature({}…, v={})",
            hex::encode(&self.bytes[..6]),
            self.recovery_id
        )
    }
}

/// secp256k1 keypair for signing protocol messages.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a random keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut rand::thread_rng()),
        }
    }

    /// Create from secret key bytes (32 bytes).
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let signing_key =
            SigningKey::from_bytes(bytes.into()).map_err(|_| CryptoError::InvalidPrivateKey)?;
        Ok(Self { signing_key })
    }

    /// Deterministic keypair from a seed; test and tooling convenience.
    pub fn from_seed(seed: u8) -> Self {
        let mut bytes = [seed; 32];
        // secret scalars must be non-zero
        bytes[31] |= 1;
        Self::from_bytes(&bytes).expect("seeded scalar is valid")
    }

    /// The corresponding public key (compressed, 33 bytes).
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_verifying_key(self.signing_key.verifying_key())
    }

    /// Sign a digest, producing a recoverable signature.
    pub fn sign(&self, digest: &Digest) -> Result<RecoverableSignature, CryptoError> {
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(digest.as_bytes())
            .map_err(|_| CryptoError::SigningFailed)?;
        Ok(RecoverableSignature {
            bytes: signature.to_bytes().into(),
            recovery_id: recovery_id.to_byte(),
        })
    }

    /// Adapt this keypair into a [`SignatureProvider`].
    pub fn provider(&self) -> SignatureProvider {
        let keypair = self.clone();
        Arc::new(move |digest: &Digest| keypair.sign(digest))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        let mut bytes: [u8; 32] = self.signing_key.to_bytes().into();
        bytes.zeroize();
    }
}
