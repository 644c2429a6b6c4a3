//! The signed message envelope.

use granite_types::{CryptoError, Digest, PublicKey, RecoverableSignature, SignatureProvider};
use serde::{Deserialize, Serialize};

/// A payload carried inside a [`SignedMessage`].
///
/// Each payload renders itself into a domain-tagged byte string; the SHA-256
/// of those bytes is what providers sign and what keys are recovered
/// against. The tag keeps signatures from being replayed across message
/// types that happen to share an encoding.
pub trait MessagePayload {
    /// Domain tag mixed into the digest, unique per payload type.
    const TYPE_TAG: &'static str;

    /// Append the payload encoding to `out`.
    fn write_bytes(&self, out: &mut Vec<u8>);

    /// The signing digest for this payload.
    fn digest(&self) -> Digest {
        let mut bytes = Vec::with_capacity(128);
        bytes.extend_from_slice(Self::TYPE_TAG.as_bytes());
        bytes.push(b':');
        self.write_bytes(&mut bytes);
        Digest::hash(&bytes)
    }
}

/// A payload plus one or more recoverable signatures over its digest.
///
/// A message may aggregate the signatures of several local identities; the
/// receiving side validates each signature independently and decomposes the
/// message into single-signature copies for bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMessage<T> {
    pub data: T,
    pub signatures: Vec<RecoverableSignature>,
}

impl<T: MessagePayload> SignedMessage<T> {
    /// Sign `data` once per provider.
    pub fn new(data: T, providers: &[SignatureProvider]) -> Result<Self, CryptoError> {
        let digest = data.digest();
        let signatures = providers
            .iter()
            .map(|provider| (**provider)(&digest))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { data, signatures })
    }

    /// Wrap `data` with a single pre-made signature.
    ///
    /// Used when decomposing a multi-signature message into per-voter
    /// copies.
    pub fn with_signature(data: T, signature: RecoverableSignature) -> Self {
        Self {
            data,
            signatures: vec![signature],
        }
    }

    /// The signing digest of the payload.
    pub fn digest(&self) -> Digest {
        self.data.digest()
    }

    /// Dedup key covering the payload *and* the signatures, so the same
    /// vote signed by different identities gossips independently.
    pub fn dedup_digest(&self) -> Digest {
        let mut bytes = Vec::with_capacity(128 + self.signatures.len() * 65);
        bytes.extend_from_slice(T::TYPE_TAG.as_bytes());
        bytes.push(b':');
        self.data.write_bytes(&mut bytes);
        for signature in &self.signatures {
            bytes.extend_from_slice(signature.as_bytes());
            bytes.push(signature.recovery_id());
        }
        Digest::hash(&bytes)
    }

    /// Recover the signer key of each signature, in signature order.
    pub fn public_keys(&self) -> Result<Vec<PublicKey>, CryptoError> {
        let digest = self.data.digest();
        self.signatures
            .iter()
            .map(|signature| signature.recover(&digest))
            .collect()
    }
}
