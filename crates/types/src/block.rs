//! Block identity.

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// Monotonic block number within the underlying chain.
pub type BlockNum = u32;

/// Opaque block identifier.
///
/// The underlying chain embeds the block number big-endian in the leading
/// four bytes of the id; the rest is hash material. The gadget never
/// interprets the suffix, it only reads the number back out.
#[serde_as]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(#[serde_as(as = "Bytes")] [u8; 32]);

impl BlockId {
    /// The all-zero id (block number 0); used for fresh roots.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Wrap raw id bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Build an id for `num` with a hash suffix derived from `seed`.
    ///
    /// This is how the host chain mints ids; it is also handy in tests for
    /// minting distinct ids (same number, different seed) on forks.
    pub fn for_num(num: BlockNum, seed: &[u8]) -> Self {
        let mut bytes = [0u8; 32];
        bytes[..4].copy_from_slice(&num.to_be_bytes());
        let mut hasher = Sha256::new();
        hasher.update(seed);
        let suffix: [u8; 32] = hasher.finalize().into();
        bytes[4..].copy_from_slice(&suffix[..28]);
        Self(bytes)
    }

    /// The block number embedded in the leading bytes.
    pub fn number(&self) -> BlockNum {
        let mut num = [0u8; 4];
        num.copy_from_slice(&self.0[..4]);
        BlockNum::from_be_bytes(num)
    }

    /// Raw id bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Default for BlockId {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.number(), hex::encode(&self.0[4..10]))
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({}:{})", self.number(), hex::encode(&self.0[4..10]))
    }
}
