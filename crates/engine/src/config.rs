//! Engine identity configuration.

use granite_types::{KeyPair, PublicKey, SignatureProvider};
use thiserror::Error;

/// Errors from engine construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("number of signature providers and number of public keys differ")]
    ProviderKeyMismatch,
    #[error("a block producer needs at least one signature provider")]
    NoProviders,
}

/// Who this node is, fixed at construction.
///
/// A full node observes and relays but never votes; it signs handshakes
/// with a random ephemeral key and keeps that key for its whole lifetime.
/// A block producer votes with its registered providers whenever one of its
/// keys is active. There is no switching between the modes after
/// construction.
pub enum IdentityMode {
    /// Observe-only node with a random ephemeral key.
    FullNode,
    /// Voting node. `providers[i]` must sign for `public_keys[i]`.
    BlockProducer {
        providers: Vec<SignatureProvider>,
        public_keys: Vec<PublicKey>,
    },
}

impl IdentityMode {
    /// Convenience constructor for a producer backed by local keypairs.
    pub fn producer_from_keypairs(keypairs: &[KeyPair]) -> Self {
        IdentityMode::BlockProducer {
            providers: keypairs.iter().map(KeyPair::provider).collect(),
            public_keys: keypairs.iter().map(KeyPair::public_key).collect(),
        }
    }
}
