//! Wire messages for the finality protocol.
//!
//! Every protocol message is a payload wrapped in a [`SignedMessage`]
//! envelope carrying one or more recoverable signatures over the payload's
//! domain-tagged digest. Signer identity is never shipped explicitly; it is
//! recovered from the signatures.
//!
//! [`NetMessage`] is the tagged union the transport moves around; the
//! engine dispatches on its variant.

mod envelope;
mod payload;

pub use envelope::{MessagePayload, SignedMessage};
pub use payload::{
    FinalityNotice, FinalityReqProof, Handshake, HandshakeAns, Precommit, Prevote, Proof,
};

use granite_types::Digest;
use serde::{Deserialize, Serialize};

/// Handshake announcing the sender's last irreversible block.
pub type HandshakeMessage = SignedMessage<Handshake>;
/// Reply to a [`HandshakeMessage`].
pub type HandshakeAnsMessage = SignedMessage<HandshakeAns>;
/// First-phase vote.
pub type PrevoteMessage = SignedMessage<Prevote>;
/// Second-phase vote.
pub type PrecommitMessage = SignedMessage<Precommit>;
/// Finality certificate.
pub type ProofMessage = SignedMessage<Proof>;
/// Announcement that a proof exists for a round.
pub type FinalityNoticeMessage = SignedMessage<FinalityNotice>;
/// Request for the proof of a round.
pub type FinalityReqProofMessage = SignedMessage<FinalityReqProof>;

/// The protocol message union carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetMessage {
    Handshake(HandshakeMessage),
    HandshakeAns(HandshakeAnsMessage),
    Prevote(PrevoteMessage),
    Precommit(PrecommitMessage),
    Proof(Box<ProofMessage>),
    FinalityNotice(FinalityNoticeMessage),
    FinalityReqProof(FinalityReqProofMessage),
}

impl NetMessage {
    /// Human-readable name of the message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            NetMessage::Handshake(_) => "Handshake",
            NetMessage::HandshakeAns(_) => "HandshakeAns",
            NetMessage::Prevote(_) => "Prevote",
            NetMessage::Precommit(_) => "Precommit",
            NetMessage::Proof(_) => "Proof",
            NetMessage::FinalityNotice(_) => "FinalityNotice",
            NetMessage::FinalityReqProof(_) => "FinalityReqProof",
        }
    }

    /// Dedup key covering payload and signatures.
    pub fn dedup_digest(&self) -> Digest {
        match self {
            NetMessage::Handshake(msg) => msg.dedup_digest(),
            NetMessage::HandshakeAns(msg) => msg.dedup_digest(),
            NetMessage::Prevote(msg) => msg.dedup_digest(),
            NetMessage::Precommit(msg) => msg.dedup_digest(),
            NetMessage::Proof(msg) => msg.dedup_digest(),
            NetMessage::FinalityNotice(msg) => msg.dedup_digest(),
            NetMessage::FinalityReqProof(msg) => msg.dedup_digest(),
        }
    }

    /// Whether this is a round-phase (prevote/precommit) message.
    pub fn is_round_phase(&self) -> bool {
        matches!(self, NetMessage::Prevote(_) | NetMessage::Precommit(_))
    }
}
