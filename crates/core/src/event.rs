//! Inputs to the engine.

use granite_messages::NetMessage;
use granite_types::{BlockId, PublicKey};
use std::collections::BTreeSet;
use std::time::Instant;

/// Transport session identifier for a connected peer.
pub type SessionId = u32;

/// Events from the underlying block-production engine.
///
/// Events are passive data describing something that already happened; the
/// engine reacts, it never steers the chain.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// The chain accepted a block.
    AcceptedBlock {
        block_id: BlockId,
        prev_block_id: BlockId,
        /// Producer that signed the block.
        creator_key: PublicKey,
        /// Keys of the producers expected to vote on this block.
        active_bp_keys: BTreeSet<PublicKey>,
        /// True while the node is replaying blocks from peers.
        sync: bool,
    },

    /// The host chain advanced its own irreversibility lower bound.
    Irreversible { block_id: BlockId },

    /// A transport session to a new peer opened.
    NewPeer { ses_id: SessionId },
}

/// A protocol message as the transport delivers (or is asked to send) it.
#[derive(Debug, Clone)]
pub struct NetEnvelope {
    pub ses_id: SessionId,
    pub data: NetMessage,
    /// When the transport received the message; stale envelopes are
    /// dropped before dispatch.
    pub receive_time: Instant,
}

impl NetEnvelope {
    /// Wrap `data` stamped with the current instant.
    pub fn now(ses_id: SessionId, data: NetMessage) -> Self {
        Self {
            ses_id,
            data,
            receive_time: Instant::now(),
        }
    }
}

/// Everything the engine consumes, in arrival order.
#[derive(Debug, Clone)]
pub enum EngineMessage {
    Net(NetEnvelope),
    Event(ChainEvent),
}
