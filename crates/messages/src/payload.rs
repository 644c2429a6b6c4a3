//! Protocol payloads.

use crate::envelope::MessagePayload;
use crate::{PrecommitMessage, PrevoteMessage};
use granite_types::BlockId;
use serde::{Deserialize, Serialize};

fn write_block_id(out: &mut Vec<u8>, id: &BlockId) {
    out.extend_from_slice(id.as_bytes());
}

fn write_block_ids(out: &mut Vec<u8>, ids: &[BlockId]) {
    out.extend_from_slice(&(ids.len() as u32).to_le_bytes());
    for id in ids {
        write_block_id(out, id);
    }
}

/// Handshake sent to a fresh peer, announcing the local last irreversible
/// block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub lib: BlockId,
}

impl MessagePayload for Handshake {
    const TYPE_TAG: &'static str = "granite.handshake";

    fn write_bytes(&self, out: &mut Vec<u8>) {
        write_block_id(out, &self.lib);
    }
}

/// Reply to a [`Handshake`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAns {
    pub lib: BlockId,
}

impl MessagePayload for HandshakeAns {
    const TYPE_TAG: &'static str = "granite.handshake_ans";

    fn write_bytes(&self, out: &mut Vec<u8>) {
        write_block_id(out, &self.lib);
    }
}

/// First-phase vote: the voter supports the branch running from just after
/// `base_block` through `blocks` (in parent-to-child order).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prevote {
    pub round_num: u32,
    pub base_block: BlockId,
    pub blocks: Vec<BlockId>,
}

impl MessagePayload for Prevote {
    const TYPE_TAG: &'static str = "granite.prevote";

    fn write_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.round_num.to_le_bytes());
        write_block_id(out, &self.base_block);
        write_block_ids(out, &self.blocks);
    }
}

/// Second-phase vote: the voter is willing to finalize `block_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Precommit {
    pub round_num: u32,
    pub block_id: BlockId,
}

impl MessagePayload for Precommit {
    const TYPE_TAG: &'static str = "granite.precommit";

    fn write_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.round_num.to_le_bytes());
        write_block_id(out, &self.block_id);
    }
}

/// Announcement that a finality proof exists for `round_num`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalityNotice {
    pub round_num: u32,
    pub best_block: BlockId,
}

impl MessagePayload for FinalityNotice {
    const TYPE_TAG: &'static str = "granite.finality_notice";

    fn write_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.round_num.to_le_bytes());
        write_block_id(out, &self.best_block);
    }
}

/// Request for the proof of `round_num`, sent back to a noticing peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalityReqProof {
    pub round_num: u32,
}

impl MessagePayload for FinalityReqProof {
    const TYPE_TAG: &'static str = "granite.finality_req_proof";

    fn write_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.round_num.to_le_bytes());
    }
}

/// The finality certificate: a round's best block together with the
/// supermajority of prevotes and precommits that finalized it.
///
/// Assembled incrementally by the round (prevotes at the prevote boundary,
/// precommits as they arrive) and shipped whole to lagging peers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub round_num: u32,
    pub best_block: BlockId,
    pub prevotes: Vec<PrevoteMessage>,
    pub precommits: Vec<PrecommitMessage>,
}

impl MessagePayload for Proof {
    const TYPE_TAG: &'static str = "granite.proof";

    fn write_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.round_num.to_le_bytes());
        write_block_id(out, &self.best_block);
        out.extend_from_slice(&(self.prevotes.len() as u32).to_le_bytes());
        for prevote in &self.prevotes {
            prevote.data.write_bytes(out);
            for signature in &prevote.signatures {
                out.extend_from_slice(signature.as_bytes());
                out.push(signature.recovery_id());
            }
        }
        out.extend_from_slice(&(self.precommits.len() as u32).to_le_bytes());
        for precommit in &self.precommits {
            precommit.data.write_bytes(out);
            for signature in &precommit.signatures {
                out.extend_from_slice(signature.as_bytes());
                out.push(signature.recovery_id());
            }
        }
    }
}
