//! Round implementation.

use granite_messages::{
    Precommit, PrecommitMessage, Prevote, PrevoteMessage, Proof, SignedMessage,
};
use granite_tree::PrefixTree;
use granite_types::{BlockId, PublicKey, SignatureProvider};
use std::collections::BTreeSet;
use tracing::{debug, error, warn};

/// Phases of a voting round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    Init,
    Prevote,
    ReadyToPrecommit,
    Precommit,
    Done,
    Fail,
}

/// Side effects requested by the round; the engine executes them.
///
/// The round never talks to the network itself, which keeps it
/// deterministic and directly testable.
#[derive(Debug, Clone)]
pub enum RoundAction {
    BroadcastPrevote(PrevoteMessage),
    BroadcastPrecommit(PrecommitMessage),
    /// The precommit supermajority arrived; the round is done.
    Completed,
}

/// A single prevote/precommit cycle.
pub struct Round {
    num: u32,
    /// Producer whose last block seeds the prevote branch.
    primary: PublicKey,
    state: RoundState,
    proof: Proof,
    /// Subtree root at the prevote threshold; `Some` from
    /// `ready_to_precommit` onward.
    best_node: Option<BlockId>,
    providers: Vec<SignatureProvider>,
    prevoted_keys: BTreeSet<PublicKey>,
    precommited_keys: BTreeSet<PublicKey>,
}

impl Round {
    /// Create the round and immediately run the prevote phase against the
    /// current tree.
    pub fn start(
        num: u32,
        primary: PublicKey,
        providers: Vec<SignatureProvider>,
        tree: &mut PrefixTree,
    ) -> (Self, Vec<RoundAction>) {
        let mut round = Self {
            num,
            primary,
            state: RoundState::Init,
            proof: Proof::default(),
            best_node: None,
            providers,
            prevoted_keys: BTreeSet::new(),
            precommited_keys: BTreeSet::new(),
        };
        debug!(round = num, primary = %primary, "round started");
        let actions = round.prevote(tree);
        (round, actions)
    }

    pub fn num(&self) -> u32 {
        self.num
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    /// Mark the round done; used when a valid external proof settles it.
    pub fn set_done(&mut self) {
        self.state = RoundState::Done;
    }

    /// The assembled proof; `Some` only once the round is done.
    pub fn proof(&self) -> Option<&Proof> {
        (self.state == RoundState::Done).then_some(&self.proof)
    }

    /// Voters whose prevotes this round has accepted.
    pub fn prevoted_keys(&self) -> &BTreeSet<PublicKey> {
        &self.prevoted_keys
    }

    /// Voters whose precommits this round has accepted.
    pub fn precommited_keys(&self) -> &BTreeSet<PublicKey> {
        &self.precommited_keys
    }

    /// Ingest a prevote message, validating each signature independently
    /// and recording the valid ones.
    pub fn on_prevote(&mut self, tree: &mut PrefixTree, msg: &PrevoteMessage) -> Vec<RoundAction> {
        if !matches!(self.state, RoundState::Prevote | RoundState::ReadyToPrecommit) {
            debug!(round = self.num, state = ?self.state, "skipping prevote");
            return Vec::new();
        }

        let keys = match msg.public_keys() {
            Ok(keys) => keys,
            Err(err) => {
                debug!(round = self.num, %err, "dropping prevote with unrecoverable keys");
                return Vec::new();
            }
        };

        // a message may aggregate several voters; validate and record each
        // signature as its own single-key prevote
        for (signature, key) in msg.signatures.iter().zip(keys) {
            if !self.validate_prevote(tree, &msg.data, &key) {
                debug!(round = self.num, voter = %key, "invalid prevote");
                continue;
            }
            let single = SignedMessage::with_signature(msg.data.clone(), *signature);
            self.add_prevote(tree, single, key);
        }
        Vec::new()
    }

    /// Ingest a precommit message; may complete the round.
    pub fn on_precommit(&mut self, tree: &PrefixTree, msg: &PrecommitMessage) -> Vec<RoundAction> {
        if !matches!(self.state, RoundState::ReadyToPrecommit | RoundState::Precommit) {
            debug!(round = self.num, state = ?self.state, "skipping precommit");
            return Vec::new();
        }

        let keys = match msg.public_keys() {
            Ok(keys) => keys,
            Err(err) => {
                debug!(round = self.num, %err, "dropping precommit with unrecoverable keys");
                return Vec::new();
            }
        };

        let mut actions = Vec::new();
        for (signature, key) in msg.signatures.iter().zip(keys) {
            if !self.validate_precommit(tree, &msg.data, &key) {
                debug!(round = self.num, voter = %key, "invalid precommit");
                continue;
            }
            let single = SignedMessage::with_signature(msg.data.clone(), *signature);
            self.add_precommit(tree, single, key, &mut actions);
        }
        actions
    }

    /// Close the prevote window. Fails the round unless the prevote
    /// threshold was reached; otherwise seeds the proof and moves into the
    /// precommit phase.
    pub fn end_prevote(&mut self, tree: &mut PrefixTree) -> Vec<RoundAction> {
        if self.state != RoundState::ReadyToPrecommit {
            debug!(round = self.num, state = ?self.state, "round failed at prevote boundary");
            self.state = RoundState::Fail;
            return Vec::new();
        }

        let best = self.best_node.expect("best node is set in ready_to_precommit");
        self.proof.round_num = self.num;
        self.proof.best_block = best;
        self.proof.prevotes = tree
            .find(&best)
            .expect("best node is in the tree")
            .confirmation_data
            .values()
            .cloned()
            .collect();

        debug!(
            round = self.num,
            best_block = %best,
            prevotes = self.proof.prevotes.len(),
            "prevote finished"
        );
        self.precommit(tree)
    }

    /// Final gate: true if the round completed, otherwise mark it failed.
    pub fn finish(&mut self) -> bool {
        if self.state != RoundState::Done {
            debug!(round = self.num, state = ?self.state, "round failed");
            self.state = RoundState::Fail;
            return false;
        }
        true
    }

    fn prevote(&mut self, tree: &mut PrefixTree) -> Vec<RoundAction> {
        assert_eq!(self.state, RoundState::Init, "prevote requires the init state");
        self.state = RoundState::Prevote;

        let Some(last_node) = tree.last_inserted_by(&self.primary) else {
            warn!(round = self.num, primary = %self.primary, "no block from primary in tree");
            return Vec::new();
        };
        let (base_block, blocks) = tree
            .get_branch(&last_node.block_id)
            .expect("last inserted node has a branch");

        let data = Prevote {
            round_num: self.num,
            base_block,
            blocks,
        };

        for provider in self.providers.clone() {
            match SignedMessage::new(data.clone(), std::slice::from_ref(&provider)) {
                Ok(msg) => match msg.public_keys() {
                    Ok(keys) => self.add_prevote(tree, msg, keys[0]),
                    Err(err) => error!(round = self.num, %err, "own prevote key recovery failed"),
                },
                Err(err) => error!(round = self.num, %err, "signing own prevote failed"),
            }
        }

        match SignedMessage::new(data, &self.providers) {
            Ok(msg) => vec![RoundAction::BroadcastPrevote(msg)],
            Err(err) => {
                error!(round = self.num, %err, "signing prevote broadcast failed");
                Vec::new()
            }
        }
    }

    fn precommit(&mut self, tree: &PrefixTree) -> Vec<RoundAction> {
        assert_eq!(
            self.state,
            RoundState::ReadyToPrecommit,
            "precommit requires the ready_to_precommit state"
        );
        self.state = RoundState::Precommit;

        let best = self.best_node.expect("best node is set in ready_to_precommit");
        let data = Precommit {
            round_num: self.num,
            block_id: best,
        };

        let mut actions = Vec::new();
        for provider in self.providers.clone() {
            match SignedMessage::new(data.clone(), std::slice::from_ref(&provider)) {
                Ok(msg) => match msg.public_keys() {
                    Ok(keys) => {
                        let key = keys[0];
                        self.add_precommit(tree, msg, key, &mut actions);
                    }
                    Err(err) => error!(round = self.num, %err, "own precommit key recovery failed"),
                },
                Err(err) => error!(round = self.num, %err, "signing own precommit failed"),
            }
        }

        match SignedMessage::new(data, &self.providers) {
            Ok(msg) => actions.push(RoundAction::BroadcastPrecommit(msg)),
            Err(err) => error!(round = self.num, %err, "signing precommit broadcast failed"),
        }
        actions
    }

    fn add_prevote(&mut self, tree: &mut PrefixTree, msg: PrevoteMessage, key: PublicKey) {
        assert_eq!(msg.signatures.len(), 1, "prevote must carry exactly one signature");

        let data = msg.data.clone();
        let node = tree
            .add_confirmations(&data.base_block, &data.blocks, key, msg)
            .expect("prevote target was resolved during validation");

        self.prevoted_keys.insert(key);
        debug!(
            round = self.num,
            voter = %key,
            confirmations = tree.confirmation_number(&node),
            "prevote recorded"
        );

        if self.state != RoundState::ReadyToPrecommit && prevote_threshold_reached(tree, &node) {
            self.state = RoundState::ReadyToPrecommit;
            self.best_node = Some(node);
            debug!(round = self.num, best_block = %node, "prevote threshold reached");
        }
    }

    fn add_precommit(
        &mut self,
        tree: &PrefixTree,
        msg: PrecommitMessage,
        key: PublicKey,
        actions: &mut Vec<RoundAction>,
    ) {
        assert_eq!(msg.signatures.len(), 1, "precommit must carry exactly one signature");

        self.precommited_keys.insert(key);
        self.proof.precommits.push(msg);
        debug!(round = self.num, voter = %key, "precommit recorded");

        if self.state != RoundState::Done && self.precommit_threshold_reached(tree) {
            debug!(
                round = self.num,
                best_block = %self.proof.best_block,
                "precommit threshold reached"
            );
            self.state = RoundState::Done;
            actions.push(RoundAction::Completed);
        }
    }

    fn validate_prevote(&self, tree: &PrefixTree, data: &Prevote, key: &PublicKey) -> bool {
        if data.round_num != self.num {
            debug!(
                round = self.num,
                received = data.round_num,
                "prevote for a different round"
            );
            return false;
        }
        if self.prevoted_keys.contains(key) {
            debug!(round = self.num, voter = %key, "repeated prevote");
            return false;
        }
        let Some(node_id) = tree.find_last_node(&data.base_block, &data.blocks) else {
            debug!(round = self.num, "prevote for unknown blocks");
            return false;
        };
        let node = tree.find(&node_id).expect("resolved node is in the tree");
        if !node.active_bp_keys.contains(key) {
            debug!(round = self.num, block = %node_id, voter = %key, "prevote from an inactive producer");
            return false;
        }
        true
    }

    fn validate_precommit(&self, tree: &PrefixTree, data: &Precommit, key: &PublicKey) -> bool {
        if data.round_num != self.num {
            debug!(
                round = self.num,
                received = data.round_num,
                "precommit for a different round"
            );
            return false;
        }
        if self.precommited_keys.contains(key) {
            debug!(round = self.num, voter = %key, "repeated precommit");
            return false;
        }
        let best = self.best_node.expect("state gate implies a best node");
        if data.block_id != best {
            debug!(round = self.num, block = %data.block_id, best_block = %best, "precommit for a non-best block");
            return false;
        }
        // a precommit is only valid from a voter that prevoted the best node
        let node = tree.find(&best).expect("best node is in the tree");
        if !node.has_confirmation(key) {
            debug!(round = self.num, block = %best, voter = %key, "precommit without a prevote");
            return false;
        }
        true
    }

    fn precommit_threshold_reached(&self, tree: &PrefixTree) -> bool {
        let best = self.best_node.expect("state gate implies a best node");
        let node = tree.find(&best).expect("best node is in the tree");
        self.proof.precommits.len() > node.active_bp_keys.len() * 2 / 3
    }
}

fn prevote_threshold_reached(tree: &PrefixTree, node_id: &BlockId) -> bool {
    let node = tree.find(node_id).expect("threshold checks a resolved node");
    tree.confirmation_number(node_id) > node.active_bp_keys.len() * 2 / 3
}
