//! Engine implementation.

use crate::config::{EngineError, IdentityMode};
use granite_core::{ChainEvent, EngineMessage, FinalityChannel, NetChannel, NetEnvelope, SessionId};
use granite_messages::{
    FinalityNotice, FinalityNoticeMessage, FinalityReqProof, FinalityReqProofMessage, Handshake,
    HandshakeAns, HandshakeAnsMessage, HandshakeMessage, NetMessage, Precommit, PrecommitMessage,
    Prevote, PrevoteMessage, Proof, ProofMessage,
};
use granite_round::{Round, RoundAction, RoundState};
use granite_tree::PrefixTree;
use granite_types::{BlockId, BlockNum, Digest, KeyPair, PublicKey, SignatureProvider};
use lru::LruCache;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Blocks per voting round.
pub const ROUND_WIDTH: u32 = 2;
/// Blocks in the prevote window at the start of a round.
pub const PREVOTE_WIDTH: u32 = 1;
/// Network messages older than this are dropped before dispatch.
pub const MSG_EXPIRATION: Duration = Duration::from_millis(1000);
/// 2/3 of 102 producers, 12 blocks per slot, 2 rounds, doubled for margin.
/// When finality lags production by more than this, the gadget freezes.
pub const MAX_FINALITY_LAG_BLOCKS: u32 = 69 * 12 * 2 * 2;

/// Finished proofs kept so lagging peers can still request them.
const PROOF_CACHE_SIZE: usize = 2;
/// Capacity of each message dedup cache.
const MESSAGE_CACHE_SIZE: usize = 1_000_000;

// The subtraction wraps for a genesis id (block number 0), mapping it to an
// out-of-range round near 2^31 that never matches a real round number.
// Rounds are only scheduled for block numbers >= 1.
fn round_num_for(block_id: &BlockId) -> u32 {
    block_id.number().wrapping_sub(1) / ROUND_WIDTH
}

fn num_in_round_for(block_id: &BlockId) -> u32 {
    block_id.number().wrapping_sub(1) % ROUND_WIDTH
}

/// The finality gadget's round manager.
///
/// Owns the prefix tree, the active round, the peer table and all caches.
/// Everything runs on whichever single thread calls
/// [`Engine::process_message`]; outputs leave through the out-net and
/// finality channels.
pub struct Engine {
    providers: Vec<SignatureProvider>,
    public_keys: Vec<PublicKey>,
    providers_by_key: BTreeMap<PublicKey, SignatureProvider>,
    is_block_producer: bool,

    tree: PrefixTree,
    round: Option<Round>,
    /// Last irreversible block; always the tree root.
    lib: BlockId,
    last_proved_block_num: BlockNum,

    peers: BTreeMap<PublicKey, SessionId>,
    /// Round-phase messages already handled locally.
    self_messages: LruCache<Digest, ()>,
    /// Messages already forwarded to peers.
    peer_messages: LruCache<Digest, ()>,
    /// Proofs of recently finished rounds, newest first.
    last_proofs: VecDeque<Proof>,

    is_syncing: bool,
    /// Sticky: set when finality lag exceeds the limit, never cleared.
    is_frozen: bool,

    out_net: Arc<NetChannel>,
    finality: Arc<FinalityChannel>,
}

impl Engine {
    /// Build an engine over `tree`, whose root is the current last
    /// irreversible block.
    pub fn new(
        mode: IdentityMode,
        tree: PrefixTree,
        out_net: Arc<NetChannel>,
        finality: Arc<FinalityChannel>,
    ) -> Result<Self, EngineError> {
        let (providers, public_keys, is_block_producer) = match mode {
            IdentityMode::FullNode => {
                let ephemeral = KeyPair::generate();
                (vec![ephemeral.provider()], Vec::new(), false)
            }
            IdentityMode::BlockProducer {
                providers,
                public_keys,
            } => {
                if providers.len() != public_keys.len() {
                    return Err(EngineError::ProviderKeyMismatch);
                }
                if providers.is_empty() {
                    return Err(EngineError::NoProviders);
                }
                (providers, public_keys, true)
            }
        };

        let providers_by_key = public_keys
            .iter()
            .copied()
            .zip(providers.iter().cloned())
            .collect();

        let cache_size = NonZeroUsize::new(MESSAGE_CACHE_SIZE).expect("cache size is non-zero");
        let lib = tree.root_id();
        Ok(Self {
            providers,
            public_keys,
            providers_by_key,
            is_block_producer,
            tree,
            round: None,
            lib,
            last_proved_block_num: 0,
            peers: BTreeMap::new(),
            self_messages: LruCache::new(cache_size),
            peer_messages: LruCache::new(cache_size),
            last_proofs: VecDeque::with_capacity(PROOF_CACHE_SIZE),
            is_syncing: false,
            is_frozen: false,
            out_net,
            finality,
        })
    }

    /// The last irreversible block as this engine sees it.
    pub fn lib(&self) -> BlockId {
        self.lib
    }

    /// Block number of the newest locally gained or accepted proof.
    pub fn last_proved_block_num(&self) -> BlockNum {
        self.last_proved_block_num
    }

    /// Whether the node is replaying blocks from peers.
    pub fn is_syncing(&self) -> bool {
        self.is_syncing
    }

    /// Whether the gadget froze because finality lagged too far.
    pub fn is_frozen(&self) -> bool {
        self.is_frozen
    }

    /// The fork view.
    pub fn tree(&self) -> &PrefixTree {
        &self.tree
    }

    /// State of the active round, if one exists.
    pub fn round_state(&self) -> Option<RoundState> {
        self.round.as_ref().map(Round::state)
    }

    /// Number of the active round, if one exists.
    pub fn current_round_num(&self) -> Option<u32> {
        self.round.as_ref().map(Round::num)
    }

    /// Registered peer sessions by public key.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// The public keys this node can vote with (empty for a full node).
    pub fn public_keys(&self) -> &[PublicKey] {
        &self.public_keys
    }

    /// Process one input. The single entry point for both modes: the
    /// worker thread calls it in asynchronous mode, the host calls it
    /// directly in synchronous mode.
    pub fn process_message(&mut self, message: EngineMessage) {
        match message {
            EngineMessage::Net(envelope) => self.process_net_msg(envelope),
            EngineMessage::Event(event) => self.process_event(event),
        }
    }

    fn process_net_msg(&mut self, envelope: NetEnvelope) {
        let age = envelope.receive_time.elapsed();
        if age > MSG_EXPIRATION {
            debug!(age_ms = age.as_millis() as u64, "network message expired");
            return;
        }

        let ses_id = envelope.ses_id;
        match &envelope.data {
            NetMessage::Prevote(msg) => self.on_prevote(msg),
            NetMessage::Precommit(msg) => self.on_precommit(msg),
            NetMessage::FinalityNotice(msg) => self.on_finality_notice(ses_id, msg),
            NetMessage::FinalityReqProof(msg) => self.on_finality_req_proof(ses_id, msg),
            NetMessage::Proof(msg) => self.on_proof(msg),
            NetMessage::Handshake(msg) => self.on_handshake(ses_id, msg),
            NetMessage::HandshakeAns(msg) => self.on_handshake_ans(ses_id, msg),
        }
    }

    fn process_event(&mut self, event: ChainEvent) {
        match event {
            ChainEvent::AcceptedBlock {
                block_id,
                prev_block_id,
                creator_key,
                active_bp_keys,
                sync,
            } => self.on_accepted_block(block_id, prev_block_id, creator_key, active_bp_keys, sync),
            ChainEvent::Irreversible { block_id } => self.on_irreversible(block_id),
            ChainEvent::NewPeer { ses_id } => self.on_new_peer(ses_id),
        }
    }

    // ───────────────────────── network handlers ─────────────────────────

    fn on_prevote(&mut self, msg: &PrevoteMessage) {
        if !self.gate_round_msg(&NetMessage::Prevote(msg.clone()), msg.data.round_num) {
            return;
        }
        let Some(round) = self.round.as_mut() else {
            debug!("no active round for prevote");
            return;
        };
        let actions = round.on_prevote(&mut self.tree, msg);
        self.run_round_actions(actions);
    }

    fn on_precommit(&mut self, msg: &PrecommitMessage) {
        if !self.gate_round_msg(&NetMessage::Precommit(msg.clone()), msg.data.round_num) {
            return;
        }
        let Some(round) = self.round.as_mut() else {
            debug!("no active round for precommit");
            return;
        };
        let actions = round.on_precommit(&self.tree, msg);
        self.run_round_actions(actions);
    }

    fn on_finality_notice(&mut self, ses_id: SessionId, msg: &FinalityNoticeMessage) {
        let data = &msg.data;
        debug!(block = %data.best_block, round = data.round_num, "finality notice received");

        if self.is_active_bp(&data.best_block)
            && data.best_block.number() <= self.last_proved_block_num
        {
            debug!("already proved at or above the noticed block");
            return;
        }

        let request = FinalityReqProof {
            round_num: data.round_num,
        };
        match FinalityReqProofMessage::new(request, &self.providers) {
            Ok(request) => self.send(ses_id, NetMessage::FinalityReqProof(request)),
            Err(err) => error!(%err, "signing proof request failed"),
        }
    }

    fn on_finality_req_proof(&mut self, ses_id: SessionId, msg: &FinalityReqProofMessage) {
        let round_num = msg.data.round_num;
        debug!(round = round_num, "proof requested");

        let Some(proof) = self
            .last_proofs
            .iter()
            .find(|proof| proof.round_num == round_num)
            .cloned()
        else {
            return;
        };

        debug!(round = round_num, "proof found; sending it");
        match ProofMessage::new(proof, &self.providers) {
            Ok(reply) => self.send(ses_id, NetMessage::Proof(Box::new(reply))),
            Err(err) => error!(%err, "signing proof reply failed"),
        }
    }

    fn on_proof(&mut self, msg: &ProofMessage) {
        let proof = &msg.data;
        debug!(round = proof.round_num, block = %proof.best_block, "proof received");

        if self.is_syncing || self.is_frozen {
            debug!("skipping proof while syncing or frozen");
            return;
        }
        if self.last_proved_block_num >= proof.best_block.number() {
            debug!(
                last_proved = self.last_proved_block_num,
                "skipping proof; already proved higher"
            );
            return;
        }
        if self.lib.number() >= proof.best_block.number() {
            debug!(lib = %self.lib, "skipping proof; lib is higher");
            return;
        }
        if self
            .round
            .as_ref()
            .is_some_and(|round| round.state() == RoundState::Done)
        {
            debug!("skipping proof; the round is already finished");
            return;
        }

        if !self.validate_proof(proof) {
            info!(round = proof.round_num, block = %proof.best_block, "invalid proof");
            return;
        }
        info!(block = %proof.best_block, "proof validated");

        if let Some(round) = self.round.as_mut() {
            if round.num() == proof.round_num {
                debug!(round = proof.round_num, "external proof settles the round");
                round.set_done();
            }
        }
        let proof = proof.clone();
        self.on_proof_gained(&proof);
        self.update_lib(proof.best_block);
    }

    fn on_handshake(&mut self, ses_id: SessionId, msg: &HandshakeMessage) {
        let keys = match msg.public_keys() {
            Ok(keys) => keys,
            Err(err) => {
                debug!(ses_id, %err, "dropping handshake with unrecoverable keys");
                return;
            }
        };
        for key in keys {
            info!(ses_id, from = %key, "handshake received");
            match HandshakeAnsMessage::new(HandshakeAns { lib: self.lib }, &self.providers) {
                Ok(reply) => {
                    self.peers.insert(key, ses_id);
                    self.send(ses_id, NetMessage::HandshakeAns(reply));
                }
                Err(err) => {
                    error!(ses_id, %err, "handshake reply failed; peer not registered");
                }
            }
        }
    }

    fn on_handshake_ans(&mut self, ses_id: SessionId, msg: &HandshakeAnsMessage) {
        let keys = match msg.public_keys() {
            Ok(keys) => keys,
            Err(err) => {
                debug!(ses_id, %err, "dropping handshake answer with unrecoverable keys");
                return;
            }
        };
        for key in keys {
            info!(ses_id, from = %key, "handshake answer received");
            self.peers.insert(key, ses_id);
        }
    }

    // ────────────────────────── event handlers ──────────────────────────

    fn on_accepted_block(
        &mut self,
        block_id: BlockId,
        prev_block_id: BlockId,
        creator_key: PublicKey,
        active_bp_keys: BTreeSet<PublicKey>,
        sync: bool,
    ) {
        debug!(
            block = %block_id,
            num = block_id.number(),
            creator = %creator_key,
            producers = active_bp_keys.len(),
            sync,
            "accepted block"
        );

        if let Err(err) = self
            .tree
            .insert(prev_block_id, &[block_id], creator_key, &active_bp_keys)
        {
            error!(%err, base = %prev_block_id, block = %block_id, "cannot insert block into tree");
            return;
        }

        self.is_syncing = sync;
        let lag = block_id.number().saturating_sub(self.lib.number());
        if lag > MAX_FINALITY_LAG_BLOCKS && !self.is_frozen {
            warn!(lag, lib = %self.lib, "finality lag exceeded the limit; freezing");
            self.is_frozen = true;
        }

        // while syncing or frozen it is useless to open rounds
        if self.is_syncing || self.is_frozen {
            info!(block = %block_id, "omitting block while syncing or frozen");
            return;
        }

        if self.should_start_round(&block_id) {
            self.remove_round();
            if self.is_active_bp(&block_id) {
                self.new_round(round_num_for(&block_id), creator_key, &active_bp_keys);
            }
        }

        if self.should_end_prevote(&block_id) {
            if let Some(round) = self.round.as_mut() {
                let actions = round.end_prevote(&mut self.tree);
                self.run_round_actions(actions);
            }
        }
    }

    fn on_irreversible(&mut self, block_id: BlockId) {
        debug!(block = %block_id, num = block_id.number(), "irreversible event");
        if block_id.number() <= self.tree.root().block_id.number() {
            debug!(block = %block_id, "irreversible event for an old block");
            return;
        }
        self.update_lib(block_id);
    }

    fn on_new_peer(&mut self, ses_id: SessionId) {
        debug!(ses_id, "new peer session");
        match HandshakeMessage::new(Handshake { lib: self.lib }, &self.providers) {
            Ok(msg) => self.send(ses_id, NetMessage::Handshake(msg)),
            Err(err) => error!(ses_id, %err, "signing handshake failed"),
        }
    }

    // ─────────────────────────── round driving ──────────────────────────

    /// Dedup and gossip gate shared by prevote and precommit ingress.
    /// Returns false when the message must not reach the round.
    fn gate_round_msg(&mut self, msg: &NetMessage, round_num: u32) -> bool {
        if self.is_syncing || self.is_frozen {
            debug!("dropping round message while syncing or frozen");
            return false;
        }

        let digest = msg.dedup_digest();
        if self.self_messages.contains(&digest) {
            return false;
        }
        self.self_messages.put(digest, ());

        // forward only messages for the round the live chain is in
        if round_num_for(&self.tree.head().block_id) == round_num {
            self.bcast(msg);
        }
        true
    }

    fn run_round_actions(&mut self, actions: Vec<RoundAction>) {
        for action in actions {
            match action {
                RoundAction::BroadcastPrevote(msg) => self.bcast(&NetMessage::Prevote(msg)),
                RoundAction::BroadcastPrecommit(msg) => self.bcast(&NetMessage::Precommit(msg)),
                RoundAction::Completed => self.finish_round(),
            }
        }
    }

    fn should_start_round(&self, block_id: &BlockId) -> bool {
        if block_id.number() < 1 {
            return false;
        }
        match &self.round {
            None => true,
            Some(round) => round_num_for(block_id) > round.num(),
        }
    }

    fn should_end_prevote(&self, block_id: &BlockId) -> bool {
        match &self.round {
            None => false,
            Some(round) => {
                round_num_for(block_id) == round.num()
                    && num_in_round_for(block_id) == PREVOTE_WIDTH
            }
        }
    }

    fn is_active_bp(&self, block_id: &BlockId) -> bool {
        if !self.is_block_producer {
            return false;
        }
        let Some(node) = self.tree.find(block_id) else {
            debug!(block = %block_id, "block not found checking active producers");
            return false;
        };
        self.public_keys
            .iter()
            .any(|key| node.active_bp_keys.contains(key))
    }

    /// Providers whose keys are active at the new round's block.
    fn active_providers(&self, active_bp_keys: &BTreeSet<PublicKey>) -> Vec<SignatureProvider> {
        active_bp_keys
            .iter()
            .filter_map(|key| self.providers_by_key.get(key).cloned())
            .collect()
    }

    fn new_round(&mut self, num: u32, primary: PublicKey, active_bp_keys: &BTreeSet<PublicKey>) {
        let providers = self.active_providers(active_bp_keys);
        let (round, actions) = Round::start(num, primary, providers, &mut self.tree);
        self.round = Some(round);
        info!(round = num, "new round started");
        self.run_round_actions(actions);
    }

    /// Drop the active round and reset the round-scoped caches and
    /// confirmations (they mean nothing to the next round).
    fn remove_round(&mut self) {
        self.peer_messages.clear();
        self.self_messages.clear();
        self.tree.remove_confirmations();
        self.round = None;
    }

    fn finish_round(&mut self) {
        let Some(round) = self.round.as_mut() else {
            return;
        };
        if !round.finish() {
            return;
        }
        let proof = round.proof().expect("a finished round has a proof").clone();
        info!(
            round = proof.round_num,
            best_block = %proof.best_block,
            best_num = proof.best_block.number(),
            "round reached supermajority"
        );

        if self.lib.number() < proof.best_block.number() {
            self.on_proof_gained(&proof);
            self.update_lib(proof.best_block);
        }
        debug!(round = proof.round_num, "round finished");
    }

    // ─────────────────────────── proof handling ─────────────────────────

    fn on_proof_gained(&mut self, proof: &Proof) {
        if self.last_proofs.len() == PROOF_CACHE_SIZE {
            self.last_proofs.pop_back();
        }
        self.last_proofs.push_front(proof.clone());
        debug!(block = %proof.best_block, "proof cached");

        self.last_proved_block_num = proof.best_block.number();
        self.finality.send(&proof.best_block);

        let notice = FinalityNotice {
            round_num: proof.round_num,
            best_block: proof.best_block,
        };
        match FinalityNoticeMessage::new(notice, &self.providers) {
            Ok(notice) => self.bcast(&NetMessage::FinalityNotice(notice)),
            Err(err) => error!(%err, "signing finality notice failed"),
        }
    }

    fn update_lib(&mut self, block_id: BlockId) {
        self.tree.set_root(block_id);
        self.lib = block_id;
    }

    fn validate_proof(&self, proof: &Proof) -> bool {
        let Some(node) = self.tree.find(&proof.best_block) else {
            debug!(block = %proof.best_block, "proof for an unknown block");
            return false;
        };
        let bp_keys = &node.active_bp_keys;
        let best_block = proof.best_block;

        let mut prevoted_keys = BTreeSet::new();
        for prevote in &proof.prevotes {
            let keys = match prevote.public_keys() {
                Ok(keys) => keys,
                Err(err) => {
                    debug!(%err, "proof prevote keys are unrecoverable");
                    return false;
                }
            };
            for key in keys {
                if !validate_proof_prevote(&prevote.data, &key, &best_block, bp_keys) {
                    debug!(base = %prevote.data.base_block, "proof prevote validation failed");
                    return false;
                }
                prevoted_keys.insert(key);
            }
        }

        let mut precommited_keys = BTreeSet::new();
        for precommit in &proof.precommits {
            let keys = match precommit.public_keys() {
                Ok(keys) => keys,
                Err(err) => {
                    debug!(%err, "proof precommit keys are unrecoverable");
                    return false;
                }
            };
            for key in keys {
                if !prevoted_keys.contains(&key) {
                    debug!(voter = %key, "proof precommitter has not prevoted");
                    return false;
                }
                if !validate_proof_precommit(&precommit.data, &key, &best_block, bp_keys) {
                    debug!(block = %precommit.data.block_id, "proof precommit validation failed");
                    return false;
                }
                precommited_keys.insert(key);
            }
        }

        let enough = precommited_keys.len() > bp_keys.len() * 2 / 3;
        if !enough {
            debug!(
                have = precommited_keys.len(),
                need = bp_keys.len() * 2 / 3 + 1,
                "proof lacks precommit keys"
            );
        }
        enough
    }

    // ──────────────────────────── networking ────────────────────────────

    fn send(&self, ses_id: SessionId, msg: NetMessage) {
        self.out_net.send(&NetEnvelope::now(ses_id, msg));
    }

    /// Forward `msg` to every known peer, at most once per dedup digest.
    fn bcast(&mut self, msg: &NetMessage) {
        let digest = msg.dedup_digest();
        if self.peer_messages.contains(&digest) {
            return;
        }
        for ses_id in self.peers.values() {
            self.send(*ses_id, msg.clone());
        }
        self.peer_messages.put(digest, ());
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("is_block_producer", &self.is_block_producer)
            .field("lib", &self.lib)
            .field("round", &self.current_round_num())
            .field("tree_len", &self.tree.len())
            .field("peers", &self.peers.len())
            .field("is_syncing", &self.is_syncing)
            .field("is_frozen", &self.is_frozen)
            .finish()
    }
}

fn validate_proof_prevote(
    data: &Prevote,
    key: &PublicKey,
    best_block: &BlockId,
    bp_keys: &BTreeSet<PublicKey>,
) -> bool {
    if data.base_block != *best_block && !data.blocks.contains(best_block) {
        debug!(block = %best_block, "best block is not on the prevoted branch");
        return false;
    }
    if !bp_keys.contains(key) {
        debug!(voter = %key, "prevoter is not an active producer");
        return false;
    }
    true
}

fn validate_proof_precommit(
    data: &Precommit,
    key: &PublicKey,
    best_block: &BlockId,
    bp_keys: &BTreeSet<PublicKey>,
) -> bool {
    if data.block_id != *best_block {
        debug!(block = %data.block_id, best = %best_block, "precommit is not for the best block");
        return false;
    }
    if !bp_keys.contains(key) {
        debug!(voter = %key, "precommitter is not an active producer");
        return false;
    }
    true
}
