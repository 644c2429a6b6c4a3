//! Integration tests driving the engine in synchronous mode.
//!
//! Each test wires collecting subscribers onto the out-net and finality
//! channels and feeds events/messages through `process_message` directly,
//! exactly as a synchronous host would.

use granite_core::{ChainEvent, EngineMessage, FinalityChannel, NetChannel, NetEnvelope, SessionId};
use granite_engine::{Engine, EngineError, IdentityMode, MSG_EXPIRATION};
use granite_messages::{
    FinalityNotice, FinalityNoticeMessage, FinalityReqProofMessage, NetMessage, Precommit,
    PrecommitMessage, Prevote, PrevoteMessage, Proof, ProofMessage, SignedMessage,
};
use granite_round::RoundState;
use granite_tree::PrefixTree;
use granite_types::{BlockId, KeyPair, PublicKey};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing_test::traced_test;

/// Collecting endpoints for everything the engine emits.
struct Host {
    outbox: Arc<Mutex<Vec<NetEnvelope>>>,
    finalized: Arc<Mutex<Vec<BlockId>>>,
}

impl Host {
    fn new() -> (Self, Arc<NetChannel>, Arc<FinalityChannel>) {
        let out_net = Arc::new(NetChannel::new());
        let finality = Arc::new(FinalityChannel::new());

        let outbox = Arc::new(Mutex::new(Vec::new()));
        let sink = outbox.clone();
        out_net.subscribe(move |envelope: &NetEnvelope| {
            sink.lock().unwrap().push(envelope.clone());
        });

        let finalized = Arc::new(Mutex::new(Vec::new()));
        let sink = finalized.clone();
        finality.subscribe(move |block_id: &BlockId| {
            sink.lock().unwrap().push(*block_id);
        });

        (Self { outbox, finalized }, out_net, finality)
    }

    fn sent(&self) -> Vec<NetEnvelope> {
        self.outbox.lock().unwrap().clone()
    }

    fn sent_count(&self) -> usize {
        self.outbox.lock().unwrap().len()
    }

    fn finalized(&self) -> Vec<BlockId> {
        self.finalized.lock().unwrap().clone()
    }
}

struct Network {
    producers: Vec<KeyPair>,
    active_keys: BTreeSet<PublicKey>,
    root: BlockId,
}

impl Network {
    fn new(producer_count: u8) -> Self {
        let producers: Vec<_> = (1..=producer_count).map(KeyPair::from_seed).collect();
        let active_keys = producers.iter().map(KeyPair::public_key).collect();
        Self {
            producers,
            active_keys,
            root: BlockId::for_num(0, b"genesis"),
        }
    }

    /// An engine voting as `producers[index]`.
    fn producer_engine(
        &self,
        index: usize,
        out_net: Arc<NetChannel>,
        finality: Arc<FinalityChannel>,
    ) -> Engine {
        let mode = IdentityMode::producer_from_keypairs(&self.producers[index..index + 1]);
        Engine::new(mode, PrefixTree::new(self.root), out_net, finality).unwrap()
    }

    fn full_node_engine(
        &self,
        out_net: Arc<NetChannel>,
        finality: Arc<FinalityChannel>,
    ) -> Engine {
        Engine::new(
            IdentityMode::FullNode,
            PrefixTree::new(self.root),
            out_net,
            finality,
        )
        .unwrap()
    }

    fn accept(&self, engine: &mut Engine, prev: BlockId, block_id: BlockId, sync: bool) {
        engine.process_message(EngineMessage::Event(ChainEvent::AcceptedBlock {
            block_id,
            prev_block_id: prev,
            creator_key: self.producers[0].public_key(),
            active_bp_keys: self.active_keys.clone(),
            sync,
        }));
    }

    fn prevote(&self, voter: usize, round_num: u32, base: BlockId, blocks: Vec<BlockId>) -> PrevoteMessage {
        SignedMessage::new(
            Prevote {
                round_num,
                base_block: base,
                blocks,
            },
            &[self.producers[voter].provider()],
        )
        .unwrap()
    }

    fn precommit(&self, voter: usize, round_num: u32, block_id: BlockId) -> PrecommitMessage {
        SignedMessage::new(
            Precommit {
                round_num,
                block_id,
            },
            &[self.producers[voter].provider()],
        )
        .unwrap()
    }

    /// A proof for `best_block` signed by the first `voter_count` producers.
    fn proof(&self, round_num: u32, base: BlockId, blocks: Vec<BlockId>, voter_count: usize) -> Proof {
        let best_block = *blocks.last().unwrap();
        let prevotes = (0..voter_count)
            .map(|voter| self.prevote(voter, round_num, base, blocks.clone()))
            .collect();
        let precommits = (0..voter_count)
            .map(|voter| self.precommit(voter, round_num, best_block))
            .collect();
        Proof {
            round_num,
            best_block,
            prevotes,
            precommits,
        }
    }

    fn handshake_from(&self, voter: usize, lib: BlockId) -> NetMessage {
        NetMessage::Handshake(
            SignedMessage::new(
                granite_messages::Handshake { lib },
                &[self.producers[voter].provider()],
            )
            .unwrap(),
        )
    }
}

fn deliver(engine: &mut Engine, ses_id: SessionId, msg: NetMessage) {
    engine.process_message(EngineMessage::Net(NetEnvelope::now(ses_id, msg)));
}

#[traced_test]
#[test]
fn happy_path_round_finalizes_the_best_block() {
    let net = Network::new(4);
    let (host, out_net, finality) = Host::new();
    let mut engine = net.producer_engine(0, out_net, finality);

    // a peer handshakes so broadcasts have somewhere to go
    deliver(&mut engine, 7, net.handshake_from(3, net.root));
    assert_eq!(engine.peer_count(), 1);

    // first block of round 0 opens the round and broadcasts our prevote
    let b1 = BlockId::for_num(1, b"b1");
    net.accept(&mut engine, net.root, b1, false);
    assert_eq!(engine.round_state(), Some(RoundState::Prevote));
    assert!(host
        .sent()
        .iter()
        .any(|e| matches!(e.data, NetMessage::Prevote(_))));

    // two more prevotes cross the 2/3 threshold (3 of 4)
    deliver(
        &mut engine,
        8,
        NetMessage::Prevote(net.prevote(1, 0, net.root, vec![b1])),
    );
    deliver(
        &mut engine,
        9,
        NetMessage::Prevote(net.prevote(2, 0, net.root, vec![b1])),
    );
    assert_eq!(engine.round_state(), Some(RoundState::ReadyToPrecommit));

    // the second block of the round closes the prevote window
    let b2 = BlockId::for_num(2, b"b2");
    net.accept(&mut engine, b1, b2, false);
    assert_eq!(engine.round_state(), Some(RoundState::Precommit));
    assert!(host
        .sent()
        .iter()
        .any(|e| matches!(e.data, NetMessage::Precommit(_))));

    // precommits complete the round; lib advances to the best block
    deliver(
        &mut engine,
        8,
        NetMessage::Precommit(net.precommit(1, 0, b1)),
    );
    deliver(
        &mut engine,
        9,
        NetMessage::Precommit(net.precommit(2, 0, b1)),
    );

    assert_eq!(engine.round_state(), Some(RoundState::Done));
    assert_eq!(engine.lib(), b1);
    assert_eq!(engine.tree().root_id(), b1);
    assert_eq!(host.finalized(), vec![b1]);
    assert!(host
        .sent()
        .iter()
        .any(|e| matches!(e.data, NetMessage::FinalityNotice(_))));
}

#[traced_test]
#[test]
fn external_proof_advances_lib_and_is_announced_once() {
    let net = Network::new(4);
    let (host, out_net, finality) = Host::new();
    let mut engine = net.full_node_engine(out_net, finality);

    deliver(&mut engine, 7, net.handshake_from(3, net.root));

    let b1 = BlockId::for_num(1, b"b1");
    let b2 = BlockId::for_num(2, b"b2");
    let b3 = BlockId::for_num(3, b"b3");
    net.accept(&mut engine, net.root, b1, false);
    net.accept(&mut engine, b1, b2, false);
    net.accept(&mut engine, b2, b3, false);

    let proof = net.proof(1, net.root, vec![b1, b2, b3], 3);
    let msg = ProofMessage::new(proof, &[net.producers[1].provider()]).unwrap();
    deliver(&mut engine, 7, NetMessage::Proof(Box::new(msg.clone())));

    assert_eq!(engine.lib(), b3);
    assert_eq!(engine.last_proved_block_num(), 3);
    assert_eq!(host.finalized(), vec![b3]);
    let notices = host
        .sent()
        .iter()
        .filter(|e| matches!(e.data, NetMessage::FinalityNotice(_)))
        .count();
    assert_eq!(notices, 1);

    // an identical proof is dropped: the engine already proved this block
    deliver(&mut engine, 7, NetMessage::Proof(Box::new(msg)));
    assert_eq!(host.finalized(), vec![b3]);
    let notices_after = host
        .sent()
        .iter()
        .filter(|e| matches!(e.data, NetMessage::FinalityNotice(_)))
        .count();
    assert_eq!(notices_after, 1);
}

#[traced_test]
#[test]
fn invalid_proof_is_rejected() {
    let net = Network::new(4);
    let (host, out_net, finality) = Host::new();
    let mut engine = net.full_node_engine(out_net, finality);

    let b1 = BlockId::for_num(1, b"b1");
    net.accept(&mut engine, net.root, b1, false);

    // only two precommits of four producers: below the supermajority
    let proof = net.proof(0, net.root, vec![b1], 2);
    let msg = ProofMessage::new(proof, &[net.producers[1].provider()]).unwrap();
    deliver(&mut engine, 7, NetMessage::Proof(Box::new(msg)));

    assert_eq!(engine.lib(), net.root);
    assert!(host.finalized().is_empty());
}

#[traced_test]
#[test]
fn proof_round_trip_between_engines() {
    let net = Network::new(4);

    // engine A completes a round locally
    let (_host_a, out_a, fin_a) = Host::new();
    let mut alice = net.producer_engine(0, out_a, fin_a);
    let b1 = BlockId::for_num(1, b"b1");
    let b2 = BlockId::for_num(2, b"b2");
    net.accept(&mut alice, net.root, b1, false);
    deliver(&mut alice, 8, NetMessage::Prevote(net.prevote(1, 0, net.root, vec![b1])));
    deliver(&mut alice, 9, NetMessage::Prevote(net.prevote(2, 0, net.root, vec![b1])));
    net.accept(&mut alice, b1, b2, false);
    deliver(&mut alice, 8, NetMessage::Precommit(net.precommit(1, 0, b1)));
    deliver(&mut alice, 9, NetMessage::Precommit(net.precommit(2, 0, b1)));
    assert_eq!(alice.lib(), b1);

    // engine B (a full node with the same view) accepts an equivalent proof
    let (host_b, out_b, fin_b) = Host::new();
    let mut bob = net.full_node_engine(out_b, fin_b);
    net.accept(&mut bob, net.root, b1, false);

    let proof = Proof {
        round_num: 0,
        best_block: b1,
        prevotes: vec![
            net.prevote(0, 0, net.root, vec![b1]),
            net.prevote(1, 0, net.root, vec![b1]),
            net.prevote(2, 0, net.root, vec![b1]),
        ],
        precommits: vec![
            net.precommit(0, 0, b1),
            net.precommit(1, 0, b1),
            net.precommit(2, 0, b1),
        ],
    };
    let msg = ProofMessage::new(proof, &[net.producers[0].provider()]).unwrap();
    deliver(&mut bob, 1, NetMessage::Proof(Box::new(msg)));

    assert_eq!(bob.lib(), b1);
    assert_eq!(host_b.finalized(), vec![b1]);
}

#[traced_test]
#[test]
fn freeze_drops_round_and_proof_traffic_but_keeps_handshakes() {
    let net = Network::new(4);
    let (host, out_net, finality) = Host::new();
    let mut engine = net.producer_engine(0, out_net, finality);

    // a block far beyond the finality lag limit freezes the gadget
    let far = BlockId::for_num(5000, b"far");
    net.accept(&mut engine, net.root, far, false);
    assert!(engine.is_frozen());
    assert!(engine.round_state().is_none());

    // round-phase and proof messages are dropped while frozen
    let b1 = BlockId::for_num(5001, b"b1");
    net.accept(&mut engine, far, b1, false);
    deliver(
        &mut engine,
        8,
        NetMessage::Prevote(net.prevote(1, 2500, far, vec![b1])),
    );
    assert!(engine.round_state().is_none());

    let proof = net.proof(2500, far, vec![b1], 3);
    let msg = ProofMessage::new(proof, &[net.producers[1].provider()]).unwrap();
    deliver(&mut engine, 8, NetMessage::Proof(Box::new(msg)));
    assert_eq!(engine.lib(), net.root);
    assert!(host.finalized().is_empty());

    // block insertion and peering still work
    assert!(engine.tree().contains(&b1));
    deliver(&mut engine, 7, net.handshake_from(3, net.root));
    assert_eq!(engine.peer_count(), 1);

    // frozen is sticky even if later blocks would shrink the lag
    assert!(engine.is_frozen());
}

#[traced_test]
#[test]
fn syncing_blocks_are_inserted_but_open_no_round() {
    let net = Network::new(4);
    let (_host, out_net, finality) = Host::new();
    let mut engine = net.producer_engine(0, out_net, finality);

    let b1 = BlockId::for_num(1, b"b1");
    net.accept(&mut engine, net.root, b1, true);

    assert!(engine.is_syncing());
    assert!(engine.tree().contains(&b1));
    assert!(engine.round_state().is_none());
}

#[traced_test]
#[test]
fn replayed_round_message_is_deduplicated() {
    let net = Network::new(4);
    let (host, out_net, finality) = Host::new();
    let mut engine = net.producer_engine(0, out_net, finality);

    deliver(&mut engine, 7, net.handshake_from(3, net.root));
    let b1 = BlockId::for_num(1, b"b1");
    net.accept(&mut engine, net.root, b1, false);

    let prevote = NetMessage::Prevote(net.prevote(1, 0, net.root, vec![b1]));
    deliver(&mut engine, 8, prevote.clone());
    let sent_after_first = host.sent_count();

    // the replay is swallowed by the self-message cache: no state change,
    // no re-broadcast
    deliver(&mut engine, 8, prevote);
    assert_eq!(host.sent_count(), sent_after_first);
    assert_eq!(engine.round_state(), Some(RoundState::Prevote));
}

#[traced_test]
#[test]
fn round_messages_are_not_regossiped_while_head_is_genesis() {
    let net = Network::new(4);
    let (host, out_net, finality) = Host::new();
    let mut engine = net.full_node_engine(out_net, finality);

    deliver(&mut engine, 7, net.handshake_from(3, net.root));
    let sent_after_handshake = host.sent_count();

    // the head is still the genesis root: a round-phase message for any
    // real round number must not be forwarded
    let b1 = BlockId::for_num(1, b"b1");
    deliver(
        &mut engine,
        8,
        NetMessage::Prevote(net.prevote(1, 0, net.root, vec![b1])),
    );
    assert_eq!(host.sent_count(), sent_after_handshake);
}

#[traced_test]
#[test]
fn lib_is_monotone_across_irreversible_events() {
    let net = Network::new(4);
    let (_host, out_net, finality) = Host::new();
    let mut engine = net.full_node_engine(out_net, finality);

    let b1 = BlockId::for_num(1, b"b1");
    let b2 = BlockId::for_num(2, b"b2");
    net.accept(&mut engine, net.root, b1, false);
    net.accept(&mut engine, b1, b2, false);

    engine.process_message(EngineMessage::Event(ChainEvent::Irreversible { block_id: b2 }));
    assert_eq!(engine.lib(), b2);
    assert_eq!(engine.tree().root_id(), b2);

    // an irreversible event for an older block is ignored
    engine.process_message(EngineMessage::Event(ChainEvent::Irreversible { block_id: b1 }));
    assert_eq!(engine.lib(), b2);

    // an unknown higher block resets the view
    let b9 = BlockId::for_num(9, b"b9");
    engine.process_message(EngineMessage::Event(ChainEvent::Irreversible { block_id: b9 }));
    assert_eq!(engine.lib(), b9);
    assert_eq!(engine.tree().len(), 1);
}

#[traced_test]
#[test]
fn round_numbers_never_decrease() {
    let net = Network::new(4);
    let (_host, out_net, finality) = Host::new();
    let mut engine = net.producer_engine(0, out_net, finality);

    let b1 = BlockId::for_num(1, b"b1");
    let b2 = BlockId::for_num(2, b"b2");
    let b3 = BlockId::for_num(3, b"b3");
    net.accept(&mut engine, net.root, b1, false);
    assert_eq!(engine.current_round_num(), Some(0));

    net.accept(&mut engine, b1, b2, false);
    assert_eq!(engine.current_round_num(), Some(0));

    // block 3 belongs to round 1: the old round is replaced, not merged
    net.accept(&mut engine, b2, b3, false);
    assert_eq!(engine.current_round_num(), Some(1));
}

#[traced_test]
#[test]
fn full_node_opens_no_rounds() {
    let net = Network::new(4);
    let (_host, out_net, finality) = Host::new();
    let mut engine = net.full_node_engine(out_net, finality);

    let b1 = BlockId::for_num(1, b"b1");
    net.accept(&mut engine, net.root, b1, false);

    assert!(engine.round_state().is_none());
    assert!(engine.public_keys().is_empty());
}

#[traced_test]
#[test]
fn expired_messages_are_dropped_before_dispatch() {
    let net = Network::new(4);
    let (_host, out_net, finality) = Host::new();
    let mut engine = net.full_node_engine(out_net, finality);

    let stale = NetEnvelope {
        ses_id: 7,
        data: net.handshake_from(1, net.root),
        receive_time: Instant::now() - (MSG_EXPIRATION * 2),
    };
    engine.process_message(EngineMessage::Net(stale));

    assert_eq!(engine.peer_count(), 0);
}

#[traced_test]
#[test]
fn finality_notice_makes_a_lagging_node_request_the_proof() {
    let net = Network::new(4);
    let (host, out_net, finality) = Host::new();
    let mut engine = net.full_node_engine(out_net, finality);

    let b1 = BlockId::for_num(1, b"b1");
    net.accept(&mut engine, net.root, b1, false);

    let notice = FinalityNoticeMessage::new(
        FinalityNotice {
            round_num: 0,
            best_block: b1,
        },
        &[net.producers[1].provider()],
    )
    .unwrap();
    deliver(&mut engine, 12, NetMessage::FinalityNotice(notice));

    let request = host
        .sent()
        .into_iter()
        .find(|e| matches!(e.data, NetMessage::FinalityReqProof(_)))
        .expect("proof requested");
    assert_eq!(request.ses_id, 12);
}

#[traced_test]
#[test]
fn completed_round_serves_proofs_from_the_cache() {
    let net = Network::new(4);
    let (host, out_net, finality) = Host::new();
    let mut engine = net.producer_engine(0, out_net, finality);

    let b1 = BlockId::for_num(1, b"b1");
    let b2 = BlockId::for_num(2, b"b2");
    net.accept(&mut engine, net.root, b1, false);
    deliver(&mut engine, 8, NetMessage::Prevote(net.prevote(1, 0, net.root, vec![b1])));
    deliver(&mut engine, 9, NetMessage::Prevote(net.prevote(2, 0, net.root, vec![b1])));
    net.accept(&mut engine, b1, b2, false);
    deliver(&mut engine, 8, NetMessage::Precommit(net.precommit(1, 0, b1)));
    deliver(&mut engine, 9, NetMessage::Precommit(net.precommit(2, 0, b1)));
    assert_eq!(engine.lib(), b1);

    let request = FinalityReqProofMessage::new(
        granite_messages::FinalityReqProof { round_num: 0 },
        &[net.producers[3].provider()],
    )
    .unwrap();
    deliver(&mut engine, 4, NetMessage::FinalityReqProof(request));

    let reply = host
        .sent()
        .into_iter()
        .rev()
        .find(|e| matches!(e.data, NetMessage::Proof(_)))
        .expect("proof served");
    assert_eq!(reply.ses_id, 4);
    let NetMessage::Proof(proof_msg) = reply.data else {
        unreachable!()
    };
    assert_eq!(proof_msg.data.round_num, 0);
    assert_eq!(proof_msg.data.best_block, b1);
    assert!(proof_msg.data.precommits.len() > 2);
}

#[test]
fn producer_mode_requires_providers() {
    let out_net = Arc::new(NetChannel::new());
    let finality = Arc::new(FinalityChannel::new());
    let tree = PrefixTree::new(BlockId::for_num(0, b"genesis"));

    let err = Engine::new(
        IdentityMode::BlockProducer {
            providers: Vec::new(),
            public_keys: Vec::new(),
        },
        tree,
        out_net,
        finality,
    )
    .unwrap_err();
    assert_eq!(err, EngineError::NoProviders);
}

#[test]
fn producer_mode_requires_matching_keys() {
    let out_net = Arc::new(NetChannel::new());
    let finality = Arc::new(FinalityChannel::new());
    let tree = PrefixTree::new(BlockId::for_num(0, b"genesis"));

    let keypair = KeyPair::from_seed(1);
    let err = Engine::new(
        IdentityMode::BlockProducer {
            providers: vec![keypair.provider()],
            public_keys: Vec::new(),
        },
        tree,
        out_net,
        finality,
    )
    .unwrap_err();
    assert_eq!(err, EngineError::ProviderKeyMismatch);
}
