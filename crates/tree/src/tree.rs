//! Tree implementation.

use granite_messages::PrevoteMessage;
use granite_types::{BlockId, PublicKey};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

/// Errors from tree mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("node not found in tree: {0}")]
    NodeNotFound(BlockId),
}

/// One candidate block in the fork view.
#[derive(Debug, Clone)]
pub struct TreeNode {
    pub block_id: BlockId,
    /// Producer that signed the block; `None` only for synthetic roots.
    pub creator_key: Option<PublicKey>,
    /// Public keys expected to vote in the round containing this block.
    pub active_bp_keys: BTreeSet<PublicKey>,
    /// Prevote per voter. First write wins; a voter appears at most once.
    pub confirmation_data: BTreeMap<PublicKey, PrevoteMessage>,
    parent: Option<BlockId>,
    children: Vec<BlockId>,
    /// Insertion sequence, breaks head ties deterministically.
    seq: u64,
}

impl TreeNode {
    /// Whether `key` has a prevote recorded on this node.
    pub fn has_confirmation(&self, key: &PublicKey) -> bool {
        self.confirmation_data.contains_key(key)
    }

    /// The parent id, if any.
    pub fn parent(&self) -> Option<BlockId> {
        self.parent
    }

    /// Ids of the children, in insertion order.
    pub fn children(&self) -> &[BlockId] {
        &self.children
    }
}

/// The prefix chain tree.
///
/// Nodes live in an arena keyed by block id; parent/child links are ids.
/// The engine is the single owner; rounds borrow the tree per call.
pub struct PrefixTree {
    nodes: HashMap<BlockId, TreeNode>,
    root: BlockId,
    head: BlockId,
    last_inserted: HashMap<PublicKey, BlockId>,
    next_seq: u64,
}

impl PrefixTree {
    /// A fresh tree whose root is the given irreversible block.
    pub fn new(root_id: BlockId) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            root_id,
            TreeNode {
                block_id: root_id,
                creator_key: None,
                active_bp_keys: BTreeSet::new(),
                confirmation_data: BTreeMap::new(),
                parent: None,
                children: Vec::new(),
                seq: 0,
            },
        );
        Self {
            nodes,
            root: root_id,
            head: root_id,
            last_inserted: HashMap::new(),
            next_seq: 1,
        }
    }

    /// The root node (the last irreversible block).
    pub fn root(&self) -> &TreeNode {
        &self.nodes[&self.root]
    }

    /// The root id.
    pub fn root_id(&self) -> BlockId {
        self.root
    }

    /// Number of nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether only the root remains.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Look up a node by id.
    pub fn find(&self, id: &BlockId) -> Option<&TreeNode> {
        self.nodes.get(id)
    }

    /// Whether `id` is in the tree.
    pub fn contains(&self, id: &BlockId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Insert the path `blocks` below `base`.
    ///
    /// The attach point is `base` if known, otherwise the deepest id of
    /// `blocks` already in the tree (only the suffix after it is created).
    /// Already-present children are walked through, not duplicated. Fails
    /// when neither `base` nor any of `blocks` is known.
    pub fn insert(
        &mut self,
        base: BlockId,
        blocks: &[BlockId],
        creator_key: PublicKey,
        active_bp_keys: &BTreeSet<PublicKey>,
    ) -> Result<(), TreeError> {
        let (mut at, remaining) = self
            .attach_point(&base, blocks)
            .ok_or(TreeError::NodeNotFound(base))?;

        for block_id in remaining {
            at = match self.child_matching(&at, block_id) {
                Some(existing) => existing,
                None => {
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    self.nodes.insert(
                        *block_id,
                        TreeNode {
                            block_id: *block_id,
                            creator_key: Some(creator_key),
                            active_bp_keys: active_bp_keys.clone(),
                            confirmation_data: BTreeMap::new(),
                            parent: Some(at),
                            children: Vec::new(),
                            seq,
                        },
                    );
                    self.nodes
                        .get_mut(&at)
                        .expect("attach point present")
                        .children
                        .push(*block_id);
                    *block_id
                }
            };
        }

        self.last_inserted.insert(creator_key, at);
        if at != self.root && at.number() > self.head_number() {
            self.head = at;
        }
        Ok(())
    }

    /// Record `voter`'s prevote on the deepest in-tree node of the branch.
    ///
    /// Scans `blocks` from the tail toward the head so a prevote naming a
    /// longer known prefix binds deeper; falls back to `base`. Returns the
    /// node the vote landed on, or `None` when nothing in the branch is
    /// known. First write per voter wins.
    pub fn add_confirmations(
        &mut self,
        base: &BlockId,
        blocks: &[BlockId],
        voter: PublicKey,
        prevote: PrevoteMessage,
    ) -> Option<BlockId> {
        let target = self.find_last_node(base, blocks)?;
        let node = self.nodes.get_mut(&target).expect("target present");
        node.confirmation_data.entry(voter).or_insert(prevote);
        Some(target)
    }

    /// The deepest id of `base`+`blocks` present in the tree, scanning the
    /// path from its tip.
    pub fn find_last_node(&self, base: &BlockId, blocks: &[BlockId]) -> Option<BlockId> {
        blocks
            .iter()
            .rev()
            .find(|id| self.contains(id))
            .or_else(|| self.contains(base).then_some(base))
            .copied()
    }

    /// Aggregated confirmation count: the node's own voters plus those of
    /// its entire subtree (a vote on a descendant confirms its ancestors).
    pub fn confirmation_number(&self, id: &BlockId) -> usize {
        let mut count = 0;
        let mut stack = vec![id];
        while let Some(at) = stack.pop() {
            let Some(node) = self.nodes.get(at) else {
                continue;
            };
            count += node.confirmation_data.len();
            stack.extend(node.children.iter());
        }
        count
    }

    /// The branch from just below the root up to `head`: `(root_id, path)`.
    pub fn get_branch(&self, head: &BlockId) -> Option<(BlockId, Vec<BlockId>)> {
        if !self.contains(head) {
            return None;
        }
        let mut path = Vec::new();
        let mut at = *head;
        while at != self.root {
            path.push(at);
            at = self.nodes[&at].parent?;
        }
        path.reverse();
        Some((self.root, path))
    }

    /// The most recently inserted node created by `key`.
    pub fn last_inserted_by(&self, key: &PublicKey) -> Option<&TreeNode> {
        self.last_inserted.get(key).and_then(|id| self.nodes.get(id))
    }

    /// The deepest node along the longest chain; insertion order breaks
    /// ties. Falls back to the root of an empty tree.
    pub fn head(&self) -> &TreeNode {
        &self.nodes[&self.head]
    }

    fn head_number(&self) -> u32 {
        self.nodes[&self.head].block_id.number()
    }

    /// Make `new_root` the root, pruning every branch not containing it.
    ///
    /// An unknown id replaces the whole tree with a fresh single-node root
    /// (the chain finalized past our view).
    pub fn set_root(&mut self, new_root: BlockId) {
        if !self.contains(&new_root) {
            *self = Self::new(new_root);
            return;
        }

        let mut keep: BTreeSet<BlockId> = BTreeSet::new();
        let mut stack = vec![new_root];
        while let Some(at) = stack.pop() {
            keep.insert(at);
            stack.extend(self.nodes[&at].children.iter());
        }

        self.nodes.retain(|id, _| keep.contains(id));
        self.last_inserted.retain(|_, id| keep.contains(id));
        let root_node = self.nodes.get_mut(&new_root).expect("new root kept");
        root_node.parent = None;
        self.root = new_root;
        if !keep.contains(&self.head) {
            self.recompute_head();
        }
    }

    /// Clear every node's confirmations; used when rotating rounds, since
    /// prevotes are scoped to a single round.
    pub fn remove_confirmations(&mut self) {
        for node in self.nodes.values_mut() {
            node.confirmation_data.clear();
        }
    }

    fn attach_point<'b>(
        &self,
        base: &BlockId,
        blocks: &'b [BlockId],
    ) -> Option<(BlockId, &'b [BlockId])> {
        if self.contains(base) {
            return Some((*base, blocks));
        }
        let pos = blocks.iter().position(|id| self.contains(id))?;
        Some((blocks[pos], &blocks[pos + 1..]))
    }

    fn child_matching(&self, parent: &BlockId, child: &BlockId) -> Option<BlockId> {
        self.nodes[parent].children.iter().find(|id| *id == child).copied()
    }

    fn recompute_head(&mut self) {
        let mut best = self.root;
        let mut best_key = (self.nodes[&self.root].block_id.number(), self.nodes[&self.root].seq);
        for (id, node) in &self.nodes {
            let key = (node.block_id.number(), node.seq);
            if key.0 > best_key.0 || (key.0 == best_key.0 && key.1 < best_key.1) {
                best = *id;
                best_key = key;
            }
        }
        self.head = best;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use granite_messages::{Prevote, SignedMessage};
    use granite_types::KeyPair;

    fn id(num: u32, seed: &[u8]) -> BlockId {
        BlockId::for_num(num, seed)
    }

    fn bp_keys(count: u8) -> (Vec<KeyPair>, BTreeSet<PublicKey>) {
        let pairs: Vec<_> = (1..=count).map(KeyPair::from_seed).collect();
        let keys = pairs.iter().map(|p| p.public_key()).collect();
        (pairs, keys)
    }

    fn prevote_msg(voter: &KeyPair, round_num: u32, base: BlockId, blocks: Vec<BlockId>) -> PrevoteMessage {
        SignedMessage::new(
            Prevote {
                round_num,
                base_block: base,
                blocks,
            },
            &[voter.provider()],
        )
        .unwrap()
    }

    #[test]
    fn insert_builds_a_chain_and_tracks_head() {
        let (pairs, keys) = bp_keys(1);
        let root = id(0, b"genesis");
        let mut tree = PrefixTree::new(root);

        let b1 = id(1, b"b1");
        let b2 = id(2, b"b2");
        tree.insert(root, &[b1], pairs[0].public_key(), &keys).unwrap();
        tree.insert(b1, &[b2], pairs[0].public_key(), &keys).unwrap();

        assert_eq!(tree.len(), 3);
        assert_eq!(tree.head().block_id, b2);
        assert_eq!(tree.find(&b2).unwrap().parent(), Some(b1));
        assert_eq!(
            tree.last_inserted_by(&pairs[0].public_key()).unwrap().block_id,
            b2
        );
    }

    #[test]
    fn insert_with_unknown_parent_fails() {
        let (pairs, keys) = bp_keys(1);
        let mut tree = PrefixTree::new(id(0, b"genesis"));

        let err = tree
            .insert(id(9, b"nowhere"), &[id(10, b"b10")], pairs[0].public_key(), &keys)
            .unwrap_err();
        assert_eq!(err, TreeError::NodeNotFound(id(9, b"nowhere")));
    }

    #[test]
    fn reinserting_an_existing_child_is_a_noop() {
        let (pairs, keys) = bp_keys(1);
        let root = id(0, b"genesis");
        let mut tree = PrefixTree::new(root);

        let b1 = id(1, b"b1");
        tree.insert(root, &[b1], pairs[0].public_key(), &keys).unwrap();
        tree.insert(root, &[b1], pairs[0].public_key(), &keys).unwrap();

        assert_eq!(tree.len(), 2);
        assert_eq!(tree.root().children().len(), 1);
    }

    #[test]
    fn insert_attaches_at_deepest_known_id_of_the_path() {
        let (pairs, keys) = bp_keys(1);
        let root = id(0, b"genesis");
        let mut tree = PrefixTree::new(root);

        let b1 = id(1, b"b1");
        let b2 = id(2, b"b2");
        tree.insert(root, &[b1], pairs[0].public_key(), &keys).unwrap();
        // base unknown, but b1 is in the path: only b2 is created
        tree.insert(id(7, b"unknown"), &[b1, b2], pairs[0].public_key(), &keys)
            .unwrap();

        assert_eq!(tree.len(), 3);
        assert_eq!(tree.find(&b2).unwrap().parent(), Some(b1));
    }

    #[test]
    fn head_ties_go_to_the_first_inserted_fork() {
        let (pairs, keys) = bp_keys(2);
        let root = id(0, b"genesis");
        let mut tree = PrefixTree::new(root);

        let a1 = id(1, b"fork-a");
        let b1 = id(1, b"fork-b");
        tree.insert(root, &[a1], pairs[0].public_key(), &keys).unwrap();
        tree.insert(root, &[b1], pairs[1].public_key(), &keys).unwrap();

        assert_eq!(tree.head().block_id, a1);
    }

    #[test]
    fn branch_runs_from_below_the_root_to_the_target() {
        let (pairs, keys) = bp_keys(1);
        let root = id(0, b"genesis");
        let mut tree = PrefixTree::new(root);

        let b1 = id(1, b"b1");
        let b2 = id(2, b"b2");
        let b3 = id(3, b"b3");
        tree.insert(root, &[b1, b2, b3], pairs[0].public_key(), &keys).unwrap();

        let (base, blocks) = tree.get_branch(&b3).unwrap();
        assert_eq!(base, root);
        assert_eq!(blocks, vec![b1, b2, b3]);
    }

    #[test]
    fn confirmations_bind_to_the_deepest_known_block() {
        let (pairs, keys) = bp_keys(2);
        let root = id(0, b"genesis");
        let mut tree = PrefixTree::new(root);

        let b1 = id(1, b"b1");
        let b2 = id(2, b"b2");
        tree.insert(root, &[b1, b2], pairs[0].public_key(), &keys).unwrap();

        // names b2 plus an unknown extension: binds to b2
        let unknown = id(3, b"future");
        let voter = pairs[1].public_key();
        let msg = prevote_msg(&pairs[1], 0, root, vec![b1, b2, unknown]);
        let landed = tree
            .add_confirmations(&root, &[b1, b2, unknown], voter, msg)
            .unwrap();

        assert_eq!(landed, b2);
        assert!(tree.find(&b2).unwrap().has_confirmation(&voter));
    }

    #[test]
    fn duplicate_confirmations_keep_the_first_write() {
        let (pairs, keys) = bp_keys(2);
        let root = id(0, b"genesis");
        let mut tree = PrefixTree::new(root);

        let b1 = id(1, b"b1");
        tree.insert(root, &[b1], pairs[0].public_key(), &keys).unwrap();

        let voter = pairs[1].public_key();
        let first = prevote_msg(&pairs[1], 0, root, vec![b1]);
        let second = prevote_msg(&pairs[1], 1, root, vec![b1]);
        tree.add_confirmations(&root, &[b1], voter, first.clone());
        tree.add_confirmations(&root, &[b1], voter, second);

        assert_eq!(tree.find(&b1).unwrap().confirmation_data[&voter], first);
        assert_eq!(tree.confirmation_number(&b1), 1);
    }

    #[test]
    fn confirmation_number_sums_the_subtree() {
        let (pairs, keys) = bp_keys(3);
        let root = id(0, b"genesis");
        let mut tree = PrefixTree::new(root);

        let b1 = id(1, b"b1");
        let b2 = id(2, b"b2");
        tree.insert(root, &[b1, b2], pairs[0].public_key(), &keys).unwrap();

        let k1 = pairs[1].public_key();
        let k2 = pairs[2].public_key();
        tree.add_confirmations(&root, &[b1], k1, prevote_msg(&pairs[1], 0, root, vec![b1]));
        tree.add_confirmations(&root, &[b1, b2], k2, prevote_msg(&pairs[2], 0, root, vec![b1, b2]));

        // the deeper vote counts for the ancestor too
        assert_eq!(tree.confirmation_number(&b2), 1);
        assert_eq!(tree.confirmation_number(&b1), 2);
        assert_eq!(
            tree.confirmation_number(&b1),
            tree.find(&b1).unwrap().confirmation_data.len() + tree.confirmation_number(&b2)
        );
    }

    #[test]
    fn unknown_branch_confirmation_is_rejected() {
        let (pairs, _) = bp_keys(1);
        let mut tree = PrefixTree::new(id(0, b"genesis"));

        let voter = pairs[0].public_key();
        let base = id(5, b"other-chain");
        let msg = prevote_msg(&pairs[0], 0, base, vec![]);
        assert_eq!(tree.add_confirmations(&base, &[], voter, msg), None);
    }

    #[test]
    fn set_root_prunes_the_losing_fork() {
        let (pairs, keys) = bp_keys(2);
        let root = id(0, b"genesis");
        let mut tree = PrefixTree::new(root);

        let a1 = id(1, b"fork-a");
        let a2 = id(2, b"fork-a2");
        let b1 = id(1, b"fork-b");
        tree.insert(root, &[a1, a2], pairs[0].public_key(), &keys).unwrap();
        tree.insert(root, &[b1], pairs[1].public_key(), &keys).unwrap();

        tree.set_root(a1);

        assert_eq!(tree.root_id(), a1);
        assert_eq!(tree.root().parent(), None);
        assert!(tree.contains(&a2));
        assert!(!tree.contains(&root));
        assert!(!tree.contains(&b1));
        assert!(tree.last_inserted_by(&pairs[1].public_key()).is_none());
        assert_eq!(tree.head().block_id, a2);
    }

    #[test]
    fn set_root_with_unknown_id_resets_the_tree() {
        let (pairs, keys) = bp_keys(1);
        let root = id(0, b"genesis");
        let mut tree = PrefixTree::new(root);
        tree.insert(root, &[id(1, b"b1")], pairs[0].public_key(), &keys).unwrap();

        let far = id(50, b"far-ahead");
        tree.set_root(far);

        assert_eq!(tree.root_id(), far);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.head().block_id, far);
    }

    #[test]
    fn set_root_recomputes_head_when_the_head_is_pruned() {
        let (pairs, keys) = bp_keys(2);
        let root = id(0, b"genesis");
        let mut tree = PrefixTree::new(root);

        let a1 = id(1, b"fork-a");
        let a2 = id(2, b"fork-a2");
        let b1 = id(1, b"fork-b");
        tree.insert(root, &[a1, a2], pairs[0].public_key(), &keys).unwrap();
        tree.insert(root, &[b1], pairs[1].public_key(), &keys).unwrap();
        assert_eq!(tree.head().block_id, a2);

        tree.set_root(b1);
        assert_eq!(tree.head().block_id, b1);
    }

    #[test]
    fn remove_confirmations_clears_every_node() {
        let (pairs, keys) = bp_keys(2);
        let root = id(0, b"genesis");
        let mut tree = PrefixTree::new(root);

        let b1 = id(1, b"b1");
        let b2 = id(2, b"b2");
        tree.insert(root, &[b1, b2], pairs[0].public_key(), &keys).unwrap();
        let voter = pairs[1].public_key();
        tree.add_confirmations(&root, &[b1, b2], voter, prevote_msg(&pairs[1], 0, root, vec![b1, b2]));

        tree.remove_confirmations();

        assert_eq!(tree.confirmation_number(&b1), 0);
        assert!(!tree.find(&b2).unwrap().has_confirmation(&voter));
    }
}
