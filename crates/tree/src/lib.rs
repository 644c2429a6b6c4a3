//! Prefix chain tree.
//!
//! The tree is the engine's persistent view of candidate forks above the
//! last irreversible block. Each node records who created the block, which
//! block producers are expected to vote on it, and which voters have
//! prevoted for it. Both voting phases query the tree: the prevote phase
//! through [`PrefixTree::add_confirmations`] and the confirmation count,
//! the precommit phase through the per-node confirmation map.
//!
//! A vote on a descendant implicitly confirms every ancestor on the same
//! fork, so a node's confirmation count is its own voter count plus the
//! counts of its whole subtree.

mod tree;

pub use tree::{PrefixTree, TreeError, TreeNode};
