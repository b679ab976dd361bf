use ethereum_types::H256;
use hashing::{MAX_ZERO_HASH_DEPTH, ZERO_HASHES};
use once_cell::sync::{Lazy, OnceCell};
use static_assertions::assert_impl_all;
use triomphe::Arc;

use crate::gindex::Gindex;

static ZERO_NODES: Lazy<Vec<Arc<Node>>> = Lazy::new(|| {
    let mut nodes = Vec::with_capacity(MAX_ZERO_HASH_DEPTH + 1);
    let mut node = Arc::new(Node::Leaf(H256::zero()));

    nodes.push(Arc::clone(&node));

    for height in 1..=MAX_ZERO_HASH_DEPTH {
        node = Arc::new(Node::Branch {
            left: Arc::clone(&node),
            right: Arc::clone(&node),
            root: OnceCell::with_value(ZERO_HASHES[height]),
        });

        nodes.push(Arc::clone(&node));
    }

    nodes
});

/// An immutable node of a persistent binary Merkle tree.
///
/// Nodes are never modified after construction. Updates create new nodes along the path to the
/// root and share every other subtree with the old version.
#[derive(Debug)]
pub enum Node {
    Leaf(H256),
    Branch {
        left: Arc<Self>,
        right: Arc<Self>,
        root: OnceCell<H256>,
    },
}

assert_impl_all!(Node: Send, Sync);

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.hash_tree_root() == other.hash_tree_root()
    }
}

impl Eq for Node {}

impl Node {
    #[must_use]
    pub fn leaf(value: H256) -> Arc<Self> {
        Arc::new(Self::Leaf(value))
    }

    #[must_use]
    pub fn branch(left: Arc<Self>, right: Arc<Self>) -> Arc<Self> {
        Arc::new(Self::Branch {
            left,
            right,
            root: OnceCell::new(),
        })
    }

    /// The root of a tree of `height` levels filled with zero leaves.
    ///
    /// # Panics
    ///
    /// Panics if `height` exceeds [`MAX_ZERO_HASH_DEPTH`].
    #[must_use]
    pub fn zero(height: u8) -> Arc<Self> {
        Arc::clone(&ZERO_NODES[usize::from(height)])
    }

    #[must_use]
    pub fn hash_tree_root(&self) -> H256 {
        match self {
            Self::Leaf(value) => *value,
            Self::Branch { left, right, root } => *root.get_or_init(|| {
                hashing::hash_256_256(left.hash_tree_root(), right.hash_tree_root())
            }),
        }
    }

    #[must_use]
    pub const fn leaf_value(&self) -> Option<H256> {
        match self {
            Self::Leaf(value) => Some(*value),
            Self::Branch { .. } => None,
        }
    }

    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    #[must_use]
    pub const fn left(&self) -> Option<&Arc<Self>> {
        match self {
            Self::Leaf(_) => None,
            Self::Branch { left, .. } => Some(left),
        }
    }

    #[must_use]
    pub const fn right(&self) -> Option<&Arc<Self>> {
        match self {
            Self::Leaf(_) => None,
            Self::Branch { right, .. } => Some(right),
        }
    }

    #[must_use]
    pub const fn child(&self, left: bool) -> Option<&Arc<Self>> {
        if left {
            self.left()
        } else {
            self.right()
        }
    }

    /// Follows `gindex` starting from `self`. Returns `None` if the path runs into a leaf.
    #[must_use]
    pub fn descendant(node: &Arc<Self>, gindex: Gindex) -> Option<&Arc<Self>> {
        gindex.path().try_fold(node, |node, left| node.child(left))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_nodes_have_precomputed_roots() {
        for height in [0, 1, 7, 40] {
            assert_eq!(
                Node::zero(height).hash_tree_root(),
                ZERO_HASHES[usize::from(height)],
            );
        }
    }

    #[test]
    fn branch_root_is_hash_of_children() {
        let left = Node::leaf(H256::repeat_byte(1));
        let right = Node::leaf(H256::repeat_byte(2));
        let expected = hashing::hash_256_256(H256::repeat_byte(1), H256::repeat_byte(2));

        assert_eq!(Node::branch(left, right).hash_tree_root(), expected);
    }

    #[test]
    fn zero_subtrees_are_shared() {
        let zero = Node::zero(3);
        let left = zero.left().expect("zero node of height 3 is a branch");
        let right = zero.right().expect("zero node of height 3 is a branch");

        assert!(Arc::ptr_eq(left, right));
        assert!(Arc::ptr_eq(left, &Node::zero(2)));
    }
}
