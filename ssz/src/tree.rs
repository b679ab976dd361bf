use ethereum_types::H256;
use itertools::Itertools as _;
use triomphe::Arc;

use crate::{error::TreeError, gindex::Gindex, node::Node};

type Result<T, E = TreeError> = core::result::Result<T, E>;

/// A handle to the root of a persistent binary Merkle tree.
///
/// Cloning a `Tree` is cheap and produces an independent snapshot.
/// Writes replace the path from the root to the modified nodes and leave the snapshot intact.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Tree {
    root: Arc<Node>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::zero(0)
    }
}

impl From<Arc<Node>> for Tree {
    fn from(root: Arc<Node>) -> Self {
        Self { root }
    }
}

impl Tree {
    #[must_use]
    pub fn zero(depth: u8) -> Self {
        Self::from(Node::zero(depth))
    }

    /// Builds a tree of `depth` levels with `leaves` on the left and zero leaves after them.
    ///
    /// Zero subtrees on the right are shared with [`Node::zero`].
    /// Leaves that do not fit in the tree are ignored.
    #[must_use]
    pub fn from_leaves(depth: u8, leaves: impl IntoIterator<Item = H256>) -> Self {
        let capacity = 1_u64.checked_shl(depth.into()).unwrap_or(u64::MAX);

        let mut level = leaves
            .into_iter()
            .take(usize::try_from(capacity).unwrap_or(usize::MAX))
            .map(Node::leaf)
            .collect_vec();

        for height in 0..depth {
            if level.is_empty() {
                return Self::zero(depth);
            }

            level = level
                .chunks(2)
                .map(|pair| {
                    let right = pair
                        .get(1)
                        .map_or_else(|| Node::zero(height), Arc::clone);

                    Node::branch(Arc::clone(&pair[0]), right)
                })
                .collect();
        }

        level
            .into_iter()
            .next()
            .map(Self::from)
            .unwrap_or_else(|| Self::zero(depth))
    }

    #[must_use]
    pub const fn root_node(&self) -> &Arc<Node> {
        &self.root
    }

    #[must_use]
    pub fn hash_tree_root(&self) -> H256 {
        self.root.hash_tree_root()
    }

    pub fn get_node(&self, gindex: Gindex) -> Result<&Arc<Node>> {
        Node::descendant(&self.root, gindex).ok_or_else(|| self.leaf_on_path(gindex))
    }

    pub fn set_node(&mut self, gindex: Gindex, node: Arc<Node>) -> Result<()> {
        self.root = replace_descendant(&self.root, gindex, 0, node)?;
        Ok(())
    }

    /// Reads nodes at `gindexes`, visiting every internal node at most once.
    ///
    /// `gindexes` must be sorted in ascending order, free of duplicates and all at the same depth.
    pub fn read_nodes_batch(&self, gindexes: &[Gindex]) -> Result<Vec<Arc<Node>>> {
        let Some(depth) = common_depth(gindexes)? else {
            return Ok(vec![]);
        };

        if depth == 0 {
            return Ok(vec![Arc::clone(&self.root)]);
        }

        let depth_root = usize::from(depth - 1);
        let mut parents = vec![Arc::clone(&self.root); depth_root + 1];
        let mut node = Arc::clone(&self.root);
        let mut depthi = depth_root;
        let mut nodes = Vec::with_capacity(gindexes.len());

        for (position, gindex) in gindexes.iter().copied().enumerate() {
            let index = gindex.index_at_depth();

            for level in (1..=depthi).rev() {
                node = Arc::clone(
                    node.child(is_left(level, index))
                        .ok_or_else(|| self.leaf_on_path(gindex))?,
                );
                parents[level - 1] = Arc::clone(&node);
            }

            let child = node
                .child(is_left(0, index))
                .ok_or_else(|| self.leaf_on_path(gindex))?;

            nodes.push(Arc::clone(child));

            if let Some(next) = gindexes.get(position + 1) {
                depthi = diff_depthi(index, next.index_at_depth());
                node = Arc::clone(&parents[depthi]);
            }
        }

        Ok(nodes)
    }

    /// Replaces nodes at `gindexes` with `nodes` and rebuilds the path to the root once.
    ///
    /// `gindexes` must be sorted in ascending order, free of duplicates and all at the same depth.
    /// Writing a pair of siblings creates a single parent for both.
    pub fn write_nodes_batch(&mut self, gindexes: &[Gindex], nodes: Vec<Arc<Node>>) -> Result<()> {
        if gindexes.len() != nodes.len() {
            return Err(TreeError::LengthMismatch {
                gindexes: gindexes.len(),
                nodes: nodes.len(),
            });
        }

        let Some(depth) = common_depth(gindexes)? else {
            return Ok(());
        };

        let mut nodes = nodes.into_iter();

        if depth == 0 {
            if let Some(node) = nodes.next() {
                self.root = node;
            }

            return Ok(());
        }

        let depth_root = usize::from(depth - 1);
        let mut parents = vec![Arc::clone(&self.root); depth_root + 1];
        let mut pending_left: Vec<Option<Arc<Node>>> = vec![None; depth_root + 1];
        let mut node = Arc::clone(&self.root);
        let mut depthi = depth_root;
        let mut position = 0;

        while position < gindexes.len() {
            let gindex = gindexes[position];
            let index = gindex.index_at_depth();

            for level in (1..=depthi).rev() {
                node = Arc::clone(
                    node.child(is_left(level, index))
                        .ok_or_else(|| self.leaf_on_path(gindex))?,
                );
                parents[level - 1] = Arc::clone(&node);
            }

            let new_node = nodes.next().expect("lengths are checked above");

            node = if index % 2 == 0 {
                let next_is_sibling = gindexes
                    .get(position + 1)
                    .is_some_and(|next| next.index_at_depth() == index + 1);

                if next_is_sibling {
                    position += 1;
                    let right = nodes.next().expect("lengths are checked above");
                    Node::branch(new_node, right)
                } else {
                    let right = node.right().ok_or_else(|| self.leaf_on_path(gindex))?;
                    Node::branch(new_node, Arc::clone(right))
                }
            } else {
                let left = node.left().ok_or_else(|| self.leaf_on_path(gindex))?;
                Node::branch(Arc::clone(left), new_node)
            };

            let next = gindexes.get(position + 1);
            let is_last = next.is_none();
            let target = next.map_or(depth_root, |next| diff_depthi(index, next.index_at_depth()));

            for level in 1..=target {
                let parent = &parents[level];

                if is_left(level, index) {
                    if is_last || level != target {
                        let right = parent.right().ok_or_else(|| self.leaf_on_path(gindex))?;
                        node = Node::branch(node, Arc::clone(right));
                    } else {
                        pending_left[level] = Some(node);
                        node = Arc::clone(parent);
                    }
                } else if let Some(left) = pending_left[level].take() {
                    node = Node::branch(left, node);
                } else {
                    let left = parent.left().ok_or_else(|| self.leaf_on_path(gindex))?;
                    node = Node::branch(Arc::clone(left), node);
                }
            }

            depthi = target;
            position += 1;
        }

        self.root = node;

        Ok(())
    }

    fn leaf_on_path(&self, gindex: Gindex) -> TreeError {
        let depth = gindex
            .path()
            .scan(&self.root, |node, left| {
                let child = node.child(left)?;
                *node = child;
                Some(())
            })
            .count();

        TreeError::PathThroughLeaf {
            gindex,
            depth: u8::try_from(depth).unwrap_or(u8::MAX),
        }
    }
}

fn replace_descendant(
    node: &Arc<Node>,
    gindex: Gindex,
    level: u8,
    replacement: Arc<Node>,
) -> Result<Arc<Node>> {
    if level == gindex.depth() {
        return Ok(replacement);
    }

    let (Some(left), Some(right)) = (node.left(), node.right()) else {
        return Err(TreeError::PathThroughLeaf {
            gindex,
            depth: level,
        });
    };

    if gindex.goes_left_at(level) {
        let left = replace_descendant(left, gindex, level + 1, replacement)?;
        Ok(Node::branch(left, Arc::clone(right)))
    } else {
        let right = replace_descendant(right, gindex, level + 1, replacement)?;
        Ok(Node::branch(Arc::clone(left), right))
    }
}

fn common_depth(gindexes: &[Gindex]) -> Result<Option<u8>> {
    let Some(first) = gindexes.first() else {
        return Ok(None);
    };

    let expected = first.depth();

    for gindex in gindexes {
        let actual = gindex.depth();

        if actual != expected {
            return Err(TreeError::DepthMismatch { expected, actual });
        }
    }

    debug_assert!(
        gindexes.iter().tuple_windows().all(|(a, b)| a < b),
        "generalized indices in a batch must be strictly ascending",
    );

    Ok(Some(expected))
}

// `level` counts from the bottom. Level 0 selects a child of a parent of leaves.
const fn is_left(level: usize, index: u64) -> bool {
    (index >> level) & 1 == 0
}

// Level of the lowest common ancestor of two different indices.
const fn diff_depthi(a: u64, b: u64) -> usize {
    (u64::BITS - 1 - (a ^ b).leading_zeros()) as usize
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;
    use test_case::test_case;

    use super::*;

    #[derive(Clone, Debug)]
    struct BatchCase {
        depth: u8,
        initial: Vec<H256>,
        writes: Vec<(u64, H256)>,
    }

    impl Arbitrary for BatchCase {
        fn arbitrary(g: &mut Gen) -> Self {
            let depth = u8::arbitrary(g) % 8 + 1;
            let width = 1_u64 << depth;

            let initial = (0..u64::arbitrary(g) % (width + 1))
                .map(|_| H256::from_low_u64_le(u64::arbitrary(g)))
                .collect();

            let indices = (0..u64::arbitrary(g) % (width + 1))
                .map(|_| u64::arbitrary(g) % width)
                .collect::<BTreeSet<_>>();

            let writes = indices
                .into_iter()
                .map(|index| (index, H256::from_low_u64_le(u64::arbitrary(g) | 1)))
                .collect();

            Self {
                depth,
                initial,
                writes,
            }
        }
    }

    impl BatchCase {
        fn gindexes(&self) -> Vec<Gindex> {
            self.writes
                .iter()
                .map(|(index, _)| Gindex::from_depth_and_index(self.depth, *index))
                .collect()
        }

        fn nodes(&self) -> Vec<Arc<Node>> {
            self.writes.iter().map(|(_, value)| Node::leaf(*value)).collect()
        }
    }

    #[quickcheck]
    fn batch_write_matches_sequential_writes(case: BatchCase) -> Result<bool> {
        let original = Tree::from_leaves(case.depth, case.initial.iter().copied());

        let mut batched = original.clone();
        batched.write_nodes_batch(&case.gindexes(), case.nodes())?;

        let mut sequential = original.clone();

        for (gindex, node) in case.gindexes().into_iter().zip(case.nodes()) {
            sequential.set_node(gindex, node)?;
        }

        let snapshot_intact = original
            == Tree::from_leaves(case.depth, case.initial.iter().copied());

        Ok(batched.hash_tree_root() == sequential.hash_tree_root() && snapshot_intact)
    }

    #[quickcheck]
    fn batch_read_matches_individual_reads(case: BatchCase) -> Result<bool> {
        let tree = Tree::from_leaves(case.depth, case.initial.iter().copied());
        let gindexes = case.gindexes();
        let batched = tree.read_nodes_batch(&gindexes)?;

        for (gindex, node) in gindexes.into_iter().zip(batched) {
            if !Arc::ptr_eq(tree.get_node(gindex)?, &node) {
                return Ok(false);
            }
        }

        Ok(true)
    }

    #[test_case(0)]
    #[test_case(2)]
    #[test_case(6)]
    fn writing_sibling_pair_matches_two_writes(left_index: u64) -> Result<()> {
        let depth = 3;
        let left = Gindex::from_depth_and_index(depth, left_index);
        let right = Gindex::from_depth_and_index(depth, left_index + 1);
        let original = Tree::from_leaves(depth, (1..=8).map(H256::from_low_u64_be));

        let mut batched = original.clone();
        batched.write_nodes_batch(
            &[left, right],
            vec![
                Node::leaf(H256::repeat_byte(0xaa)),
                Node::leaf(H256::repeat_byte(0xbb)),
            ],
        )?;

        let mut sequential = original;
        sequential.set_node(left, Node::leaf(H256::repeat_byte(0xaa)))?;
        sequential.set_node(right, Node::leaf(H256::repeat_byte(0xbb)))?;

        assert_eq!(batched.hash_tree_root(), sequential.hash_tree_root());

        Ok(())
    }

    #[test]
    fn untouched_subtrees_are_shared_after_write() -> Result<()> {
        let depth = 4;
        let original = Tree::from_leaves(depth, (1..=16).map(H256::from_low_u64_be));
        let mut updated = original.clone();

        updated.write_nodes_batch(
            &[Gindex::from_depth_and_index(depth, 0)],
            vec![Node::leaf(H256::zero())],
        )?;

        let right_half = Gindex::ROOT.right_child();

        assert!(Arc::ptr_eq(
            original.get_node(right_half)?,
            updated.get_node(right_half)?,
        ));
        assert_ne!(original.hash_tree_root(), updated.hash_tree_root());

        Ok(())
    }

    #[test]
    fn leaves_are_merkleized_with_zero_padding() {
        let leaves = [H256::repeat_byte(1), H256::repeat_byte(2), H256::repeat_byte(3)];
        let tree = Tree::from_leaves(2, leaves);

        let expected = hashing::hash_256_256(
            hashing::hash_256_256(leaves[0], leaves[1]),
            hashing::hash_256_256(leaves[2], H256::zero()),
        );

        assert_eq!(tree.hash_tree_root(), expected);
        assert_eq!(tree.hash_tree_root(), crate::merkleize_chunks(leaves, 2));
    }

    #[test]
    fn reading_below_leaves_fails() {
        let tree = Tree::zero(2);
        let too_deep = Gindex::from_depth_and_index(3, 0);

        assert_eq!(
            tree.read_nodes_batch(&[too_deep]),
            Err(TreeError::PathThroughLeaf {
                gindex: too_deep,
                depth: 2,
            }),
        );
    }

    #[test]
    fn batches_of_mixed_depths_are_rejected() {
        let mut tree = Tree::zero(3);

        let result = tree.write_nodes_batch(
            &[
                Gindex::from_depth_and_index(2, 0),
                Gindex::from_depth_and_index(3, 7),
            ],
            vec![Node::zero(1), Node::zero(0)],
        );

        assert_eq!(
            result,
            Err(TreeError::DepthMismatch {
                expected: 2,
                actual: 3,
            }),
        );
    }
}
