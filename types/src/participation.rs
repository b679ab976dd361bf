//! Per-validator participation flags backed by a persistent Merkle tree.
//!
//! Flags are kept twice: in a flat array for reads and in a tree of packed chunks for hashing.
//! Updates made while processing attestations are queued and applied to the tree in one batch.

use core::mem;

use itertools::Itertools as _;
use serde::{Deserialize, Serialize};
use ssz::{Gindex, Node, Tree, TreeError, H256};

use crate::{
    consts::{
        PARTICIPATION_FLAGS_PER_CHUNK, TIMELY_HEAD_FLAG_INDEX, TIMELY_SOURCE_FLAG_INDEX,
        TIMELY_TARGET_FLAG_INDEX, VALIDATOR_REGISTRY_LIMIT,
    },
    primitives::ParticipationFlags,
};

const TREE_DEPTH: u8 = ssz::depth_for_chunk_count(
    (VALIDATOR_REGISTRY_LIMIT / PARTICIPATION_FLAGS_PER_CHUNK) as u64,
);

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct ParticipationStatus {
    pub timely_source: bool,
    pub timely_target: bool,
    pub timely_head: bool,
}

impl From<ParticipationFlags> for ParticipationStatus {
    fn from(flags: ParticipationFlags) -> Self {
        Self {
            timely_source: has_flag(flags, TIMELY_SOURCE_FLAG_INDEX),
            timely_target: has_flag(flags, TIMELY_TARGET_FLAG_INDEX),
            timely_head: has_flag(flags, TIMELY_HEAD_FLAG_INDEX),
        }
    }
}

impl From<ParticipationStatus> for ParticipationFlags {
    fn from(status: ParticipationStatus) -> Self {
        let ParticipationStatus {
            timely_source,
            timely_target,
            timely_head,
        } = status;

        let mut flags = 0;

        if timely_source {
            flags = add_flag(flags, TIMELY_SOURCE_FLAG_INDEX);
        }

        if timely_target {
            flags = add_flag(flags, TIMELY_TARGET_FLAG_INDEX);
        }

        if timely_head {
            flags = add_flag(flags, TIMELY_HEAD_FLAG_INDEX);
        }

        flags
    }
}

#[must_use]
pub const fn add_flag(flags: ParticipationFlags, flag_index: usize) -> ParticipationFlags {
    flags | (1 << flag_index)
}

#[must_use]
pub const fn has_flag(flags: ParticipationFlags, flag_index: usize) -> bool {
    flags & (1 << flag_index) != 0
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(from = "Vec<ParticipationFlags>", into = "Vec<ParticipationFlags>")]
pub struct EpochParticipation {
    flags: Vec<ParticipationFlags>,
    tree: Tree,
    // Validator indices and flags to OR into the tree on the next flush.
    pending: Vec<(usize, ParticipationFlags)>,
}

impl Default for EpochParticipation {
    fn default() -> Self {
        Self::from(vec![])
    }
}

impl PartialEq for EpochParticipation {
    fn eq(&self, other: &Self) -> bool {
        self.flags == other.flags
    }
}

impl Eq for EpochParticipation {}

impl From<Vec<ParticipationFlags>> for EpochParticipation {
    fn from(flags: Vec<ParticipationFlags>) -> Self {
        let tree = build_tree(&flags);

        Self {
            flags,
            tree,
            pending: vec![],
        }
    }
}

impl From<EpochParticipation> for Vec<ParticipationFlags> {
    fn from(participation: EpochParticipation) -> Self {
        participation.flags
    }
}

impl EpochParticipation {
    #[must_use]
    pub fn zeroed(length: usize) -> Self {
        Self::from(vec![0; length])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.flags.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<ParticipationFlags> {
        self.flags.get(index).copied()
    }

    #[must_use]
    pub fn get_status(&self, index: usize) -> Option<ParticipationStatus> {
        self.get(index).map(Into::into)
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = ParticipationFlags> + '_ {
        self.flags.iter().copied()
    }

    #[must_use]
    pub fn has_pending_updates(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Overwrites the flags of one validator in both representations.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn set(&mut self, index: usize, flags: ParticipationFlags) -> Result<(), TreeError> {
        self.flush()?;
        self.flags[index] = flags;
        self.write_chunk(index / PARTICIPATION_FLAGS_PER_CHUNK)
    }

    /// Adds `flags` to the flags of one validator. The tree is updated on the next [`flush`].
    ///
    /// [`flush`]: Self::flush
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn queue_update(&mut self, index: usize, flags: ParticipationFlags) {
        self.flags[index] |= flags;
        self.pending.push((index, flags));
    }

    /// Applies queued updates to the tree with one batch read and one batch write.
    pub fn flush(&mut self) -> Result<(), TreeError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let mut pending = mem::take(&mut self.pending);

        pending.sort_by_key(|(index, _)| *index);

        let updates_by_chunk = pending
            .into_iter()
            .chunk_by(|(index, _)| index / PARTICIPATION_FLAGS_PER_CHUNK);

        let (chunk_indices, updates): (Vec<_>, Vec<_>) = updates_by_chunk
            .into_iter()
            .map(|(chunk_index, updates)| (chunk_index, updates.collect_vec()))
            .unzip();

        let gindexes = chunk_indices
            .iter()
            .map(|chunk_index| Gindex::from_depth_and_index(TREE_DEPTH, *chunk_index as u64))
            .collect_vec();

        let old_leaves = self.tree.read_nodes_batch(&gindexes)?;

        let new_leaves = old_leaves
            .into_iter()
            .zip(updates)
            .map(|(leaf, updates)| {
                let mut bytes = leaf.leaf_value().unwrap_or_default();

                for (index, flags) in updates {
                    bytes.as_bytes_mut()[index % PARTICIPATION_FLAGS_PER_CHUNK] |= flags;
                }

                Node::leaf(bytes)
            })
            .collect();

        self.tree.write_nodes_batch(&gindexes, new_leaves)
    }

    /// Appends a validator.
    pub fn push(&mut self, flags: ParticipationFlags) -> Result<(), TreeError> {
        self.flush()?;
        self.flags.push(flags);
        self.write_chunk((self.flags.len() - 1) / PARTICIPATION_FLAGS_PER_CHUNK)
    }

    /// Removes the last validator.
    pub fn pop(&mut self) -> Result<Option<ParticipationFlags>, TreeError> {
        self.flush()?;

        let Some(flags) = self.flags.pop() else {
            return Ok(None);
        };

        self.write_chunk(self.flags.len() / PARTICIPATION_FLAGS_PER_CHUNK)?;

        Ok(Some(flags))
    }

    /// Replaces all flags and rebuilds the tree in one pass.
    pub fn bulk_replace(&mut self, flags: Vec<ParticipationFlags>) {
        *self = Self::from(flags);
    }

    /// # Panics
    ///
    /// Panics in debug builds if there are updates that have not been flushed.
    #[must_use]
    pub fn hash_tree_root(&self) -> H256 {
        debug_assert!(
            self.pending.is_empty(),
            "participation flags must be flushed before hashing",
        );

        ssz::mix_in_length(self.tree.hash_tree_root(), self.flags.len())
    }

    fn write_chunk(&mut self, chunk_index: usize) -> Result<(), TreeError> {
        let gindex = Gindex::from_depth_and_index(TREE_DEPTH, chunk_index as u64);
        self.tree.set_node(gindex, Node::leaf(chunk(&self.flags, chunk_index)))
    }
}

impl ssz::SszHash for EpochParticipation {
    fn hash_tree_root(&self) -> H256 {
        Self::hash_tree_root(self)
    }
}

fn build_tree(flags: &[ParticipationFlags]) -> Tree {
    let leaves = flags
        .chunks(PARTICIPATION_FLAGS_PER_CHUNK)
        .map(|bytes| {
            let mut leaf = H256::zero();
            leaf[..bytes.len()].copy_from_slice(bytes);
            leaf
        });

    Tree::from_leaves(TREE_DEPTH, leaves)
}

fn chunk(flags: &[ParticipationFlags], chunk_index: usize) -> H256 {
    let start = chunk_index * PARTICIPATION_FLAGS_PER_CHUNK;
    let end = flags.len().min(start + PARTICIPATION_FLAGS_PER_CHUNK);
    let mut leaf = H256::zero();

    if let Some(bytes) = flags.get(start..end) {
        leaf[..bytes.len()].copy_from_slice(bytes);
    }

    leaf
}
