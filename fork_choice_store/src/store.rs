use std::sync::Arc;

use anyhow::{ensure, Result};
use helper_functions::misc;
use im::{HashMap, Vector};
use log::{debug, info, warn};
use types::{
    config::Config,
    containers::Checkpoint,
    primitives::{Epoch, ExecutionBlockHash, Slot, H256},
};

use crate::{
    error::Error,
    misc::{ApplyBlockChanges, ChainLink, ExecutionStatus},
};

/// Blocks from the anchor onward with their execution statuses.
///
/// Cloning is cheap. All collections are persistent.
#[derive(Clone)]
pub struct Store {
    chain_config: Arc<Config>,
    blocks: HashMap<H256, ChainLink>,
    children: HashMap<H256, Vector<H256>>,
    execution_payload_locations: HashMap<ExecutionBlockHash, H256>,
    justified_checkpoint: Checkpoint,
    finalized_checkpoint: Checkpoint,
    anchor_root: H256,
    head_root: H256,
}

impl Store {
    /// Creates a store containing only `anchor`.
    ///
    /// The anchor is trusted. If it has an execution payload, the payload is considered valid.
    #[must_use]
    pub fn new(chain_config: Arc<Config>, mut anchor: ChainLink) -> Self {
        let anchor_root = anchor.block_root;

        let checkpoint = Checkpoint {
            epoch: anchor.epoch(&chain_config),
            root: anchor_root,
        };

        anchor.execution_status = if anchor.execution_block_hash().is_some() {
            ExecutionStatus::Valid
        } else {
            ExecutionStatus::PreMerge
        };

        let mut execution_payload_locations = HashMap::new();

        if let Some(block_hash) = anchor.execution_block_hash() {
            execution_payload_locations.insert(block_hash, anchor_root);
        }

        Self {
            chain_config,
            blocks: HashMap::unit(anchor_root, anchor),
            children: HashMap::new(),
            execution_payload_locations,
            justified_checkpoint: checkpoint,
            finalized_checkpoint: checkpoint,
            anchor_root,
            head_root: anchor_root,
        }
    }

    #[must_use]
    pub fn chain_config(&self) -> &Arc<Config> {
        &self.chain_config
    }

    #[must_use]
    pub const fn justified_checkpoint(&self) -> Checkpoint {
        self.justified_checkpoint
    }

    #[must_use]
    pub const fn finalized_checkpoint(&self) -> Checkpoint {
        self.finalized_checkpoint
    }

    #[must_use]
    pub const fn finalized_epoch(&self) -> Epoch {
        self.finalized_checkpoint.epoch
    }

    #[must_use]
    pub fn finalized_slot(&self) -> Slot {
        misc::compute_start_slot_at_epoch(&self.chain_config, self.finalized_epoch())
    }

    #[must_use]
    pub fn chain_link(&self, block_root: H256) -> Option<&ChainLink> {
        self.blocks.get(&block_root)
    }

    #[must_use]
    pub fn chain_link_by_execution_block_hash(
        &self,
        block_hash: ExecutionBlockHash,
    ) -> Option<&ChainLink> {
        let block_root = self.execution_payload_locations.get(&block_hash)?;
        self.chain_link(*block_root)
    }

    #[must_use]
    pub fn contains_block(&self, block_root: H256) -> bool {
        self.blocks.contains_key(&block_root)
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// # Panics
    ///
    /// Never. The anchor is only replaced with a block that is kept when pruning.
    #[must_use]
    pub fn anchor(&self) -> &ChainLink {
        self.chain_link(self.anchor_root)
            .expect("anchor is always present in the store")
    }

    /// # Panics
    ///
    /// Never. The head is recomputed whenever blocks are removed.
    #[must_use]
    pub fn head(&self) -> &ChainLink {
        self.chain_link(self.head_root)
            .expect("head is always present in the store")
    }

    /// Returns `block_root` followed by its ancestors down to the anchor.
    pub fn chain_ending_with(&self, block_root: H256) -> impl Iterator<Item = &ChainLink> {
        core::iter::successors(self.chain_link(block_root), |chain_link| {
            self.chain_link(chain_link.parent_root())
        })
    }

    /// A block is considered a descendant of itself.
    #[must_use]
    pub fn is_descendant_of(&self, block_root: H256, ancestor_root: H256) -> bool {
        let Some(ancestor) = self.chain_link(ancestor_root) else {
            return false;
        };

        self.chain_ending_with(block_root)
            .take_while(|chain_link| chain_link.slot() >= ancestor.slot())
            .any(|chain_link| chain_link.block_root == ancestor_root)
    }

    /// Returns `block_root` followed by all of its descendants in breadth-first order.
    #[must_use]
    pub fn descendants(&self, block_root: H256) -> Vec<H256> {
        if !self.contains_block(block_root) {
            return vec![];
        }

        let mut roots = vec![block_root];
        let mut next = 0;

        while let Some(root) = roots.get(next).copied() {
            if let Some(children) = self.children.get(&root) {
                roots.extend(children.iter().copied());
            }

            next += 1;
        }

        roots
    }

    /// Adds a fully verified block to the store.
    ///
    /// A block descending from an invalid block is itself recorded as invalid.
    pub fn apply_block(&mut self, mut chain_link: ChainLink) -> Result<ApplyBlockChanges> {
        let block_root = chain_link.block_root;
        let parent_root = chain_link.parent_root();

        ensure!(
            !self.contains_block(block_root),
            Error::BlockAlreadyPresent { block_root },
        );

        let Some(parent) = self.chain_link(parent_root) else {
            return Err(Error::ParentUnknown {
                block_root,
                parent_root,
            }
            .into());
        };

        if parent.is_invalid() {
            chain_link.execution_status = ExecutionStatus::Invalid;
        }

        let old_head = self.head().clone();
        let execution_status = chain_link.execution_status;
        let justified_checkpoint = self.resolve(chain_link.current_justified_checkpoint);
        let finalized_checkpoint = self.resolve(chain_link.finalized_checkpoint);

        if let Some(block_hash) = chain_link.execution_block_hash() {
            self.execution_payload_locations
                .insert(block_hash, block_root);
        }

        self.blocks.insert(block_root, chain_link);
        self.children
            .entry(parent_root)
            .or_insert_with(Vector::new)
            .push_back(block_root);

        if execution_status.is_valid() {
            self.set_ancestor_statuses_valid(block_root);
        }

        let finalized_checkpoint_updated =
            self.update_checkpoints(justified_checkpoint, finalized_checkpoint);

        if finalized_checkpoint_updated {
            self.prune_after_finalization();
        }

        self.update_head();

        let changes = if self.head_root == old_head.block_root {
            ApplyBlockChanges::AlternateChainExtended {
                finalized_checkpoint_updated,
            }
        } else if self.head_root == block_root && parent_root == old_head.block_root {
            ApplyBlockChanges::CanonicalChainExtended {
                finalized_checkpoint_updated,
            }
        } else {
            ApplyBlockChanges::Reorganized {
                finalized_checkpoint_updated,
                old_head: Box::new(old_head),
            }
        };

        Ok(changes)
    }

    /// Records the outcome of validating the payload of `block_root`.
    ///
    /// A valid payload makes all optimistic ancestors valid.
    /// An invalid payload makes all descendants invalid.
    /// Returns `false` if the block is not in the store.
    pub fn set_execution_status(&mut self, block_root: H256, status: ExecutionStatus) -> bool {
        if !self.contains_block(block_root) {
            return false;
        }

        match status {
            ExecutionStatus::Valid => self.set_ancestor_statuses_valid(block_root),
            ExecutionStatus::Invalid => {
                self.invalidate_descendants(block_root);
            }
            ExecutionStatus::PreMerge | ExecutionStatus::Optimistic => {
                self.set_status(block_root, status);
            }
        }

        self.update_head();

        true
    }

    /// Invalidates `block_root` and its ancestors whose payloads come after `latest_valid_hash`.
    ///
    /// The walk stops at the block whose payload has `latest_valid_hash`, at the first block
    /// known to be valid, or at the first block without a payload. A block found with
    /// `latest_valid_hash` is marked valid along with its ancestors. If `latest_valid_hash` is
    /// absent or does not occur in the chain, only `block_root` is invalidated.
    ///
    /// Returns the roots of all blocks that became invalid, descendants included.
    pub fn invalidate_chain_after(
        &mut self,
        block_root: H256,
        latest_valid_hash: Option<ExecutionBlockHash>,
    ) -> Vec<H256> {
        let mut to_invalidate = vec![];
        let mut latest_valid_root = None;
        let mut latest_valid_hash_found = false;

        if let Some(latest_valid_hash) = latest_valid_hash {
            for chain_link in self.chain_ending_with(block_root) {
                match chain_link.execution_block_hash() {
                    Some(hash) if hash == latest_valid_hash => {
                        latest_valid_root = Some(chain_link.block_root);
                        latest_valid_hash_found = true;
                        break;
                    }
                    // The latest valid hash may be the terminal proof-of-work block, which has no
                    // beacon block of its own.
                    None => {
                        latest_valid_hash_found = true;
                        break;
                    }
                    Some(_) if chain_link.is_valid() => break,
                    Some(_) => to_invalidate.push(chain_link.block_root),
                }
            }
        }

        if !latest_valid_hash_found {
            to_invalidate = vec![block_root];
        }

        if let Some(root) = latest_valid_root {
            self.set_ancestor_statuses_valid(root);
        }

        let invalidated = to_invalidate
            .into_iter()
            .flat_map(|root| self.invalidate_descendants(root))
            .collect::<Vec<_>>();

        if !invalidated.is_empty() {
            warn!(
                "invalidated {} blocks after latest valid hash {latest_valid_hash:?}",
                invalidated.len(),
            );
        }

        self.update_head();

        invalidated
    }

    // Checkpoints in states near genesis refer to the zero root instead of the genesis block.
    fn resolve(&self, checkpoint: Checkpoint) -> Checkpoint {
        if checkpoint.root.is_zero() {
            Checkpoint {
                epoch: checkpoint.epoch,
                root: self.anchor_root,
            }
        } else {
            checkpoint
        }
    }

    fn update_checkpoints(
        &mut self,
        justified_checkpoint: Checkpoint,
        finalized_checkpoint: Checkpoint,
    ) -> bool {
        if justified_checkpoint.epoch > self.justified_checkpoint.epoch {
            self.justified_checkpoint = justified_checkpoint;
        }

        if finalized_checkpoint.epoch > self.finalized_checkpoint.epoch {
            self.finalized_checkpoint = finalized_checkpoint;
            return true;
        }

        false
    }

    fn set_status(&mut self, block_root: H256, status: ExecutionStatus) {
        if let Some(chain_link) = self.blocks.get_mut(&block_root) {
            chain_link.execution_status = status;
        }
    }

    fn set_ancestor_statuses_valid(&mut self, block_root: H256) {
        let optimistic = self
            .chain_ending_with(block_root)
            .filter(|chain_link| chain_link.execution_status.is_execution_enabled())
            .take_while(|chain_link| !chain_link.is_valid() || chain_link.block_root == block_root)
            .map(|chain_link| chain_link.block_root)
            .collect::<Vec<_>>();

        for root in optimistic {
            self.set_status(root, ExecutionStatus::Valid);
        }
    }

    fn invalidate_descendants(&mut self, block_root: H256) -> Vec<H256> {
        let invalidated = self
            .descendants(block_root)
            .into_iter()
            .filter(|root| self.chain_link(*root).is_some_and(|link| !link.is_invalid()))
            .collect::<Vec<_>>();

        for root in &invalidated {
            self.set_status(*root, ExecutionStatus::Invalid);
        }

        invalidated
    }

    fn prune_after_finalization(&mut self) {
        let finalized_root = self.finalized_checkpoint.root;

        if finalized_root == self.anchor_root || !self.contains_block(finalized_root) {
            return;
        }

        let kept = self.descendants(finalized_root);
        let mut blocks = HashMap::new();
        let mut children = HashMap::new();

        for root in kept {
            if let Some(chain_link) = self.blocks.get(&root) {
                blocks.insert(root, chain_link.clone());
            }

            if let Some(block_children) = self.children.get(&root) {
                children.insert(root, block_children.clone());
            }
        }

        let pruned = self.blocks.len() - blocks.len();

        self.execution_payload_locations
            .retain(|_, root| blocks.contains_key(root));
        self.blocks = blocks;
        self.children = children;
        self.anchor_root = finalized_root;

        if self.justified_checkpoint.epoch < self.finalized_checkpoint.epoch {
            self.justified_checkpoint = self.finalized_checkpoint;
        }

        info!(
            "finalized epoch {} at block {finalized_root:?}, pruned {pruned} blocks",
            self.finalized_checkpoint.epoch,
        );
    }

    // The head is the highest block that descends from the justified block and is not invalid.
    // Ties are broken by block root.
    fn update_head(&mut self) {
        let justified_root = if self.contains_block(self.justified_checkpoint.root) {
            self.justified_checkpoint.root
        } else {
            self.anchor_root
        };

        let head_root = self
            .descendants(justified_root)
            .into_iter()
            .filter_map(|root| self.chain_link(root))
            .filter(|chain_link| !chain_link.is_invalid())
            .max_by_key(|chain_link| (chain_link.slot(), chain_link.block_root))
            .map_or(justified_root, |chain_link| chain_link.block_root);

        if head_root != self.head_root {
            debug!("head changed from {:?} to {head_root:?}", self.head_root);
            self.head_root = head_root;
        }
    }
}
