// Chain segments are imported one at a time. Verification works on a snapshot of `Store` taken
// when the segment starts. Changes are applied to a clone of the latest snapshot and published
// atomically, so queries never wait for verification and never observe a partially applied
// segment.

use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;
use clock::SlotClock;
use database::Storage;
use execution_engine::{ExecutionEngine, PayloadStatusV1, PayloadValidationStatus};
use fork_choice_store::{ChainLink, ExecutionStatus, Store};
use helper_functions::{epoch_context::CachedBeaconState, misc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use thiserror::Error;
use transition_functions::process_slots;
use types::{
    config::Config,
    consts::GENESIS_SLOT,
    containers::{Checkpoint, SignedBeaconBlock},
    primitives::{Slot, H256},
};

use crate::{
    block_verifier::{self, BlockWithRoot, OptimisticImportPolicy, VerifiedBlock},
    error::{BlockError, ChainSegmentError},
    misc::ImportBlockOptions,
    state_cache::StateCache,
    storage::Archive,
};

pub struct Controller<E, S, C> {
    chain_config: Arc<Config>,
    // The latest consistent snapshot of the store.
    store_snapshot: ArcSwap<Store>,
    // Held for the whole duration of a segment import.
    import_lock: tokio::sync::Mutex<()>,
    // Held while a new snapshot is being built.
    mutation_lock: Mutex<()>,
    state_cache: StateCache,
    archive: Archive<S>,
    execution_engine: E,
    clock: C,
}

impl<E, S, C> Controller<E, S, C>
where
    E: ExecutionEngine,
    S: Storage,
    C: SlotClock,
{
    /// Creates a controller whose store contains only `anchor_block`.
    ///
    /// The anchor is archived immediately.
    pub fn new(
        chain_config: Arc<Config>,
        anchor_block: Arc<SignedBeaconBlock>,
        anchor_state: CachedBeaconState,
        execution_engine: E,
        storage: S,
        clock: C,
    ) -> Result<Self> {
        let anchor_root = anchor_block.root();
        let archive = Archive::new(Arc::clone(&chain_config), storage);

        archive.save_block(anchor_root, &anchor_block)?;
        archive.save_state(anchor_root, &anchor_state)?;

        let anchor = ChainLink::new(
            anchor_root,
            anchor_block,
            Arc::new(anchor_state),
            ExecutionStatus::PreMerge,
        );

        let store = Store::new(Arc::clone(&chain_config), anchor);

        info!(
            "starting from anchor {anchor_root:?} at slot {}",
            store.anchor().slot(),
        );

        Ok(Self {
            chain_config,
            store_snapshot: ArcSwap::from_pointee(store),
            import_lock: tokio::sync::Mutex::new(()),
            mutation_lock: Mutex::new(()),
            state_cache: StateCache::default(),
            archive,
            execution_engine,
            clock,
        })
    }

    /// Creates a controller anchored at the most recent state in `storage`.
    pub fn from_storage(
        chain_config: Arc<Config>,
        execution_engine: E,
        storage: S,
        clock: C,
    ) -> Result<Self> {
        let archive = Archive::new(Arc::clone(&chain_config), storage);

        let Some((anchor_block, anchor_state)) = archive.latest_state()? else {
            return Err(Error::NoArchivedState.into());
        };

        Self::new(
            chain_config,
            anchor_block,
            anchor_state,
            execution_engine,
            archive.into_storage(),
            clock,
        )
    }

    #[must_use]
    pub const fn chain_config(&self) -> &Arc<Config> {
        &self.chain_config
    }

    #[must_use]
    pub fn store_snapshot(&self) -> Arc<Store> {
        self.store_snapshot.load_full()
    }

    #[must_use]
    pub fn head(&self) -> ChainLink {
        self.store_snapshot.load().head().clone()
    }

    #[must_use]
    pub fn head_slot(&self) -> Slot {
        self.store_snapshot.load().head().slot()
    }

    #[must_use]
    pub fn finalized_checkpoint(&self) -> Checkpoint {
        self.store_snapshot.load().finalized_checkpoint()
    }

    #[must_use]
    pub const fn archive(&self) -> &Archive<S> {
        &self.archive
    }

    #[must_use]
    pub const fn execution_engine(&self) -> &E {
        &self.execution_engine
    }

    /// Verifies and imports `blocks`, which must form a chain in ascending slot order.
    ///
    /// State transitions and payloads are verified one epoch at a time. The signatures of the
    /// whole segment are verified in one batch before any block is imported, so an invalid
    /// signature rejects the entire segment. Otherwise blocks before the first failing one are
    /// imported and the error reports how many there were.
    pub async fn process_chain_segment(
        &self,
        blocks: Vec<Arc<SignedBeaconBlock>>,
        options: ImportBlockOptions,
    ) -> Result<(), ChainSegmentError> {
        let _import_guard = self.import_lock.lock().await;

        let segment_length = blocks.len();

        let relevant = block_verifier::sanity_check(
            &self.store_snapshot.load(),
            blocks,
            options,
            self.latest_acceptable_slot(),
        )
        .map_err(|error| ChainSegmentError {
            error,
            imported_blocks: 0,
        })?;

        if relevant.is_empty() {
            debug!("all {segment_length} blocks in chain segment were ignored");
            return Ok(());
        }

        let mut verified = vec![];
        let mut signature_sets = vec![];
        let mut failure = None;
        let mut parent_state = None;

        for epoch_blocks in relevant.chunk_by(|(_, first), (_, second)| {
            self.epoch_at_slot(first.slot()) == self.epoch_at_slot(second.slot())
        }) {
            let outcome = self
                .verify_epoch_blocks(epoch_blocks, parent_state.take(), options)
                .await;

            match outcome.signature_sets {
                Ok(epoch_sets) => signature_sets.extend(epoch_sets),
                Err(error) => return Err(rejected_segment(error, segment_length)),
            }

            parent_state = outcome
                .verified
                .last()
                .map(|verified_block| Arc::clone(&verified_block.state));

            verified.extend(outcome.verified);

            if let Some(error) = outcome.error {
                failure = Some((error, epoch_blocks));
                break;
            }
        }

        if let Err(error) = block_verifier::verify_signature_sets(signature_sets).await {
            return Err(rejected_segment(error, segment_length));
        }

        let imported_blocks = self.commit(verified).map_err(|(error, imported_blocks)| {
            warn!(
                "chain segment of {segment_length} blocks could not be committed \
                 after importing {imported_blocks}: {error}",
            );

            ChainSegmentError {
                error,
                imported_blocks,
            }
        })?;

        if let Some((error, epoch_blocks)) = failure {
            self.handle_invalid_payload(&error, epoch_blocks);

            warn!(
                "chain segment of {segment_length} blocks failed \
                 after importing {imported_blocks}: {error}",
            );

            return Err(ChainSegmentError {
                error,
                imported_blocks,
            });
        }

        info!(
            "imported {imported_blocks} of {segment_length} blocks (head slot: {})",
            self.head_slot(),
        );

        Ok(())
    }

    /// Records the result of a later payload validation for an imported block.
    ///
    /// Returns `false` if the block is not in the store.
    pub fn on_payload_status(&self, block_root: H256, payload_status: &PayloadStatusV1) -> bool {
        self.update_store(|store| {
            let Some(parent_root) = store.chain_link(block_root).map(ChainLink::parent_root)
            else {
                return false;
            };

            match payload_status.status {
                PayloadValidationStatus::Valid => {
                    store.set_execution_status(block_root, ExecutionStatus::Valid)
                }
                PayloadValidationStatus::Invalid => {
                    match payload_status.latest_valid_hash {
                        Some(latest_valid_hash) if store.contains_block(parent_root) => {
                            store.set_execution_status(block_root, ExecutionStatus::Invalid);
                            store.invalidate_chain_after(parent_root, Some(latest_valid_hash));
                            true
                        }
                        _ => store.set_execution_status(block_root, ExecutionStatus::Invalid),
                    }
                }
                PayloadValidationStatus::InvalidBlockHash => {
                    store.set_execution_status(block_root, ExecutionStatus::Invalid)
                }
                PayloadValidationStatus::Syncing
                | PayloadValidationStatus::Accepted
                | PayloadValidationStatus::InvalidTerminalBlock
                | PayloadValidationStatus::ElError
                | PayloadValidationStatus::Unavailable => true,
            }
        })
    }

    // `parent_state` is the post-state of the last block of the previous epoch in the segment.
    // The first epoch starts from a state in the store.
    async fn verify_epoch_blocks(
        &self,
        blocks: &[BlockWithRoot],
        parent_state: Option<Arc<CachedBeaconState>>,
        options: ImportBlockOptions,
    ) -> block_verifier::EpochOutcome {
        let store = self.store_snapshot.load_full();

        // `chunk_by` never yields empty slices.
        let (first_root, first_block) = &blocks[0];

        let pre_state = match parent_state {
            Some(state) => advance_state(state, first_block.slot()),
            None => self.state_cache.state_at_slot(
                &store,
                first_block.parent_root(),
                first_block.slot(),
            ),
        };

        let pre_state = match pre_state {
            Ok(state) => state,
            Err(error) => {
                return block_verifier::EpochOutcome {
                    verified: vec![],
                    signature_sets: Ok(vec![]),
                    error: Some(BlockError::StateTransition {
                        block_root: *first_root,
                        message: format!("{error:#}"),
                    }),
                }
            }
        };

        let justified_execution_enabled = store
            .chain_link(store.justified_checkpoint().root)
            .is_some_and(|chain_link| chain_link.execution_status.is_execution_enabled());

        let policy = OptimisticImportPolicy {
            justified_execution_enabled,
            current_slot: self.current_slot(),
            safe_slots_to_import_optimistically: self
                .chain_config
                .safe_slots_to_import_optimistically,
        };

        block_verifier::verify_epoch_segment(
            blocks,
            &pre_state,
            options,
            &self.execution_engine,
            policy,
        )
        .await
    }

    // Blocks are applied in order. The first failure stops the commit. Blocks applied before it
    // stay in the store and are counted in the error.
    fn commit(&self, verified: Vec<VerifiedBlock>) -> Result<usize, (BlockError, usize)> {
        if verified.is_empty() {
            return Ok(0);
        }

        self.update_store(|store| {
            let mut imported = 0;

            for verified_block in verified {
                let VerifiedBlock {
                    block_root,
                    block,
                    state,
                    execution_status,
                } = verified_block;

                let parent_slot = store
                    .chain_link(block.parent_root())
                    .map_or(GENESIS_SLOT, ChainLink::slot);

                self.archive_block(block_root, &block, parent_slot, &state)
                    .map_err(|error| {
                        let message = format!("{error:#}");
                        (BlockError::Archive { block_root, message }, imported)
                    })?;

                let chain_link = ChainLink::new(block_root, block, state, execution_status);

                let changes = store.apply_block(chain_link).map_err(|error| {
                    let message = format!("{error:#}");
                    (BlockError::StoreUpdate { block_root, message }, imported)
                })?;

                if changes.finalized_checkpoint_updated() {
                    self.state_cache.prune(store.finalized_slot());
                }

                debug!("imported block {block_root:?} ({execution_status:?}): {changes:?}");

                imported += 1;
            }

            Ok(imported)
        })
    }

    fn archive_block(
        &self,
        block_root: H256,
        block: &SignedBeaconBlock,
        parent_slot: Slot,
        state: &CachedBeaconState,
    ) -> Result<()> {
        self.archive.save_block(block_root, block)?;
        self.archive
            .save_state_if_epoch_boundary(block_root, parent_slot, state)?;
        Ok(())
    }

    // An invalid payload poisons its ancestors back to the latest valid hash.
    // The block itself was never imported.
    fn handle_invalid_payload(&self, error: &BlockError, blocks: &[BlockWithRoot]) {
        let BlockError::ExecutionEngineError {
            block_root,
            status: PayloadValidationStatus::Invalid,
            latest_valid_hash: Some(latest_valid_hash),
            ..
        } = error
        else {
            return;
        };

        let Some((_, block)) = blocks.iter().find(|(root, _)| root == block_root) else {
            return;
        };

        let parent_root = block.parent_root();

        let invalidated = self.update_store(|store| {
            store.invalidate_chain_after(parent_root, Some(*latest_valid_hash))
        });

        if !invalidated.is_empty() {
            warn!(
                "payload of block {block_root:?} is invalid; \
                 invalidated {} ancestors and descendants",
                invalidated.len(),
            );
        }
    }

    fn update_store<T>(&self, update: impl FnOnce(&mut Store) -> T) -> T {
        let _mutation_guard = self.mutation_lock.lock();
        let mut store = Store::clone(&self.store_snapshot.load());
        let output = update(&mut store);
        self.store_snapshot.store(Arc::new(store));
        output
    }

    fn epoch_at_slot(&self, slot: Slot) -> u64 {
        misc::compute_epoch_at_slot(&self.chain_config, slot)
    }

    // A clock set before the Unix epoch makes every block look like it is from the future.
    fn current_slot(&self) -> Slot {
        self.clock.current_slot().unwrap_or(GENESIS_SLOT)
    }

    fn latest_acceptable_slot(&self) -> Slot {
        self.clock
            .current_slot_bounds()
            .map_or(GENESIS_SLOT, |bounds| bounds.latest)
    }
}

fn rejected_segment(error: BlockError, segment_length: usize) -> ChainSegmentError {
    warn!("rejected chain segment of {segment_length} blocks: {error}");

    ChainSegmentError {
        error,
        imported_blocks: 0,
    }
}

fn advance_state(state: Arc<CachedBeaconState>, slot: Slot) -> Result<Arc<CachedBeaconState>> {
    if slot <= state.slot() {
        return Ok(state);
    }

    let mut advanced = CachedBeaconState::clone(&state);
    process_slots(&mut advanced, slot)?;
    Ok(Arc::new(advanced))
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage contains no archived state")]
    NoArchivedState,
}
