use execution_engine::PayloadValidationStatus;
use thiserror::Error;
use types::primitives::{ExecutionBlockHash, Slot, H256};

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("parent of block {block_root:?} is unknown: {parent_root:?}")]
    ParentUnknown { block_root: H256, parent_root: H256 },
    #[error("genesis block cannot be imported")]
    GenesisBlock,
    #[error("block at slot {block_slot} would revert finalized slot {finalized_slot}")]
    WouldRevertFinalizedSlot { block_slot: Slot, finalized_slot: Slot },
    #[error("block at slot {block_slot} is from the future (current slot: {current_slot})")]
    FutureSlot { block_slot: Slot, current_slot: Slot },
    #[error("block {block_root:?} is already known")]
    AlreadyKnown { block_root: H256 },
    #[error(
        "state root of block {block_root:?} is incorrect \
         (computed: {computed:?}, in_block: {in_block:?})"
    )]
    InvalidStateRoot {
        block_root: H256,
        computed: H256,
        in_block: H256,
    },
    #[error("chain segment contains an invalid signature: {message}")]
    InvalidSignature { message: String },
    #[error(
        "execution engine rejected payload of block {block_root:?} \
         (status: {status:?}, latest_valid_hash: {latest_valid_hash:?}, \
         validation_error: {validation_error:?})"
    )]
    ExecutionEngineError {
        block_root: H256,
        status: PayloadValidationStatus,
        latest_valid_hash: Option<ExecutionBlockHash>,
        validation_error: Option<String>,
    },
    #[error(
        "payload of block at slot {block_slot} is not validated \
         and cannot be imported optimistically (current slot: {current_slot})"
    )]
    UnsafeOptimisticImport { block_slot: Slot, current_slot: Slot },
    #[error("state transition failed for block {block_root:?}: {message}")]
    StateTransition { block_root: H256, message: String },
    #[error("failed to archive block {block_root:?}: {message}")]
    Archive { block_root: H256, message: String },
    #[error("failed to apply block {block_root:?} to fork choice store: {message}")]
    StoreUpdate { block_root: H256, message: String },
    #[error("verification aborted")]
    Aborted,
}

#[derive(Debug, Error)]
#[error("chain segment failed after importing {imported_blocks} blocks")]
pub struct ChainSegmentError {
    #[source]
    pub error: BlockError,
    pub imported_blocks: usize,
}
