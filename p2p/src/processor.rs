use std::sync::Arc;

use async_trait::async_trait;
use clock::SlotClock;
use database::Storage;
use execution_engine::ExecutionEngine;
use fork_choice_control::{ChainSegmentError, Controller, ImportBlockOptions};
use types::containers::SignedBeaconBlock;

use crate::misc::StatusMessage;

/// Block import as seen by range sync.
#[async_trait]
pub trait ChainSegmentProcessor: Send + Sync {
    /// Status of the local chain as it would be sent in a `Status` handshake.
    fn local_status(&self) -> StatusMessage;

    async fn process_chain_segment(
        &self,
        blocks: Vec<Arc<SignedBeaconBlock>>,
    ) -> Result<(), ChainSegmentError>;
}

// Batches overlap with blocks imported through other chains or before a restart.
const RANGE_SYNC_IMPORT_OPTIONS: ImportBlockOptions = ImportBlockOptions {
    ignore_if_known: true,
    ignore_if_finalized: true,
    valid_signatures: false,
    valid_proposer_signature: false,
};

#[async_trait]
impl<E, S, C> ChainSegmentProcessor for Controller<E, S, C>
where
    E: ExecutionEngine,
    S: Storage,
    C: SlotClock,
{
    fn local_status(&self) -> StatusMessage {
        let store = self.store_snapshot();
        let head = store.head();
        let finalized_checkpoint = store.finalized_checkpoint();

        StatusMessage {
            finalized_root: finalized_checkpoint.root,
            finalized_epoch: finalized_checkpoint.epoch,
            head_root: head.block_root,
            head_slot: head.slot(),
        }
    }

    async fn process_chain_segment(
        &self,
        blocks: Vec<Arc<SignedBeaconBlock>>,
    ) -> Result<(), ChainSegmentError> {
        Self::process_chain_segment(self, blocks, RANGE_SYNC_IMPORT_OPTIONS).await
    }
}
