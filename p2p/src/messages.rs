use std::sync::Arc;

use derive_more::Debug;
use futures::channel::mpsc::UnboundedSender;
use log::debug;
use serde::Serialize;
use types::{containers::SignedBeaconBlock, primitives::Slot};

use crate::{
    misc::{
        BatchId, BlocksByRangeRequest, ChainId, PeerAction, PeerId, PeerReportReason,
        RangeSyncType, StatusMessage,
    },
    range_sync::RangeSyncState,
};

/// Work that range sync wants done on its behalf.
#[derive(Debug)]
pub enum SyncAction {
    DownloadBatch {
        chain_id: ChainId,
        batch_id: BatchId,
        peer_id: PeerId,
        request: BlocksByRangeRequest,
    },
    ProcessBatch {
        chain_id: ChainId,
        batch_id: BatchId,
        #[debug("{} blocks", blocks.len())]
        blocks: Vec<Arc<SignedBeaconBlock>>,
    },
    ReportPeer {
        peer_id: PeerId,
        action: PeerAction,
        reason: PeerReportReason,
    },
}

pub enum P2pToSync {
    AddPeer(PeerId, StatusMessage),
    RemovePeer(PeerId),
}

impl P2pToSync {
    pub fn send(self, tx: &UnboundedSender<Self>) {
        if tx.unbounded_send(self).is_err() {
            debug!("send to sync service failed because the receiver was dropped");
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncEvent {
    ChainAdded {
        chain_id: ChainId,
        sync_type: RangeSyncType,
        target_slot: Slot,
    },
    BatchProcessed {
        chain_id: ChainId,
        batch_id: BatchId,
        imported_blocks: usize,
    },
    BatchFailed {
        chain_id: ChainId,
        batch_id: BatchId,
        imported_blocks: usize,
    },
    ChainCompleted {
        chain_id: ChainId,
    },
    ChainFailed {
        chain_id: ChainId,
    },
    StateChanged {
        state: RangeSyncState,
    },
}
