//! Range sync: downloading blocks from peers in batches and importing them in order.
//!
//! [`RangeSync`] groups peers into [`SyncChain`]s by the target they advertise. Each chain splits
//! the range up to its target into [`Batch`]es that are downloaded concurrently and processed
//! strictly in order. [`SyncService`] drives all of it against a [`SyncNetwork`] and a
//! [`ChainSegmentProcessor`].

pub use crate::{
    batch::{Attempt, Batch, BatchError, BatchMetadata, BatchState, BatchStatus},
    messages::{P2pToSync, SyncAction, SyncEvent},
    misc::{
        BatchId, BatchProcessResult, BlocksByRangeRequest, ChainId, PeerAction, PeerId,
        PeerReportReason, RangeSyncType, StatusMessage, SyncConfig, BATCH_BUFFER_SIZE,
        BLOCKS_BY_RANGE_TIMEOUT, EPOCHS_PER_BATCH, MAX_BATCH_DOWNLOAD_ATTEMPTS,
        MAX_BATCH_PROCESSING_ATTEMPTS, MIN_FINALIZED_CHAIN_VALIDATED_EPOCHS, PARALLEL_HEAD_CHAINS,
        SYNC_EVENT_CHANNEL_CAPACITY,
    },
    network::SyncNetwork,
    processor::ChainSegmentProcessor,
    range_sync::{RangeSync, RangeSyncState},
    sync_chain::{SyncChain, SyncChainDebugState, SyncChainError, SyncChainStatus},
    sync_service::{RequestTimedOut, SyncService},
};

mod batch;
mod messages;
mod misc;
mod network;
mod processor;
mod range_sync;
mod sync_chain;
mod sync_service;
