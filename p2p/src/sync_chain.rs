use core::fmt::{Display, Formatter, Result as FmtResult};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use anyhow::Error as AnyhowError;
use derive_more::Display as DeriveDisplay;
use helper_functions::misc;
use itertools::Itertools as _;
use log::{log, Level};
use serde::Serialize;
use thiserror::Error;
use types::{
    config::Config,
    containers::SignedBeaconBlock,
    primitives::{Epoch, Slot, H256},
};

use crate::{
    batch::{Batch, BatchError, BatchMetadata, BatchStatus},
    messages::SyncAction,
    misc::{
        BatchId, BatchProcessResult, ChainId, PeerAction, PeerId, PeerReportReason,
        RangeSyncType, SyncConfig,
    },
};

#[derive(Clone, Copy, PartialEq, Eq, Debug, DeriveDisplay, Serialize)]
pub enum SyncChainStatus {
    Stopped,
    Syncing,
    Synced,
    Error,
}

#[derive(Debug, Error)]
#[error("sync chain {chain_id} failed")]
pub struct SyncChainError {
    pub chain_id: ChainId,
    #[source]
    pub source: BatchError,
}

#[derive(Clone, Debug, Serialize)]
pub struct SyncChainDebugState {
    pub chain_id: ChainId,
    pub sync_type: RangeSyncType,
    pub status: SyncChainStatus,
    pub start_epoch: Epoch,
    pub target_slot: Slot,
    pub target_root: H256,
    pub validated_epochs: u64,
    pub peer_count: usize,
    pub batches: Vec<BatchMetadata>,
}

/// Downloads and processes batches of blocks up to a single target.
///
/// The chain does no I/O. Every method returns the downloads, processing and peer reports it
/// wants performed, and the results are fed back through [`SyncChain::on_download_result`] and
/// [`SyncChain::on_processing_result`].
///
/// Batches are processed strictly in order. A processed batch stays `AwaitingValidation` until a
/// later batch imports blocks on top of it. That is when the chain advances past it.
pub struct SyncChain {
    chain_config: Arc<Config>,
    sync_config: SyncConfig,
    id: ChainId,
    sync_type: RangeSyncType,
    target_slot: Slot,
    target_root: H256,
    status: SyncChainStatus,
    // Batches before this epoch have been validated and dropped.
    start_epoch: Epoch,
    batches: BTreeMap<BatchId, Batch>,
    // Active downloads of each peer.
    peers: HashMap<PeerId, HashSet<BatchId>>,
    to_be_downloaded: BatchId,
    processing_target: BatchId,
    validated_epochs: u64,
}

impl Display for SyncChain {
    fn fmt(&self, formatter: &mut Formatter) -> FmtResult {
        write!(
            formatter,
            "{}-{}-{}",
            self.sync_type, self.target_slot, self.target_root,
        )
    }
}

impl SyncChain {
    #[expect(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        chain_config: Arc<Config>,
        sync_config: SyncConfig,
        id: ChainId,
        sync_type: RangeSyncType,
        start_epoch: Epoch,
        target_slot: Slot,
        target_root: H256,
        peer_id: PeerId,
    ) -> Self {
        let chain = Self {
            chain_config,
            sync_config,
            id,
            sync_type,
            target_slot,
            target_root,
            status: SyncChainStatus::Stopped,
            start_epoch,
            batches: BTreeMap::new(),
            peers: HashMap::from([(peer_id, HashSet::new())]),
            to_be_downloaded: start_epoch,
            processing_target: start_epoch,
            validated_epochs: 0,
        };

        chain.log(
            Level::Debug,
            format_args!("created chain starting at epoch {start_epoch} with peer {peer_id}"),
        );

        chain
    }

    #[must_use]
    pub const fn id(&self) -> ChainId {
        self.id
    }

    #[must_use]
    pub const fn sync_type(&self) -> RangeSyncType {
        self.sync_type
    }

    #[must_use]
    pub const fn status(&self) -> SyncChainStatus {
        self.status
    }

    #[must_use]
    pub const fn is_syncing(&self) -> bool {
        matches!(self.status, SyncChainStatus::Syncing)
    }

    #[must_use]
    pub const fn target_slot(&self) -> Slot {
        self.target_slot
    }

    #[must_use]
    pub const fn target_root(&self) -> H256 {
        self.target_root
    }

    #[must_use]
    pub const fn start_epoch(&self) -> Epoch {
        self.start_epoch
    }

    #[must_use]
    pub const fn validated_epochs(&self) -> u64 {
        self.validated_epochs
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn has_peer(&self, peer_id: PeerId) -> bool {
        self.peers.contains_key(&peer_id)
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers.keys().copied()
    }

    #[must_use]
    pub fn batch(&self, batch_id: BatchId) -> Option<&Batch> {
        self.batches.get(&batch_id)
    }

    #[must_use]
    pub fn debug_state(&self) -> SyncChainDebugState {
        SyncChainDebugState {
            chain_id: self.id,
            sync_type: self.sync_type,
            status: self.status,
            start_epoch: self.start_epoch,
            target_slot: self.target_slot,
            target_root: self.target_root,
            validated_epochs: self.validated_epochs,
            peer_count: self.peers.len(),
            batches: self.batches.values().map(Batch::metadata).collect(),
        }
    }

    pub fn add_peer(&mut self, peer_id: PeerId) -> Vec<SyncAction> {
        let mut actions = vec![];

        if self.peers.insert(peer_id, HashSet::new()).is_none() {
            self.log(Level::Debug, format_args!("added peer {peer_id}"));
            self.request_batches(&mut actions);
        }

        actions
    }

    /// Removes `peer_id` and retries its downloads with other peers.
    pub fn remove_peer(&mut self, peer_id: PeerId) -> Result<Vec<SyncAction>, SyncChainError> {
        let mut actions = vec![];

        let Some(active_downloads) = self.peers.remove(&peer_id) else {
            return Ok(actions);
        };

        self.log(Level::Debug, format_args!("removed peer {peer_id}"));

        for batch_id in active_downloads.into_iter().sorted() {
            if let Some(batch) = self.batches.get_mut(&batch_id) {
                let result = batch.downloading_error();
                self.check(result)?;
            }
        }

        self.request_batches(&mut actions);

        Ok(actions)
    }

    pub fn start_syncing(
        &mut self,
        local_finalized_epoch: Epoch,
    ) -> Result<Vec<SyncAction>, SyncChainError> {
        let mut actions = vec![];

        // Skip batches that are already finalized locally without breaking batch alignment.
        if local_finalized_epoch > self.processing_target {
            let epochs_per_batch = self.sync_config.epochs_per_batch;
            let batches_behind = (local_finalized_epoch - self.start_epoch) / epochs_per_batch;
            let aligned_epoch = self.start_epoch + batches_behind * epochs_per_batch;

            self.advance_chain(aligned_epoch, &mut actions);
        }

        self.status = SyncChainStatus::Syncing;

        self.log(
            Level::Info,
            format_args!(
                "syncing from epoch {} with {} peers",
                self.processing_target,
                self.peers.len(),
            ),
        );

        if self.check_completion(&mut actions) {
            return Ok(actions);
        }

        self.request_batches(&mut actions);
        self.process_next_batch(&mut actions)?;

        Ok(actions)
    }

    /// Stops requesting and processing batches. Downloads in flight are still accepted.
    pub fn stop_syncing(&mut self) {
        if self.is_syncing() {
            self.status = SyncChainStatus::Stopped;
            self.log(Level::Debug, "stopped syncing");
        }
    }

    pub fn on_download_result(
        &mut self,
        batch_id: BatchId,
        peer_id: PeerId,
        result: Result<Vec<Arc<SignedBeaconBlock>>, AnyhowError>,
    ) -> Result<Vec<SyncAction>, SyncChainError> {
        let mut actions = vec![];

        if let Some(active_downloads) = self.peers.get_mut(&peer_id) {
            active_downloads.remove(&batch_id);
        }

        let Some(batch) = self.batches.get_mut(&batch_id) else {
            self.log(
                Level::Debug,
                format_args!("ignoring download of dropped batch {batch_id} from {peer_id}"),
            );
            return Ok(actions);
        };

        if batch.downloading_peer() != Some(peer_id) {
            self.log(
                Level::Debug,
                format_args!("ignoring unexpected download of batch {batch_id} from {peer_id}"),
            );
            return Ok(actions);
        }

        let request = batch.request();

        let result = match result {
            Ok(blocks) if blocks.iter().all(|block| request.contains(block.slot())) => {
                batch.downloading_success(blocks)
            }
            Ok(blocks) => {
                actions.push(SyncAction::ReportPeer {
                    peer_id,
                    action: PeerAction::LowToleranceError,
                    reason: PeerReportReason::BlocksOutsideRequestedRange,
                });

                let result = batch.downloading_error();

                self.log(
                    Level::Warn,
                    format_args!(
                        "peer {peer_id} sent {} blocks for batch {batch_id} \
                         some of which are outside {request:?}",
                        blocks.len(),
                    ),
                );

                result
            }
            Err(error) => {
                let result = batch.downloading_error();

                self.log(
                    Level::Debug,
                    format_args!("failed to download batch {batch_id} from {peer_id}: {error:#}"),
                );

                result
            }
        };

        self.check(result)?;
        self.process_next_batch(&mut actions)?;
        self.request_batches(&mut actions);

        Ok(actions)
    }

    pub fn on_processing_result(
        &mut self,
        batch_id: BatchId,
        result: BatchProcessResult,
    ) -> Result<Vec<SyncAction>, SyncChainError> {
        let mut actions = vec![];

        let Some(batch) = self.batches.get_mut(&batch_id) else {
            self.log(
                Level::Debug,
                format_args!("ignoring processing result of dropped batch {batch_id}"),
            );
            return Ok(actions);
        };

        if batch.status() != BatchStatus::Processing || batch_id != self.processing_target {
            self.log(
                Level::Error,
                format_args!(
                    "unexpected processing result for batch {batch_id} \
                     (processing target: {})",
                    self.processing_target,
                ),
            );
            return Ok(actions);
        }

        match result {
            BatchProcessResult::Success { imported_blocks } => {
                let result = batch.processing_success();
                self.check(result)?;

                self.log(
                    Level::Debug,
                    format_args!("processed batch {batch_id} ({imported_blocks} blocks imported)"),
                );

                // Importing blocks on top of the previous batches proves they were valid.
                if imported_blocks > 0 {
                    self.advance_chain(batch_id, &mut actions);
                }

                self.processing_target += self.sync_config.epochs_per_batch;

                if self.check_completion(&mut actions) {
                    return Ok(actions);
                }
            }
            BatchProcessResult::Failed { imported_blocks } => {
                let result = batch.processing_error();

                self.log(
                    Level::Debug,
                    format_args!(
                        "failed to process batch {batch_id} ({imported_blocks} blocks imported)",
                    ),
                );

                self.check(result)?;

                if imported_blocks > 0 {
                    self.advance_chain(batch_id, &mut actions);
                }

                self.handle_invalid_batch(batch_id)?;
            }
        }

        self.process_next_batch(&mut actions)?;
        self.request_batches(&mut actions);

        Ok(actions)
    }

    // The batches awaiting validation may be the reason the failed batch does not connect.
    // They are downloaded again along with it.
    fn handle_invalid_batch(&mut self, batch_id: BatchId) -> Result<(), SyncChainError> {
        let awaiting_validation = self
            .batches
            .range(..batch_id)
            .filter(|(_, batch)| batch.status() == BatchStatus::AwaitingValidation)
            .map(|(id, _)| *id)
            .collect_vec();

        for id in awaiting_validation {
            if let Some(batch) = self.batches.get_mut(&id) {
                let result = batch.validation_error();
                self.check(result)?;
            }
        }

        self.processing_target = self.start_epoch;

        Ok(())
    }

    /// Drops batches before `validated_epoch` and penalizes peers whose failed attempts they
    /// disprove.
    fn advance_chain(&mut self, validated_epoch: Epoch, actions: &mut Vec<SyncAction>) {
        if validated_epoch <= self.start_epoch {
            return;
        }

        let remaining = self.batches.split_off(&validated_epoch);
        let validated = core::mem::replace(&mut self.batches, remaining);

        for (batch_id, batch) in validated {
            for active_downloads in self.peers.values_mut() {
                active_downloads.remove(&batch_id);
            }

            let Some(valid_attempt) = batch.validation_attempt() else {
                self.log(
                    Level::Debug,
                    format_args!("dropping {batch} that was not processed"),
                );
                continue;
            };

            for attempt in batch.failed_processing_attempts() {
                if attempt.hash == valid_attempt.hash {
                    continue;
                }

                let (action, reason) = if attempt.peer_id == valid_attempt.peer_id {
                    (
                        PeerAction::MidToleranceError,
                        PeerReportReason::BatchReprocessedSamePeer,
                    )
                } else {
                    (
                        PeerAction::LowToleranceError,
                        PeerReportReason::BatchReprocessedOriginalPeer,
                    )
                };

                actions.push(SyncAction::ReportPeer {
                    peer_id: attempt.peer_id,
                    action,
                    reason,
                });
            }
        }

        self.validated_epochs += validated_epoch - self.start_epoch;
        self.start_epoch = validated_epoch;
        self.to_be_downloaded = self.to_be_downloaded.max(validated_epoch);
        self.processing_target = self.processing_target.max(validated_epoch);

        self.log(
            Level::Debug,
            format_args!(
                "advanced to epoch {validated_epoch} ({} epochs validated)",
                self.validated_epochs,
            ),
        );
    }

    // Once the next batch to process starts at the target, every batch is validated.
    fn check_completion(&mut self, actions: &mut Vec<SyncAction>) -> bool {
        if self.batch_start_slot(self.processing_target) < self.target_slot {
            return false;
        }

        self.advance_chain(self.processing_target, actions);
        self.status = SyncChainStatus::Synced;

        self.log(
            Level::Info,
            format_args!("synced after validating {} epochs", self.validated_epochs),
        );

        true
    }

    fn process_next_batch(&mut self, actions: &mut Vec<SyncAction>) -> Result<(), SyncChainError> {
        if !self.is_syncing() {
            return Ok(());
        }

        if self
            .batches
            .values()
            .any(|batch| batch.status() == BatchStatus::Processing)
        {
            return Ok(());
        }

        let Some(batch) = self.batches.get_mut(&self.processing_target) else {
            return Ok(());
        };

        if batch.status() != BatchStatus::AwaitingProcessing {
            return Ok(());
        }

        let result = batch.start_processing();

        match result {
            Ok(blocks) => {
                actions.push(SyncAction::ProcessBatch {
                    chain_id: self.id,
                    batch_id: self.processing_target,
                    blocks,
                });
                Ok(())
            }
            Err(error) => self.check(Err(error)),
        }
    }

    fn request_batches(&mut self, actions: &mut Vec<SyncAction>) {
        if !self.is_syncing() {
            return;
        }

        let idle_peers = self
            .peers
            .iter()
            .filter(|(_, active_downloads)| active_downloads.is_empty())
            .map(|(peer_id, _)| *peer_id)
            .sorted()
            .collect_vec();

        for peer_id in idle_peers {
            // Retries depend on the peer, so later peers may still get work.
            let Some(batch_id) = self.next_batch_for(peer_id) else {
                continue;
            };

            let Some(batch) = self.batches.get_mut(&batch_id) else {
                continue;
            };

            batch.start_downloading(peer_id);

            actions.push(SyncAction::DownloadBatch {
                chain_id: self.id,
                batch_id,
                peer_id,
                request: batch.request(),
            });

            self.peers.entry(peer_id).or_default().insert(batch_id);
        }
    }

    // Retries come first. A retry avoids peers that already failed the batch unless every peer
    // has. New batches are only created while the buffer has room.
    fn next_batch_for(&mut self, peer_id: PeerId) -> Option<BatchId> {
        let retry = self
            .batches
            .iter()
            .filter(|(_, batch)| batch.status() == BatchStatus::AwaitingDownload)
            .find(|(_, batch)| {
                !batch.has_failed_with(peer_id)
                    || self.peers.keys().all(|peer| batch.has_failed_with(*peer))
            })
            .map(|(batch_id, _)| *batch_id);

        if retry.is_some() {
            return retry;
        }

        let in_buffer = self
            .batches
            .values()
            .filter(|batch| {
                matches!(
                    batch.status(),
                    BatchStatus::Downloading | BatchStatus::AwaitingProcessing,
                )
            })
            .count();

        if in_buffer >= self.sync_config.batch_buffer_size {
            return None;
        }

        let batch_id = self.to_be_downloaded;

        if self.batch_start_slot(batch_id) >= self.target_slot {
            return None;
        }

        let request = self.sync_config.batch_request(&self.chain_config, batch_id);

        self.batches.insert(batch_id, Batch::new(batch_id, request));
        self.to_be_downloaded += self.sync_config.epochs_per_batch;

        Some(batch_id)
    }

    fn batch_start_slot(&self, batch_id: BatchId) -> Slot {
        misc::compute_start_slot_at_epoch(&self.chain_config, batch_id)
    }

    fn check(&mut self, result: Result<(), BatchError>) -> Result<(), SyncChainError> {
        match result {
            Ok(()) => Ok(()),
            // Already logged by the batch.
            Err(error) if !error.is_terminal() => Ok(()),
            Err(error) => {
                self.status = SyncChainStatus::Error;
                self.log(Level::Warn, format_args!("failed: {error}"));

                Err(SyncChainError {
                    chain_id: self.id,
                    source: error,
                })
            }
        }
    }

    fn log(&self, level: Level, message: impl Display) {
        log!(level, "[chain {self}] {message}");
    }
}
