use core::fmt::{Display, Formatter, Result as FmtResult};
use std::sync::Arc;

use derive_more::Debug;
use log::error;
use serde::Serialize;
use strum::{Display as StrumDisplay, IntoStaticStr};
use thiserror::Error;
use types::{
    containers::SignedBeaconBlock,
    primitives::{Epoch, H256},
};

use crate::misc::{
    BlocksByRangeRequest, PeerId, MAX_BATCH_DOWNLOAD_ATTEMPTS, MAX_BATCH_PROCESSING_ATTEMPTS,
};

/// Identifies a set of blocks served by a peer.
///
/// Two attempts with different hashes mean a peer served different blocks for the same range.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Attempt {
    pub peer_id: PeerId,
    pub hash: H256,
}

impl Attempt {
    fn new(peer_id: PeerId, blocks: &[Arc<SignedBeaconBlock>]) -> Self {
        let hash = blocks
            .iter()
            .map(|block| block.root())
            .fold(H256::zero(), hashing::hash_256_256);

        Self { peer_id, hash }
    }
}

#[derive(Clone, Debug)]
pub enum BatchState {
    AwaitingDownload,
    Downloading {
        peer_id: PeerId,
    },
    AwaitingProcessing {
        peer_id: PeerId,
        #[debug("{} blocks", blocks.len())]
        blocks: Vec<Arc<SignedBeaconBlock>>,
    },
    Processing(Attempt),
    AwaitingValidation(Attempt),
}

impl BatchState {
    #[must_use]
    pub const fn status(&self) -> BatchStatus {
        match self {
            Self::AwaitingDownload => BatchStatus::AwaitingDownload,
            Self::Downloading { .. } => BatchStatus::Downloading,
            Self::AwaitingProcessing { .. } => BatchStatus::AwaitingProcessing,
            Self::Processing(_) => BatchStatus::Processing,
            Self::AwaitingValidation(_) => BatchStatus::AwaitingValidation,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, StrumDisplay, IntoStaticStr, Serialize)]
pub enum BatchStatus {
    AwaitingDownload,
    Downloading,
    AwaitingProcessing,
    Processing,
    AwaitingValidation,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub struct BatchMetadata {
    pub start_epoch: Epoch,
    pub status: BatchStatus,
}

#[derive(Clone, PartialEq, Eq, Debug, Error)]
pub enum BatchError {
    #[error("batch {start_epoch} is {actual} but must be {expected}")]
    WrongStatus {
        start_epoch: Epoch,
        expected: BatchStatus,
        actual: BatchStatus,
    },
    #[error("batch {start_epoch} failed to download {attempts} times")]
    MaxDownloadAttempts { start_epoch: Epoch, attempts: usize },
    #[error("batch {start_epoch} failed processing {attempts} times")]
    MaxProcessingAttempts { start_epoch: Epoch, attempts: usize },
}

impl BatchError {
    /// Terminal errors make the whole chain fail.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::WrongStatus { .. })
    }
}

/// A range of blocks downloaded and processed together.
///
/// Transitions are linear:
/// `AwaitingDownload → Downloading → AwaitingProcessing → Processing → AwaitingValidation`.
/// Failures send the batch back to `AwaitingDownload` until it runs out of attempts.
/// A transition attempted from the wrong state is logged and leaves the batch unchanged.
#[derive(Debug)]
pub struct Batch {
    start_epoch: Epoch,
    request: BlocksByRangeRequest,
    state: BatchState,
    failed_download_peers: Vec<PeerId>,
    failed_processing_attempts: Vec<Attempt>,
}

impl Display for Batch {
    fn fmt(&self, formatter: &mut Formatter) -> FmtResult {
        write!(
            formatter,
            "batch {} (slots {}..{}, {})",
            self.start_epoch,
            self.request.start_slot,
            self.request.start_slot + self.request.count,
            self.state.status(),
        )
    }
}

impl Batch {
    #[must_use]
    pub const fn new(start_epoch: Epoch, request: BlocksByRangeRequest) -> Self {
        Self {
            start_epoch,
            request,
            state: BatchState::AwaitingDownload,
            failed_download_peers: vec![],
            failed_processing_attempts: vec![],
        }
    }

    #[must_use]
    pub const fn start_epoch(&self) -> Epoch {
        self.start_epoch
    }

    #[must_use]
    pub const fn request(&self) -> BlocksByRangeRequest {
        self.request
    }

    #[must_use]
    pub const fn state(&self) -> &BatchState {
        &self.state
    }

    #[must_use]
    pub const fn status(&self) -> BatchStatus {
        self.state.status()
    }

    #[must_use]
    pub const fn metadata(&self) -> BatchMetadata {
        BatchMetadata {
            start_epoch: self.start_epoch,
            status: self.status(),
        }
    }

    #[must_use]
    pub fn failed_download_peers(&self) -> &[PeerId] {
        &self.failed_download_peers
    }

    #[must_use]
    pub fn failed_processing_attempts(&self) -> &[Attempt] {
        &self.failed_processing_attempts
    }

    #[must_use]
    pub const fn downloading_peer(&self) -> Option<PeerId> {
        match self.state {
            BatchState::Downloading { peer_id } => Some(peer_id),
            _ => None,
        }
    }

    #[must_use]
    pub const fn validation_attempt(&self) -> Option<Attempt> {
        match self.state {
            BatchState::AwaitingValidation(attempt) => Some(attempt),
            _ => None,
        }
    }

    #[must_use]
    pub fn has_failed_with(&self, peer_id: PeerId) -> bool {
        self.failed_download_peers.contains(&peer_id)
            || self
                .failed_processing_attempts
                .iter()
                .any(|attempt| attempt.peer_id == peer_id)
    }

    pub fn start_downloading(&mut self, peer_id: PeerId) {
        if matches!(self.state, BatchState::AwaitingDownload) {
            self.state = BatchState::Downloading { peer_id };
        } else {
            self.wrong_status(BatchStatus::AwaitingDownload);
        }
    }

    pub fn downloading_success(
        &mut self,
        blocks: Vec<Arc<SignedBeaconBlock>>,
    ) -> Result<(), BatchError> {
        let BatchState::Downloading { peer_id } = self.state else {
            return Err(self.wrong_status(BatchStatus::Downloading));
        };

        self.state = BatchState::AwaitingProcessing { peer_id, blocks };

        Ok(())
    }

    pub fn downloading_error(&mut self) -> Result<(), BatchError> {
        let BatchState::Downloading { peer_id } = self.state else {
            return Err(self.wrong_status(BatchStatus::Downloading));
        };

        self.failed_download_peers.push(peer_id);
        self.state = BatchState::AwaitingDownload;

        let attempts = self.failed_download_peers.len();

        if attempts > MAX_BATCH_DOWNLOAD_ATTEMPTS {
            return Err(BatchError::MaxDownloadAttempts {
                start_epoch: self.start_epoch,
                attempts,
            });
        }

        Ok(())
    }

    pub fn start_processing(&mut self) -> Result<Vec<Arc<SignedBeaconBlock>>, BatchError> {
        match core::mem::replace(&mut self.state, BatchState::AwaitingDownload) {
            BatchState::AwaitingProcessing { peer_id, blocks } => {
                self.state = BatchState::Processing(Attempt::new(peer_id, &blocks));
                Ok(blocks)
            }
            state => {
                self.state = state;
                Err(self.wrong_status(BatchStatus::AwaitingProcessing))
            }
        }
    }

    pub fn processing_success(&mut self) -> Result<(), BatchError> {
        let BatchState::Processing(attempt) = self.state else {
            return Err(self.wrong_status(BatchStatus::Processing));
        };

        self.state = BatchState::AwaitingValidation(attempt);

        Ok(())
    }

    pub fn processing_error(&mut self) -> Result<(), BatchError> {
        let BatchState::Processing(attempt) = self.state else {
            return Err(self.wrong_status(BatchStatus::Processing));
        };

        self.fail_processing(attempt)
    }

    /// Called when a later batch shows that this one was on the wrong chain.
    pub fn validation_error(&mut self) -> Result<(), BatchError> {
        let BatchState::AwaitingValidation(attempt) = self.state else {
            return Err(self.wrong_status(BatchStatus::AwaitingValidation));
        };

        self.fail_processing(attempt)
    }

    fn fail_processing(&mut self, attempt: Attempt) -> Result<(), BatchError> {
        self.failed_processing_attempts.push(attempt);
        self.state = BatchState::AwaitingDownload;

        let attempts = self.failed_processing_attempts.len();

        if attempts > MAX_BATCH_PROCESSING_ATTEMPTS {
            return Err(BatchError::MaxProcessingAttempts {
                start_epoch: self.start_epoch,
                attempts,
            });
        }

        Ok(())
    }

    fn wrong_status(&self, expected: BatchStatus) -> BatchError {
        error!("invalid transition of {self}: expected {expected}");

        BatchError::WrongStatus {
            start_epoch: self.start_epoch,
            expected,
            actual: self.status(),
        }
    }
}
