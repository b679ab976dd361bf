use core::time::Duration;

use derive_more::{Display, From};
use fork_choice_control::ChainSegmentError;
use helper_functions::misc;
use serde::{Deserialize, Serialize};
use strum::IntoStaticStr;
use types::{
    config::Config,
    primitives::{Epoch, Slot, H256},
};

/// Blocks covered by one batch, in epochs.
pub const EPOCHS_PER_BATCH: u64 = 1;

/// Maximum number of batches in `Downloading` or `AwaitingProcessing` state per chain.
pub const BATCH_BUFFER_SIZE: usize = 5;

/// A batch fails permanently on download failure number `MAX_BATCH_DOWNLOAD_ATTEMPTS + 1`.
pub const MAX_BATCH_DOWNLOAD_ATTEMPTS: usize = 5;

/// A batch fails permanently on processing failure number `MAX_BATCH_PROCESSING_ATTEMPTS + 1`.
pub const MAX_BATCH_PROCESSING_ATTEMPTS: usize = 3;

pub const PARALLEL_HEAD_CHAINS: usize = 2;

/// A syncing finalized chain is only replaced after it has made this much progress.
pub const MIN_FINALIZED_CHAIN_VALIDATED_EPOCHS: u64 = 10;

pub const BLOCKS_BY_RANGE_TIMEOUT: Duration = Duration::from_secs(180);

/// Capacity of the [`SyncEvent`](crate::SyncEvent) channel.
/// Subscribers that fall further behind lose the oldest events.
pub const SYNC_EVENT_CHANNEL_CAPACITY: usize = 256;

pub type BatchId = Epoch;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, From)]
#[display("{_0}")]
pub struct PeerId(pub u64);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, Serialize)]
#[display("{_0}")]
pub struct ChainId(pub u64);

/// The part of a `Status` handshake that range sync uses.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Deserialize, Serialize)]
pub struct StatusMessage {
    pub finalized_root: H256,
    pub finalized_epoch: Epoch,
    pub head_root: H256,
    pub head_slot: Slot,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub struct BlocksByRangeRequest {
    pub start_slot: Slot,
    pub count: u64,
    pub step: u64,
}

impl BlocksByRangeRequest {
    #[must_use]
    pub const fn contains(self, slot: Slot) -> bool {
        self.start_slot <= slot && slot < self.start_slot + self.count
    }
}

/// Penalties in order of decreasing severity.
///
/// The names refer to how many errors of the same kind a peer can make before being banned.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub enum PeerAction {
    Fatal,
    LowToleranceError,
    MidToleranceError,
    HighToleranceError,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, IntoStaticStr, Serialize)]
#[strum(serialize_all = "snake_case")]
pub enum PeerReportReason {
    /// A different peer served a batch that was processed successfully after this one failed.
    BatchReprocessedOriginalPeer,
    /// The same peer served a batch that was processed successfully after failing earlier.
    BatchReprocessedSamePeer,
    BlocksOutsideRequestedRange,
    SyncChainFailed,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeSyncType {
    /// Sync up to a finalized checkpoint that is ahead of ours.
    #[display("finalized")]
    Finalized,
    /// Sync up to the head of a peer that agrees with our finalized checkpoint.
    #[display("head")]
    Head,
}

impl RangeSyncType {
    /// Decides how to sync from a peer based on its status.
    ///
    /// Returns `None` if the peer has nothing we do not already have.
    #[must_use]
    pub const fn new(local: &StatusMessage, remote: &StatusMessage) -> Option<Self> {
        if remote.finalized_epoch > local.finalized_epoch {
            Some(Self::Finalized)
        } else if remote.head_slot > local.head_slot {
            Some(Self::Head)
        } else {
            None
        }
    }
}

/// Outcome of processing one batch, as reported to the chain it belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BatchProcessResult {
    Success { imported_blocks: usize },
    Failed { imported_blocks: usize },
}

impl BatchProcessResult {
    #[must_use]
    pub const fn from_segment_result(
        blocks: usize,
        result: Result<(), &ChainSegmentError>,
    ) -> Self {
        match result {
            Ok(()) => Self::Success {
                imported_blocks: blocks,
            },
            Err(error) => Self::Failed {
                imported_blocks: error.imported_blocks,
            },
        }
    }
}

/// Tunables a caller can override.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub epochs_per_batch: u64,
    pub batch_buffer_size: usize,
    #[serde(with = "duration_seconds")]
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            epochs_per_batch: EPOCHS_PER_BATCH,
            batch_buffer_size: BATCH_BUFFER_SIZE,
            request_timeout: BLOCKS_BY_RANGE_TIMEOUT,
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn batch_request(&self, config: &Config, start_epoch: Epoch) -> BlocksByRangeRequest {
        BlocksByRangeRequest {
            start_slot: misc::compute_start_slot_at_epoch(config, start_epoch),
            count: self.epochs_per_batch * config.slots_per_epoch.get(),
            step: 1,
        }
    }
}

mod duration_seconds {
    use core::time::Duration;

    use serde::{Deserialize as _, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn status(finalized_epoch: Epoch, head_slot: Slot) -> StatusMessage {
        StatusMessage {
            finalized_epoch,
            head_slot,
            ..StatusMessage::default()
        }
    }

    #[test_case(status(2, 100), status(3, 90)  => Some(RangeSyncType::Finalized))]
    #[test_case(status(2, 100), status(2, 101) => Some(RangeSyncType::Head))]
    #[test_case(status(2, 100), status(2, 100) => None)]
    #[test_case(status(2, 100), status(1, 200) => Some(RangeSyncType::Head))]
    fn sync_type_depends_on_remote_status(
        local: StatusMessage,
        remote: StatusMessage,
    ) -> Option<RangeSyncType> {
        RangeSyncType::new(&local, &remote)
    }

    #[test]
    fn batch_request_covers_whole_epochs() {
        let config = Config::minimal();
        let sync_config = SyncConfig {
            epochs_per_batch: 2,
            ..SyncConfig::default()
        };

        let request = sync_config.batch_request(&config, 3);

        assert_eq!(
            request,
            BlocksByRangeRequest {
                start_slot: 24,
                count: 16,
                step: 1,
            },
        );
        assert!(request.contains(39));
        assert!(!request.contains(40));
    }

    #[test]
    fn sync_config_overrides_defaults() -> anyhow::Result<()> {
        let sync_config =
            serde_yaml::from_str::<SyncConfig>("epochs_per_batch: 2\nrequest_timeout: 30")?;

        assert_eq!(sync_config.epochs_per_batch, 2);
        assert_eq!(sync_config.batch_buffer_size, BATCH_BUFFER_SIZE);
        assert_eq!(sync_config.request_timeout, Duration::from_secs(30));

        Ok(())
    }
}
