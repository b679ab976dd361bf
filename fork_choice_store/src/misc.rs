use std::sync::Arc;

use derive_more::Debug;
use helper_functions::{epoch_context::CachedBeaconState, misc};
use serde::Serialize;
use types::{
    config::Config,
    containers::{Checkpoint, SignedBeaconBlock},
    primitives::{Epoch, ExecutionBlockHash, Slot, H256},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// The block has no execution payload.
    PreMerge,
    Valid,
    Optimistic,
    Invalid,
}

impl ExecutionStatus {
    #[must_use]
    pub const fn is_valid(self) -> bool {
        matches!(self, Self::Valid)
    }

    #[must_use]
    pub const fn is_invalid(self) -> bool {
        matches!(self, Self::Invalid)
    }

    #[must_use]
    pub const fn is_optimistic(self) -> bool {
        matches!(self, Self::Optimistic)
    }

    #[must_use]
    pub const fn is_execution_enabled(self) -> bool {
        !matches!(self, Self::PreMerge)
    }
}

#[derive(Clone, Debug)]
pub struct ChainLink {
    pub block_root: H256,
    pub block: Arc<SignedBeaconBlock>,
    #[debug(skip)]
    pub state: Arc<CachedBeaconState>,
    pub current_justified_checkpoint: Checkpoint,
    pub finalized_checkpoint: Checkpoint,
    pub execution_status: ExecutionStatus,
}

impl ChainLink {
    /// Takes checkpoints from `state`, which must be the post-state of `block`.
    #[must_use]
    pub fn new(
        block_root: H256,
        block: Arc<SignedBeaconBlock>,
        state: Arc<CachedBeaconState>,
        execution_status: ExecutionStatus,
    ) -> Self {
        Self {
            block_root,
            block,
            current_justified_checkpoint: state.state.current_justified_checkpoint,
            finalized_checkpoint: state.state.finalized_checkpoint,
            state,
            execution_status,
        }
    }

    #[must_use]
    pub fn slot(&self) -> Slot {
        self.block.slot()
    }

    #[must_use]
    pub fn epoch(&self, config: &Config) -> Epoch {
        misc::compute_epoch_at_slot(config, self.slot())
    }

    #[must_use]
    pub fn parent_root(&self) -> H256 {
        self.block.parent_root()
    }

    /// Hash of the execution payload, if the block has one.
    #[must_use]
    pub fn execution_block_hash(&self) -> Option<ExecutionBlockHash> {
        let payload = self.block.execution_payload();
        (!payload.is_default()).then_some(payload.block_hash)
    }

    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.execution_status.is_valid()
    }

    #[must_use]
    pub const fn is_invalid(&self) -> bool {
        self.execution_status.is_invalid()
    }

    #[must_use]
    pub const fn is_optimistic(&self) -> bool {
        self.execution_status.is_optimistic()
    }
}

#[derive(Clone, Debug)]
pub enum ApplyBlockChanges {
    CanonicalChainExtended {
        finalized_checkpoint_updated: bool,
    },
    AlternateChainExtended {
        finalized_checkpoint_updated: bool,
    },
    Reorganized {
        finalized_checkpoint_updated: bool,
        old_head: Box<ChainLink>,
    },
}

impl ApplyBlockChanges {
    #[must_use]
    pub const fn finalized_checkpoint_updated(&self) -> bool {
        match self {
            Self::CanonicalChainExtended {
                finalized_checkpoint_updated,
            }
            | Self::AlternateChainExtended {
                finalized_checkpoint_updated,
            }
            | Self::Reorganized {
                finalized_checkpoint_updated,
                ..
            } => *finalized_checkpoint_updated,
        }
    }
}
