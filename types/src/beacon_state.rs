use std::sync::Arc;

use serde::{Deserialize, Serialize};
use ssz::{BitVector, ContiguousList, SszHash};

use crate::{
    config::Config,
    consts::{JUSTIFICATION_BITS_LENGTH, VALIDATOR_REGISTRY_LIMIT},
    containers::{
        BeaconBlockHeader, Checkpoint, Eth1Data, ExecutionPayloadHeader, Fork, SyncCommittee,
        Validator,
    },
    participation::EpochParticipation,
    primitives::{Gwei, Slot, UnixSeconds, H256},
};

/// The beacon state with Altair participation tracking and a Bellatrix execution payload header.
///
/// Vectors whose length is configurable are stored in [`Vec`]s sized by [`BeaconState::empty`].
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize, SszHash)]
#[serde(deny_unknown_fields)]
pub struct BeaconState {
    // Versioning
    pub genesis_time: UnixSeconds,
    pub genesis_validators_root: H256,
    pub slot: Slot,
    pub fork: Fork,

    // History
    pub latest_block_header: BeaconBlockHeader,
    #[ssz(with = "ssz::vector_root")]
    pub block_roots: Vec<H256>,
    #[ssz(with = "ssz::vector_root")]
    pub state_roots: Vec<H256>,

    // Eth1
    pub eth1_data: Eth1Data,

    // Registry
    pub validators: ContiguousList<Validator, VALIDATOR_REGISTRY_LIMIT>,
    pub balances: ContiguousList<Gwei, VALIDATOR_REGISTRY_LIMIT>,

    // Randomness
    #[ssz(with = "ssz::vector_root")]
    pub randao_mixes: Vec<H256>,

    // Slashings
    #[ssz(with = "ssz::vector_root")]
    pub slashings: Vec<Gwei>,

    // Participation
    pub previous_epoch_participation: EpochParticipation,
    pub current_epoch_participation: EpochParticipation,

    // Finality
    pub justification_bits: BitVector<JUSTIFICATION_BITS_LENGTH>,
    pub previous_justified_checkpoint: Checkpoint,
    pub current_justified_checkpoint: Checkpoint,
    pub finalized_checkpoint: Checkpoint,

    // Sync
    pub current_sync_committee: Arc<SyncCommittee>,
    pub next_sync_committee: Arc<SyncCommittee>,

    // Execution
    pub latest_execution_payload_header: ExecutionPayloadHeader,
}

impl BeaconState {
    /// A state with no validators and historical vectors of the lengths required by `config`.
    #[must_use]
    pub fn empty(config: &Config) -> Self {
        let slots_per_historical_root = vector_length(config.slots_per_historical_root.get());
        let epochs_per_historical_vector = vector_length(config.epochs_per_historical_vector.get());
        let epochs_per_slashings_vector = vector_length(config.epochs_per_slashings_vector.get());

        Self {
            genesis_time: 0,
            genesis_validators_root: H256::zero(),
            slot: 0,
            fork: Fork::default(),
            latest_block_header: BeaconBlockHeader::default(),
            block_roots: vec![H256::zero(); slots_per_historical_root],
            state_roots: vec![H256::zero(); slots_per_historical_root],
            eth1_data: Eth1Data::default(),
            validators: ContiguousList::default(),
            balances: ContiguousList::default(),
            randao_mixes: vec![H256::zero(); epochs_per_historical_vector],
            slashings: vec![0; epochs_per_slashings_vector],
            previous_epoch_participation: EpochParticipation::default(),
            current_epoch_participation: EpochParticipation::default(),
            justification_bits: BitVector::default(),
            previous_justified_checkpoint: Checkpoint::default(),
            current_justified_checkpoint: Checkpoint::default(),
            finalized_checkpoint: Checkpoint::default(),
            current_sync_committee: Arc::default(),
            next_sync_committee: Arc::default(),
            latest_execution_payload_header: ExecutionPayloadHeader::default(),
        }
    }

    #[must_use]
    pub fn validator_count(&self) -> usize {
        self.validators.len()
    }

    /// Applies queued participation updates to the trees backing them.
    pub fn flush_participation(&mut self) -> Result<(), ssz::TreeError> {
        self.previous_epoch_participation.flush()?;
        self.current_epoch_participation.flush()
    }

    /// # Panics
    ///
    /// Panics in debug builds if participation updates have not been flushed.
    #[must_use]
    pub fn root(&self) -> H256 {
        self.hash_tree_root()
    }
}

fn vector_length(length: u64) -> usize {
    usize::try_from(length).expect("vector lengths in valid configurations fit in usize")
}
