use thiserror::Error;
use types::{
    containers::{AttestationData, BeaconBlockHeader, Checkpoint},
    primitives::{Epoch, ExecutionBlockHash, Slot, UnixSeconds, ValidatorIndex, H256},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("attestation data is not slashable (data_1: {data_1:?}, data_2: {data_2:?})")]
    AttestationDataNotSlashable {
        data_1: AttestationData,
        data_2: AttestationData,
    },
    #[error(
        "attestation in slot {attestation_slot} is outside \
         inclusion range for state at slot {state_slot}"
    )]
    AttestationOutsideInclusionRange {
        state_slot: Slot,
        attestation_slot: Slot,
    },
    #[error(
        "attestation source does not match justified checkpoint \
         (in_state: {in_state:?}, in_block: {in_block:?})"
    )]
    AttestationSourceMismatch {
        in_state: Checkpoint,
        in_block: Checkpoint,
    },
    #[error("attestation targets epoch {target_epoch} but was made in slot {slot}")]
    AttestationTargetsWrongEpoch { slot: Slot, target_epoch: Epoch },
    #[error(
        "attestation targets epoch {target_epoch} that is neither \
         the current nor the previous epoch of a state in epoch {current_epoch}"
    )]
    AttestationTargetsUncachedEpoch {
        target_epoch: Epoch,
        current_epoch: Epoch,
    },
    #[error("block is not newer than latest block header ({block_slot} <= {block_header_slot})")]
    BlockNotNewerThanLatestBlockHeader {
        block_slot: Slot,
        block_header_slot: Slot,
    },
    #[error(
        "execution payload parent hash ({in_block:?}) \
         does not match latest header in state ({in_state:?})"
    )]
    ExecutionPayloadParentHashMismatch {
        in_state: ExecutionBlockHash,
        in_block: ExecutionBlockHash,
    },
    #[error("execution payload prev_randao ({in_block:?}) does not match state ({in_state:?})")]
    ExecutionPayloadPrevRandaoMismatch { in_state: H256, in_block: H256 },
    #[error(
        "execution payload timestamp is incorrect (computed: {computed}, in_block: {in_block})"
    )]
    ExecutionPayloadTimestampMismatch {
        computed: UnixSeconds,
        in_block: UnixSeconds,
    },
    #[error("no attesters slashed")]
    NoAttestersSlashed,
    #[error("parent root is incorrect (computed: {computed:?}, in_block: {in_block:?})")]
    ParentRootMismatch { computed: H256, in_block: H256 },
    #[error("proposer index is incorrect (computed: {computed}, in_block: {in_block})")]
    ProposerIndexMismatch {
        computed: ValidatorIndex,
        in_block: ValidatorIndex,
    },
    #[error("proposer {index} is not slashable")]
    ProposerNotSlashable { index: ValidatorIndex },
    #[error("proposer {index} is slashed")]
    ProposerSlashed { index: ValidatorIndex },
    #[error("proposer slashing headers are identical: {header:?}")]
    ProposerSlashingHeadersIdentical { header: BeaconBlockHeader },
    #[error(
        "proposer indices in proposer slashing do not match \
         ({proposer_index_1} != {proposer_index_2})"
    )]
    ProposerSlashingProposerMismatch {
        proposer_index_1: ValidatorIndex,
        proposer_index_2: ValidatorIndex,
    },
    #[error("slots in proposer slashing do not match ({slot_1} != {slot_2})")]
    ProposerSlashingSlotMismatch { slot_1: Slot, slot_2: Slot },
    #[error("block slot ({block_slot}) does not match state slot ({state_slot})")]
    SlotMismatch { state_slot: Slot, block_slot: Slot },
    #[error("target slot ({target}) is not later than current slot ({current})")]
    SlotNotLater { current: Slot, target: Slot },
    #[error("state root is incorrect (computed: {computed:?}, in_block: {in_block:?})")]
    StateRootMismatch { computed: H256, in_block: H256 },
    #[error("validator {index} has already exited in epoch {exit_epoch}")]
    ValidatorAlreadyExited {
        index: ValidatorIndex,
        exit_epoch: Epoch,
    },
    #[error(
        "validator {index} has not been active long enough \
         (activation_epoch: {activation_epoch}, current_epoch: {current_epoch})"
    )]
    ValidatorHasNotBeenActiveLongEnough {
        index: ValidatorIndex,
        activation_epoch: Epoch,
        current_epoch: Epoch,
    },
    #[error("validator {index} is not active in epoch {current_epoch}")]
    ValidatorNotActive {
        index: ValidatorIndex,
        current_epoch: Epoch,
    },
    #[error("voluntary exit is not valid yet (current_epoch: {current_epoch}, epoch: {epoch})")]
    VoluntaryExitIsExpired { current_epoch: Epoch, epoch: Epoch },
}
