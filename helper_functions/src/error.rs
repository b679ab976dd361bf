use parse_display::Display;
use thiserror::Error;
use types::primitives::{CommitteeIndex, Epoch, Slot, ValidatorIndex};

#[derive(Debug, Error)]
pub enum Error {
    #[error("attestation has no attesting indices")]
    AttestationHasNoAttestingIndices,
    #[error("attestation source does not match justified checkpoint")]
    AttestationSourceMismatch,
    #[error("attesting indices are not sorted and unique")]
    AttestingIndicesNotSortedAndUnique,
    #[error("committee index {index} is out of bounds (committees per slot: {committees_per_slot})")]
    CommitteeIndexOutOfBounds {
        index: CommitteeIndex,
        committees_per_slot: u64,
    },
    #[error(
        "aggregation bitlist length {aggregation_bitlist_length} \
         does not match committee length {committee_length}"
    )]
    CommitteeLengthMismatch {
        aggregation_bitlist_length: usize,
        committee_length: usize,
    },
    #[error("epoch {epoch} is not cached (cached epochs: {previous}..={current})")]
    EpochNotCached {
        epoch: Epoch,
        previous: Epoch,
        current: Epoch,
    },
    #[error("failed to select proposer")]
    FailedToSelectProposer,
    #[error("no validators are active")]
    NoActiveValidators,
    #[error("{0} is invalid")]
    SignatureInvalid(SignatureKind),
    #[error("slot {slot} is out of range of the block root history")]
    SlotOutOfRange { slot: Slot },
    #[error("sync committee member at position {position} is not in the registry")]
    SyncCommitteeMemberUnknown { position: usize },
    #[error("sync aggregate has no participants but its signature is not the point at infinity")]
    SyncAggregateWithoutParticipants,
    #[error("validator {index} is not in the registry")]
    ValidatorNotFound { index: ValidatorIndex },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum SignatureKind {
    #[display("attestation signature")]
    Attestation,
    #[display("attester slashing signature")]
    AttesterSlashing,
    #[display("block signature")]
    Block,
    #[display("collection of multiple signatures")]
    Multi,
    #[display("proposer slashing signature")]
    ProposerSlashing,
    #[display("RANDAO reveal")]
    Randao,
    #[display("sync aggregate signature")]
    SyncAggregate,
    #[display("voluntary exit signature")]
    VoluntaryExit,
}
