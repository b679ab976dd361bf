use anyhow::{ensure, Result};
use types::{
    beacon_state::BeaconState,
    containers::{AttestationData, BeaconBlockBody, IndexedAttestation, Validator},
    primitives::Epoch,
};

use crate::error::Error;

// > Check if ``validator`` is active.
#[must_use]
pub const fn is_active_validator(validator: &Validator, epoch: Epoch) -> bool {
    validator.activation_epoch <= epoch && epoch < validator.exit_epoch
}

// > Check if ``validator`` is slashable.
#[must_use]
pub const fn is_slashable_validator(validator: &Validator, epoch: Epoch) -> bool {
    !validator.slashed
        && validator.activation_epoch <= epoch
        && epoch < validator.withdrawable_epoch
}

// > Check if ``data_1`` and ``data_2`` are slashable according to Casper FFG rules.
#[must_use]
pub fn is_slashable_attestation_data(data_1: AttestationData, data_2: AttestationData) -> bool {
    // > Double vote
    let double_vote = data_1 != data_2 && data_1.target.epoch == data_2.target.epoch;

    // > Surround vote
    let surround_vote =
        data_1.source.epoch < data_2.source.epoch && data_2.target.epoch < data_1.target.epoch;

    double_vote || surround_vote
}

/// Checks the parts of `is_valid_indexed_attestation` that do not involve signatures.
///
/// The signature is verified separately, usually as part of a batch.
pub fn validate_indexed_attestation_structure(attestation: &IndexedAttestation) -> Result<()> {
    let indices = &attestation.attesting_indices;

    ensure!(!indices.is_empty(), Error::AttestationHasNoAttestingIndices);

    ensure!(
        indices.windows(2).all(|pair| pair[0] < pair[1]),
        Error::AttestingIndicesNotSortedAndUnique,
    );

    Ok(())
}

#[must_use]
pub fn is_merge_transition_complete(state: &BeaconState) -> bool {
    !state.latest_execution_payload_header.is_default()
}

#[must_use]
pub fn is_execution_enabled(state: &BeaconState, body: &BeaconBlockBody) -> bool {
    is_merge_transition_complete(state) || !body.execution_payload.is_default()
}

#[cfg(test)]
mod tests {
    use ssz::ContiguousList;
    use test_case::test_case;
    use types::{consts::FAR_FUTURE_EPOCH, containers::Checkpoint};

    use super::*;

    fn data(source_epoch: Epoch, target_epoch: Epoch, slot: u64) -> AttestationData {
        AttestationData {
            slot,
            source: Checkpoint {
                epoch: source_epoch,
                ..Checkpoint::default()
            },
            target: Checkpoint {
                epoch: target_epoch,
                ..Checkpoint::default()
            },
            ..AttestationData::default()
        }
    }

    #[test_case(data(0, 2, 16), data(0, 2, 17) => true; "double vote")]
    #[test_case(data(0, 3, 24), data(1, 2, 16) => true; "surround vote")]
    #[test_case(data(0, 2, 16), data(0, 2, 16) => false; "same vote")]
    #[test_case(data(0, 2, 16), data(1, 3, 24) => false; "consecutive votes")]
    fn slashable_attestation_data(first: AttestationData, second: AttestationData) -> bool {
        is_slashable_attestation_data(first, second)
    }

    #[test_case(&[] => false; "empty")]
    #[test_case(&[1, 1] => false; "duplicate")]
    #[test_case(&[2, 1] => false; "unsorted")]
    #[test_case(&[1, 2, 5] => true; "sorted and unique")]
    fn indexed_attestation_structure(indices: &[u64]) -> bool {
        let attestation = IndexedAttestation {
            attesting_indices: ContiguousList::try_from(indices.to_vec())
                .expect("test lists are short"),
            ..IndexedAttestation::default()
        };

        validate_indexed_attestation_structure(&attestation).is_ok()
    }

    #[test]
    fn exited_validator_is_inactive() {
        let validator = Validator {
            activation_epoch: 1,
            exit_epoch: 5,
            withdrawable_epoch: FAR_FUTURE_EPOCH,
            ..Validator::default()
        };

        assert!(!is_active_validator(&validator, 0));
        assert!(is_active_validator(&validator, 4));
        assert!(!is_active_validator(&validator, 5));
        assert!(is_slashable_validator(&validator, 5));
    }
}
