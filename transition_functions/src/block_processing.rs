use core::num::NonZeroU64;

use anyhow::{ensure, Result};
use helper_functions::{
    accessors::{
        get_attestation_participation_flags, get_attesting_indices, get_base_reward,
        get_base_reward_per_increment, get_current_epoch, get_previous_epoch, get_randao_mix,
        get_total_active_balance, get_validator,
    },
    epoch_context::{CachedBeaconState, EpochContext},
    misc::{compute_epoch_at_slot, compute_timestamp_at_slot},
    mutators::{decrease_balance, increase_balance, initiate_validator_exit, slash_validator},
    predicates::{
        is_active_validator, is_execution_enabled, is_merge_transition_complete,
        is_slashable_attestation_data, is_slashable_validator,
        validate_indexed_attestation_structure,
    },
};
use itertools::Itertools as _;
use ssz::SszHash as _;
use tap::TryConv as _;
use types::{
    beacon_state::BeaconState,
    config::Config,
    consts::{
        FAR_FUTURE_EPOCH, PARTICIPATION_FLAG_WEIGHTS, PROPOSER_WEIGHT, SYNC_COMMITTEE_SIZE,
        SYNC_REWARD_WEIGHT, WEIGHT_DENOMINATOR,
    },
    containers::{
        Attestation, AttesterSlashing, BeaconBlock, BeaconBlockBody, BeaconBlockHeader,
        ExecutionPayload, ProposerSlashing, SignedVoluntaryExit, SyncAggregate,
    },
    participation::has_flag,
    primitives::{ValidatorIndex, H256},
};

use crate::error::Error;

/// Applies `block` to a state already advanced to the block's slot.
///
/// Signatures are not checked here. See [`crate::state_transition`].
/// Participation updates queued by attestations are flushed before returning.
pub fn process_block(cached: &mut CachedBeaconState, block: &BeaconBlock) -> Result<()> {
    let CachedBeaconState {
        ref config,
        ref mut state,
        ref epoch_context,
    } = *cached;

    debug_assert_eq!(state.slot, block.slot);

    process_block_header(config, state, epoch_context, block)?;

    if is_execution_enabled(state, &block.body) {
        process_execution_payload(config, state, &block.body.execution_payload)?;
    }

    process_randao(config, state, &block.body)?;
    process_operations(config, state, epoch_context, block)?;

    if config.is_altair_enabled(get_current_epoch(config, state)) {
        process_sync_aggregate(
            config,
            state,
            epoch_context,
            block.proposer_index,
            &block.body.sync_aggregate,
        )?;
    }

    state.flush_participation()?;

    Ok(())
}

pub fn process_block_header(
    config: &Config,
    state: &mut BeaconState,
    epoch_context: &EpochContext,
    block: &BeaconBlock,
) -> Result<()> {
    // > Verify that the slots match
    ensure!(
        block.slot == state.slot,
        Error::SlotMismatch {
            state_slot: state.slot,
            block_slot: block.slot,
        },
    );

    // > Verify that the block is newer than latest block header
    ensure!(
        block.slot > state.latest_block_header.slot,
        Error::BlockNotNewerThanLatestBlockHeader {
            block_slot: block.slot,
            block_header_slot: state.latest_block_header.slot,
        },
    );

    // > Verify that proposer index is the correct index
    let computed = epoch_context.beacon_proposer_index(config, block.slot)?;
    let in_block = block.proposer_index;

    ensure!(
        computed == in_block,
        Error::ProposerIndexMismatch { computed, in_block },
    );

    // > Verify that the parent matches
    let computed = state.latest_block_header.hash_tree_root();
    let in_block = block.parent_root;

    ensure!(
        computed == in_block,
        Error::ParentRootMismatch { computed, in_block },
    );

    // > Cache current block as the new latest block
    state.latest_block_header = BeaconBlockHeader {
        slot: block.slot,
        proposer_index: block.proposer_index,
        parent_root: block.parent_root,
        // > Overwritten in the next process_slot call
        state_root: H256::zero(),
        body_root: block.body.hash_tree_root(),
    };

    // > Verify proposer is not slashed
    let index = block.proposer_index;

    ensure!(
        !get_validator(state, index)?.slashed,
        Error::ProposerSlashed { index },
    );

    Ok(())
}

pub fn process_execution_payload(
    config: &Config,
    state: &mut BeaconState,
    payload: &ExecutionPayload,
) -> Result<()> {
    // > Verify consistency of the parent hash with respect to the previous execution payload header
    if is_merge_transition_complete(state) {
        let in_state = state.latest_execution_payload_header.block_hash;
        let in_block = payload.parent_hash;

        ensure!(
            in_state == in_block,
            Error::ExecutionPayloadParentHashMismatch { in_state, in_block },
        );
    }

    // > Verify prev_randao
    let in_state = get_randao_mix(state, get_current_epoch(config, state));
    let in_block = payload.prev_randao;

    ensure!(
        in_state == in_block,
        Error::ExecutionPayloadPrevRandaoMismatch { in_state, in_block },
    );

    // > Verify timestamp
    let computed = compute_timestamp_at_slot(config, state, state.slot);
    let in_block = payload.timestamp;

    ensure!(
        computed == in_block,
        Error::ExecutionPayloadTimestampMismatch { computed, in_block },
    );

    // > Cache execution payload header
    state.latest_execution_payload_header = payload.to_header();

    Ok(())
}

pub fn process_randao(
    config: &Config,
    state: &mut BeaconState,
    body: &BeaconBlockBody,
) -> Result<()> {
    let epoch = get_current_epoch(config, state);

    // > Mix in RANDAO reveal
    let mix = get_randao_mix(state, epoch) ^ hashing::hash_768(body.randao_reveal);
    let position = (epoch % state.randao_mixes.len() as u64).try_conv::<usize>()?;

    state.randao_mixes[position] = mix;

    Ok(())
}

fn process_operations(
    config: &Config,
    state: &mut BeaconState,
    epoch_context: &EpochContext,
    block: &BeaconBlock,
) -> Result<()> {
    let body = &block.body;
    let proposer_index = block.proposer_index;

    for proposer_slashing in &body.proposer_slashings {
        process_proposer_slashing(config, state, *proposer_slashing, proposer_index)?;
    }

    for attester_slashing in &body.attester_slashings {
        process_attester_slashing(config, state, attester_slashing, proposer_index)?;
    }

    if !body.attestations.is_empty() {
        let total_active_balance = get_total_active_balance(config, state)?;

        for attestation in &body.attestations {
            process_attestation(
                config,
                state,
                epoch_context,
                attestation,
                proposer_index,
                total_active_balance,
            )?;
        }
    }

    for voluntary_exit in &body.voluntary_exits {
        process_voluntary_exit(config, state, *voluntary_exit)?;
    }

    Ok(())
}

pub fn validate_proposer_slashing(
    config: &Config,
    state: &BeaconState,
    proposer_slashing: ProposerSlashing,
) -> Result<()> {
    let header_1 = proposer_slashing.signed_header_1.message;
    let header_2 = proposer_slashing.signed_header_2.message;

    // > Verify header slots match
    ensure!(
        header_1.slot == header_2.slot,
        Error::ProposerSlashingSlotMismatch {
            slot_1: header_1.slot,
            slot_2: header_2.slot,
        },
    );

    // > Verify header proposer indices match
    ensure!(
        header_1.proposer_index == header_2.proposer_index,
        Error::ProposerSlashingProposerMismatch {
            proposer_index_1: header_1.proposer_index,
            proposer_index_2: header_2.proposer_index,
        },
    );

    // > Verify the headers are different
    ensure!(
        header_1 != header_2,
        Error::ProposerSlashingHeadersIdentical { header: header_1 },
    );

    // > Verify the proposer is slashable
    let index = header_1.proposer_index;
    let proposer = get_validator(state, index)?;

    ensure!(
        is_slashable_validator(proposer, get_current_epoch(config, state)),
        Error::ProposerNotSlashable { index },
    );

    Ok(())
}

fn process_proposer_slashing(
    config: &Config,
    state: &mut BeaconState,
    proposer_slashing: ProposerSlashing,
    proposer_index: ValidatorIndex,
) -> Result<()> {
    validate_proposer_slashing(config, state, proposer_slashing)?;

    let slashed_index = proposer_slashing.signed_header_1.message.proposer_index;

    slash_validator(config, state, slashed_index, proposer_index, None)
}

/// Returns the indices of validators that both attestations in `attester_slashing` implicate.
pub fn validate_attester_slashing(
    config: &Config,
    state: &BeaconState,
    attester_slashing: &AttesterSlashing,
) -> Result<Vec<ValidatorIndex>> {
    let attestation_1 = &attester_slashing.attestation_1;
    let attestation_2 = &attester_slashing.attestation_2;

    let data_1 = attestation_1.data;
    let data_2 = attestation_2.data;

    ensure!(
        is_slashable_attestation_data(data_1, data_2),
        Error::AttestationDataNotSlashable { data_1, data_2 },
    );

    validate_indexed_attestation_structure(attestation_1)?;
    validate_indexed_attestation_structure(attestation_2)?;

    let current_epoch = get_current_epoch(config, state);
    let mut slashable_indices = vec![];

    // Both index lists are sorted, so their intersection can be found by merging.
    for index in attestation_1
        .attesting_indices
        .iter()
        .merge_join_by(attestation_2.attesting_indices.iter(), Ord::cmp)
        .filter_map(|either| either.both().map(|(index, _)| *index))
    {
        if is_slashable_validator(get_validator(state, index)?, current_epoch) {
            slashable_indices.push(index);
        }
    }

    ensure!(!slashable_indices.is_empty(), Error::NoAttestersSlashed);

    Ok(slashable_indices)
}

fn process_attester_slashing(
    config: &Config,
    state: &mut BeaconState,
    attester_slashing: &AttesterSlashing,
    proposer_index: ValidatorIndex,
) -> Result<()> {
    for index in validate_attester_slashing(config, state, attester_slashing)? {
        slash_validator(config, state, index, proposer_index, None)?;
    }

    Ok(())
}

fn process_attestation(
    config: &Config,
    state: &mut BeaconState,
    epoch_context: &EpochContext,
    attestation: &Attestation,
    proposer_index: ValidatorIndex,
    total_active_balance: NonZeroU64,
) -> Result<()> {
    let data = attestation.data;
    let current_epoch = get_current_epoch(config, state);
    let previous_epoch = get_previous_epoch(config, state);
    let target_epoch = data.target.epoch;

    ensure!(
        target_epoch == previous_epoch || target_epoch == current_epoch,
        Error::AttestationTargetsUncachedEpoch {
            target_epoch,
            current_epoch,
        },
    );

    ensure!(
        target_epoch == compute_epoch_at_slot(config, data.slot),
        Error::AttestationTargetsWrongEpoch {
            slot: data.slot,
            target_epoch,
        },
    );

    let low_slot = data.slot + config.min_attestation_inclusion_delay.get();
    let high_slot = data.slot + config.slots_per_epoch.get();

    ensure!(
        (low_slot..=high_slot).contains(&state.slot),
        Error::AttestationOutsideInclusionRange {
            state_slot: state.slot,
            attestation_slot: data.slot,
        },
    );

    let in_state = if target_epoch == current_epoch {
        state.current_justified_checkpoint
    } else {
        state.previous_justified_checkpoint
    };

    ensure!(
        in_state == data.source,
        Error::AttestationSourceMismatch {
            in_state,
            in_block: data.source,
        },
    );

    // > Participation flag indices
    let inclusion_delay = state.slot - data.slot;
    let participation_flags =
        get_attestation_participation_flags(config, state, data, inclusion_delay)?;

    // > Update epoch participation flags
    let committee = epoch_context.beacon_committee(config, data.slot, data.index)?;
    let base_reward_per_increment = get_base_reward_per_increment(config, total_active_balance);

    let attesting_indices_with_base_rewards =
        get_attesting_indices(committee, &attestation.aggregation_bits)?
            .map(|index| {
                let base_reward = get_base_reward(config, state, index, base_reward_per_increment)?;
                Ok((index, base_reward))
            })
            .collect::<Result<Vec<_>>>()?;

    let epoch_participation = if target_epoch == current_epoch {
        &mut state.current_epoch_participation
    } else {
        &mut state.previous_epoch_participation
    };

    let mut proposer_reward_numerator = 0;

    for (index, base_reward) in attesting_indices_with_base_rewards {
        let position = index.try_conv::<usize>()?;

        let existing = epoch_participation
            .get(position)
            .ok_or(helper_functions::error::Error::ValidatorNotFound { index })?;

        for (flag_index, weight) in PARTICIPATION_FLAG_WEIGHTS {
            if has_flag(participation_flags, flag_index) && !has_flag(existing, flag_index) {
                proposer_reward_numerator += base_reward * weight;
            }
        }

        let new_flags = participation_flags & !existing;

        if new_flags != 0 {
            epoch_participation.queue_update(position, new_flags);
        }
    }

    // > Reward proposer
    let proposer_reward_denominator =
        (WEIGHT_DENOMINATOR.get() - PROPOSER_WEIGHT) * WEIGHT_DENOMINATOR.get() / PROPOSER_WEIGHT;
    let proposer_reward = proposer_reward_numerator / proposer_reward_denominator;

    increase_balance(state, proposer_index, proposer_reward)
}

fn process_voluntary_exit(
    config: &Config,
    state: &mut BeaconState,
    signed_voluntary_exit: SignedVoluntaryExit,
) -> Result<()> {
    let voluntary_exit = signed_voluntary_exit.message;
    let index = voluntary_exit.validator_index;
    let validator = get_validator(state, index)?;
    let current_epoch = get_current_epoch(config, state);

    // > Verify the validator is active
    ensure!(
        is_active_validator(validator, current_epoch),
        Error::ValidatorNotActive {
            index,
            current_epoch,
        },
    );

    // > Verify exit has not been initiated
    ensure!(
        validator.exit_epoch == FAR_FUTURE_EPOCH,
        Error::ValidatorAlreadyExited {
            index,
            exit_epoch: validator.exit_epoch,
        },
    );

    // > Exits must specify an epoch when they become valid; they are not valid before then
    ensure!(
        current_epoch >= voluntary_exit.epoch,
        Error::VoluntaryExitIsExpired {
            current_epoch,
            epoch: voluntary_exit.epoch,
        },
    );

    // > Verify the validator has been active long enough
    ensure!(
        current_epoch >= validator.activation_epoch + config.shard_committee_period,
        Error::ValidatorHasNotBeenActiveLongEnough {
            index,
            activation_epoch: validator.activation_epoch,
            current_epoch,
        },
    );

    // > Initiate exit
    initiate_validator_exit(config, state, index)
}

pub fn process_sync_aggregate(
    config: &Config,
    state: &mut BeaconState,
    epoch_context: &EpochContext,
    proposer_index: ValidatorIndex,
    sync_aggregate: &SyncAggregate,
) -> Result<()> {
    // > Compute participant and proposer rewards
    let total_active_balance = get_total_active_balance(config, state)?;
    let total_active_increments = total_active_balance.get() / config.effective_balance_increment;
    let total_base_rewards =
        get_base_reward_per_increment(config, total_active_balance) * total_active_increments;
    let max_participant_rewards =
        total_base_rewards * SYNC_REWARD_WEIGHT / WEIGHT_DENOMINATOR / config.slots_per_epoch;
    let participant_reward = max_participant_rewards / SYNC_COMMITTEE_SIZE as u64;
    let proposer_reward =
        participant_reward * PROPOSER_WEIGHT / (WEIGHT_DENOMINATOR.get() - PROPOSER_WEIGHT);

    // > Apply participant and proposer rewards
    let members = epoch_context.current_sync_committee_indices();
    let mut participant_count = 0;

    for (position, participated) in sync_aggregate.sync_committee_bits.iter().by_vals().enumerate()
    {
        if participated {
            let index = epoch_context.sync_committee_member(position)?;
            increase_balance(state, index, participant_reward)?;
            participant_count += 1;
        } else if let Some(index) = members.get(position) {
            decrease_balance(state, *index, participant_reward)?;
        }
    }

    increase_balance(state, proposer_index, proposer_reward * participant_count)
}

#[cfg(test)]
mod tests {
    use types::{
        containers::{AttestationData, Checkpoint, IndexedAttestation, Validator},
        primitives::Slot,
    };

    use super::*;

    fn validator() -> Validator {
        Validator {
            effective_balance: 32_000_000_000,
            activation_epoch: 0,
            exit_epoch: FAR_FUTURE_EPOCH,
            withdrawable_epoch: FAR_FUTURE_EPOCH,
            ..Validator::default()
        }
    }

    fn state_with_validators(count: usize) -> BeaconState {
        let mut state = BeaconState::empty(&Config::minimal());

        for _ in 0..count {
            state
                .validators
                .push(validator())
                .expect("registry limit is far above the validator count in tests");

            state
                .balances
                .push(32_000_000_000)
                .expect("registry limit is far above the validator count in tests");
        }

        state
    }

    fn header(slot: Slot, proposer_index: ValidatorIndex, byte: u8) -> BeaconBlockHeader {
        BeaconBlockHeader {
            slot,
            proposer_index,
            body_root: H256::repeat_byte(byte),
            ..BeaconBlockHeader::default()
        }
    }

    fn indexed_attestation(
        indices: Vec<ValidatorIndex>,
        data: AttestationData,
    ) -> IndexedAttestation {
        IndexedAttestation {
            attesting_indices: indices
                .try_into()
                .expect("attestations in tests are smaller than the committee limit"),
            data,
            ..IndexedAttestation::default()
        }
    }

    #[test]
    fn proposer_slashing_requires_distinct_headers() {
        let config = Config::minimal();
        let state = state_with_validators(4);

        let mut proposer_slashing = ProposerSlashing::default();
        proposer_slashing.signed_header_1.message = header(1, 2, 1);
        proposer_slashing.signed_header_2.message = header(1, 2, 1);

        let error = validate_proposer_slashing(&config, &state, proposer_slashing)
            .expect_err("identical headers are not evidence of equivocation");

        assert!(matches!(
            error.downcast_ref(),
            Some(Error::ProposerSlashingHeadersIdentical { .. }),
        ));

        proposer_slashing.signed_header_2.message = header(1, 2, 2);

        assert!(validate_proposer_slashing(&config, &state, proposer_slashing).is_ok());
    }

    #[test]
    fn proposer_slashing_requires_matching_slots() {
        let config = Config::minimal();
        let state = state_with_validators(4);

        let mut proposer_slashing = ProposerSlashing::default();
        proposer_slashing.signed_header_1.message = header(1, 2, 1);
        proposer_slashing.signed_header_2.message = header(2, 2, 2);

        let error = validate_proposer_slashing(&config, &state, proposer_slashing)
            .expect_err("headers from different slots are not slashable");

        assert!(matches!(
            error.downcast_ref(),
            Some(Error::ProposerSlashingSlotMismatch { slot_1: 1, slot_2: 2 }),
        ));
    }

    #[test]
    fn proposer_slashing_slashes_the_proposer() -> Result<()> {
        let config = Config::minimal();
        let mut state = state_with_validators(4);

        let mut proposer_slashing = ProposerSlashing::default();
        proposer_slashing.signed_header_1.message = header(1, 2, 1);
        proposer_slashing.signed_header_2.message = header(1, 2, 2);

        process_proposer_slashing(&config, &mut state, proposer_slashing, 0)?;

        assert!(state.validators[2].slashed);
        assert!(state.balances[0] > 32_000_000_000);

        Ok(())
    }

    #[test]
    fn attester_slashing_slashes_the_intersection() -> Result<()> {
        let config = Config::minimal();
        let mut state = state_with_validators(6);

        let data_1 = AttestationData {
            target: Checkpoint {
                epoch: 1,
                root: H256::repeat_byte(1),
            },
            ..AttestationData::default()
        };

        let data_2 = AttestationData {
            target: Checkpoint {
                epoch: 1,
                root: H256::repeat_byte(2),
            },
            ..AttestationData::default()
        };

        let attester_slashing = AttesterSlashing {
            attestation_1: indexed_attestation(vec![1, 2, 3], data_1),
            attestation_2: indexed_attestation(vec![2, 3, 5], data_2),
        };

        assert_eq!(
            validate_attester_slashing(&config, &state, &attester_slashing)?,
            [2, 3],
        );

        process_attester_slashing(&config, &mut state, &attester_slashing, 0)?;

        let slashed = (0..)
            .zip(&state.validators)
            .filter(|(_, validator)| validator.slashed)
            .map(|(index, _)| index)
            .collect_vec();

        assert_eq!(slashed, [2, 3]);

        Ok(())
    }

    #[test]
    fn attester_slashing_without_common_attesters_is_rejected() {
        let config = Config::minimal();
        let state = state_with_validators(6);

        let data_1 = AttestationData::default();
        let data_2 = AttestationData {
            beacon_block_root: H256::repeat_byte(1),
            ..AttestationData::default()
        };

        let attester_slashing = AttesterSlashing {
            attestation_1: indexed_attestation(vec![1], data_1),
            attestation_2: indexed_attestation(vec![2], data_2),
        };

        let error = validate_attester_slashing(&config, &state, &attester_slashing)
            .expect_err("disjoint attestations slash nobody");

        assert!(matches!(error.downcast_ref(), Some(Error::NoAttestersSlashed)));
    }

    #[test]
    fn voluntary_exit_requires_shard_committee_period() -> Result<()> {
        let config = Config::minimal();
        let mut state = state_with_validators(4);

        let mut exit = SignedVoluntaryExit::default();
        exit.message.validator_index = 1;

        let error = process_voluntary_exit(&config, &mut state, exit)
            .expect_err("validators cannot exit right after activation");

        assert!(matches!(
            error.downcast_ref(),
            Some(Error::ValidatorHasNotBeenActiveLongEnough { index: 1, .. }),
        ));

        state.slot = config.shard_committee_period * config.slots_per_epoch.get();

        process_voluntary_exit(&config, &mut state, exit)?;

        assert_ne!(state.validators[1].exit_epoch, FAR_FUTURE_EPOCH);

        Ok(())
    }

    #[test]
    fn randao_reveal_is_mixed_into_current_epoch() -> Result<()> {
        let config = Config::minimal();
        let mut state = state_with_validators(1);
        let body = BeaconBlockBody::default();

        state.slot = 9;

        process_randao(&config, &mut state, &body)?;

        assert_eq!(state.randao_mixes[1], hashing::hash_768(body.randao_reveal));
        assert_eq!(state.randao_mixes[0], H256::zero());

        Ok(())
    }

    #[test]
    fn execution_payload_timestamp_must_match_slot() -> Result<()> {
        let config = Config::minimal();
        let mut state = state_with_validators(1);

        state.slot = 3;
        state.genesis_time = 1000;

        let mut payload = ExecutionPayload {
            block_hash: H256::repeat_byte(1),
            timestamp: 1000,
            ..ExecutionPayload::default()
        };

        let error = process_execution_payload(&config, &mut state, &payload)
            .expect_err("timestamp of slot 3 is 1018");

        assert!(matches!(
            error.downcast_ref(),
            Some(Error::ExecutionPayloadTimestampMismatch {
                computed: 1018,
                in_block: 1000,
            }),
        ));

        payload.timestamp = 1018;

        process_execution_payload(&config, &mut state, &payload)?;

        assert_eq!(
            state.latest_execution_payload_header.block_hash,
            H256::repeat_byte(1),
        );

        Ok(())
    }
}
