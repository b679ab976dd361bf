use core::num::NonZeroU64;

use anyhow::{ensure, Result};
use bls::PublicKey;
use itertools::Itertools as _;
use num_integer::Roots as _;
use ssz::{BitList, H256};
use tap::{Pipe as _, TryConv as _};
use types::{
    beacon_state::BeaconState,
    config::Config,
    consts::{
        DOMAIN_BEACON_PROPOSER, DOMAIN_SYNC_COMMITTEE, GENESIS_EPOCH,
        MAX_VALIDATORS_PER_COMMITTEE, SYNC_COMMITTEE_SIZE, TIMELY_HEAD_FLAG_INDEX,
        TIMELY_SOURCE_FLAG_INDEX, TIMELY_TARGET_FLAG_INDEX,
    },
    containers::{AttestationData, SyncCommittee, Validator},
    participation::add_flag,
    primitives::{
        Domain, DomainType, Epoch, Gwei, ParticipationFlags, PublicKeyBytes, Slot, ValidatorIndex,
    },
};

use crate::{epoch_context::PubkeyCache, error::Error, misc, predicates};

#[must_use]
pub fn get_current_epoch(config: &Config, state: &BeaconState) -> Epoch {
    misc::compute_epoch_at_slot(config, state.slot)
}

#[must_use]
pub fn get_previous_epoch(config: &Config, state: &BeaconState) -> Epoch {
    get_current_epoch(config, state)
        .saturating_sub(1)
        .max(GENESIS_EPOCH)
}

#[must_use]
pub fn get_next_epoch(config: &Config, state: &BeaconState) -> Epoch {
    get_current_epoch(config, state) + 1
}

pub fn get_validator(state: &BeaconState, index: ValidatorIndex) -> Result<&Validator> {
    index
        .try_conv::<usize>()
        .ok()
        .and_then(|position| state.validators.get(position))
        .ok_or_else(|| Error::ValidatorNotFound { index }.into())
}

pub fn get_balance(state: &BeaconState, index: ValidatorIndex) -> Result<Gwei> {
    index
        .try_conv::<usize>()
        .ok()
        .and_then(|position| state.balances.get(position))
        .copied()
        .ok_or_else(|| Error::ValidatorNotFound { index }.into())
}

// > Return the block root at a recent ``slot``.
pub fn get_block_root_at_slot(state: &BeaconState, slot: Slot) -> Result<H256> {
    let history_length = state.block_roots.len().try_conv::<u64>()?;

    ensure!(
        slot < state.slot && state.slot <= slot + history_length,
        Error::SlotOutOfRange { slot },
    );

    let position = (slot % history_length).try_conv::<usize>()?;

    Ok(state.block_roots[position])
}

// > Return the block root at the start of a recent ``epoch``.
pub fn get_block_root(config: &Config, state: &BeaconState, epoch: Epoch) -> Result<H256> {
    get_block_root_at_slot(state, misc::compute_start_slot_at_epoch(config, epoch))
}

#[must_use]
pub fn get_randao_mix(state: &BeaconState, epoch: Epoch) -> H256 {
    let position = epoch % state.randao_mixes.len() as u64;
    state.randao_mixes[position as usize]
}

pub fn active_validator_indices(
    state: &BeaconState,
    epoch: Epoch,
) -> impl Iterator<Item = ValidatorIndex> + '_ {
    state
        .validators
        .iter()
        .zip(0..)
        .filter(move |(validator, _)| predicates::is_active_validator(validator, epoch))
        .map(|(_, index)| index)
}

#[must_use]
pub fn active_validator_count(state: &BeaconState, epoch: Epoch) -> u64 {
    active_validator_indices(state, epoch).count() as u64
}

#[must_use]
pub fn get_seed(config: &Config, state: &BeaconState, epoch: Epoch, domain_type: DomainType) -> H256 {
    let mix = get_randao_mix(
        state,
        epoch + config.epochs_per_historical_vector.get() - config.min_seed_lookahead - 1,
    );

    hashing::hash_32_64_256(domain_type.to_fixed_bytes(), epoch, mix)
}

#[must_use]
pub fn get_committee_count_per_slot(config: &Config, state: &BeaconState, epoch: Epoch) -> u64 {
    let active_count = active_validator_count(state, epoch);
    misc::committee_count_from_active_validator_count(config, active_count)
}

/// Computes the proposer for `slot` without consulting any cache.
pub fn compute_beacon_proposer_index(
    config: &Config,
    state: &BeaconState,
    slot: Slot,
) -> Result<ValidatorIndex> {
    let epoch = misc::compute_epoch_at_slot(config, slot);
    let indices = active_validator_indices(state, epoch).collect_vec();
    let epoch_seed = get_seed(config, state, epoch, DOMAIN_BEACON_PROPOSER);
    let seed = hashing::hash_256_64(epoch_seed, slot);

    misc::compute_proposer_index(config, state, &indices, seed)
}

// > Return the combined effective balance of the ``indices``.
// > ``EFFECTIVE_BALANCE_INCREMENT`` Gwei minimum to avoid divisions by zero.
pub fn get_total_balance(
    config: &Config,
    state: &BeaconState,
    indices: impl IntoIterator<Item = ValidatorIndex>,
) -> Result<NonZeroU64> {
    let mut total: Gwei = 0;

    for index in indices {
        total += get_validator(state, index)?.effective_balance;
    }

    Ok(NonZeroU64::new(total)
        .unwrap_or(config.effective_balance_increment)
        .max(config.effective_balance_increment))
}

pub fn get_total_active_balance(config: &Config, state: &BeaconState) -> Result<NonZeroU64> {
    let current_epoch = get_current_epoch(config, state);
    get_total_balance(config, state, active_validator_indices(state, current_epoch))
}

#[must_use]
pub fn get_domain(
    config: &Config,
    state: &BeaconState,
    domain_type: DomainType,
    epoch: Option<Epoch>,
) -> Domain {
    let epoch = epoch.unwrap_or_else(|| get_current_epoch(config, state));

    let fork_version = if epoch < state.fork.epoch {
        state.fork.previous_version
    } else {
        state.fork.current_version
    };

    misc::compute_domain(
        config,
        domain_type,
        Some(fork_version),
        Some(state.genesis_validators_root),
    )
}

/// Maps set bits of `aggregation_bits` to members of `committee`.
pub fn get_attesting_indices<'committee>(
    committee: &'committee [ValidatorIndex],
    aggregation_bits: &'committee BitList<MAX_VALIDATORS_PER_COMMITTEE>,
) -> Result<impl Iterator<Item = ValidatorIndex> + 'committee> {
    ensure!(
        committee.len() == aggregation_bits.len(),
        Error::CommitteeLengthMismatch {
            aggregation_bitlist_length: aggregation_bits.len(),
            committee_length: committee.len(),
        },
    );

    Ok(aggregation_bits.ones().map(|position| committee[position]))
}

#[must_use]
pub fn get_base_reward_per_increment(config: &Config, total_active_balance: NonZeroU64) -> Gwei {
    config.effective_balance_increment.get() * config.base_reward_factor
        / total_active_balance.get().sqrt()
}

pub fn get_base_reward(
    config: &Config,
    state: &BeaconState,
    index: ValidatorIndex,
    base_reward_per_increment: Gwei,
) -> Result<Gwei> {
    let increments =
        get_validator(state, index)?.effective_balance / config.effective_balance_increment;

    Ok(increments * base_reward_per_increment)
}

// > Return the flag indices that are satisfied by an attestation.
pub fn get_attestation_participation_flags(
    config: &Config,
    state: &BeaconState,
    data: AttestationData,
    inclusion_delay: u64,
) -> Result<ParticipationFlags> {
    let justified_checkpoint = if data.target.epoch == get_current_epoch(config, state) {
        state.current_justified_checkpoint
    } else {
        state.previous_justified_checkpoint
    };

    // > Matching roots
    let is_matching_source = data.source == justified_checkpoint;

    ensure!(is_matching_source, Error::AttestationSourceMismatch);

    let is_matching_target = data.target.root == get_block_root(config, state, data.target.epoch)?;
    let is_matching_head =
        is_matching_target && data.beacon_block_root == get_block_root_at_slot(state, data.slot)?;

    let slots_per_epoch = config.slots_per_epoch.get();
    let mut flags = 0;

    if inclusion_delay <= slots_per_epoch.sqrt() {
        flags = add_flag(flags, TIMELY_SOURCE_FLAG_INDEX);
    }

    if is_matching_target && inclusion_delay <= slots_per_epoch {
        flags = add_flag(flags, TIMELY_TARGET_FLAG_INDEX);
    }

    if is_matching_head && inclusion_delay == config.min_attestation_inclusion_delay.get() {
        flags = add_flag(flags, TIMELY_HEAD_FLAG_INDEX);
    }

    Ok(flags)
}

// > Return the sync committee indices, with possible duplicates, for the next sync committee.
pub fn get_next_sync_committee_indices(
    config: &Config,
    state: &BeaconState,
) -> Result<Vec<ValidatorIndex>> {
    let next_epoch = get_next_epoch(config, state);
    let indices = active_validator_indices(state, next_epoch).collect_vec();

    let total = indices
        .len()
        .try_conv::<u64>()?
        .pipe(NonZeroU64::new)
        .ok_or(Error::NoActiveValidators)?;

    let seed = get_seed(config, state, next_epoch, DOMAIN_SYNC_COMMITTEE);
    let max_random_byte = u64::from(u8::MAX);

    let sync_committee_indices = (0..u64::MAX / H256::len_bytes() as u64)
        .flat_map(move |quotient| {
            hashing::hash_256_64(seed, quotient)
                .to_fixed_bytes()
                .into_iter()
                .map(u64::from)
        })
        .zip(0..)
        .filter_map(|(random_byte, attempt)| {
            let shuffled_index_of_index =
                misc::compute_shuffled_index(config, attempt % total, total, seed)
                    .try_conv::<usize>()
                    .expect(
                        "shuffled_index_of_index fits in usize because it is less than indices.len()",
                    );

            let candidate_index = indices[shuffled_index_of_index];

            let effective_balance = get_validator(state, candidate_index)
                .expect("candidate_index was produced by enumerating active validators")
                .effective_balance;

            (effective_balance * max_random_byte >= config.max_effective_balance * random_byte)
                .then_some(candidate_index)
        })
        .take(SYNC_COMMITTEE_SIZE)
        .collect();

    Ok(sync_committee_indices)
}

// > Return the next sync committee, with possible pubkey duplicates.
pub fn get_next_sync_committee(
    config: &Config,
    state: &BeaconState,
    pubkey_cache: &PubkeyCache,
) -> Result<SyncCommittee> {
    let indices = get_next_sync_committee_indices(config, state)?;

    let pubkeys = indices
        .iter()
        .map(|index| Ok(get_validator(state, *index)?.pubkey))
        .collect::<Result<Vec<PublicKeyBytes>>>()?;

    let public_keys = indices
        .iter()
        .map(|index| pubkey_cache.get(*index).copied())
        .collect::<Result<Vec<PublicKey>>>()?;

    let aggregate_pubkey = PublicKey::aggregate_nonempty(public_keys)?.into();

    Ok(SyncCommittee {
        pubkeys,
        aggregate_pubkey,
    })
}

#[cfg(test)]
mod tests {
    use types::{
        consts::FAR_FUTURE_EPOCH,
        containers::Checkpoint,
    };

    use super::*;

    fn state_with_validators(config: &Config, count: usize) -> BeaconState {
        let mut state = BeaconState::empty(config);

        for index in 0..count {
            let validator = Validator {
                pubkey: PublicKeyBytes::repeat_byte(index as u8),
                effective_balance: config.max_effective_balance,
                exit_epoch: FAR_FUTURE_EPOCH,
                withdrawable_epoch: FAR_FUTURE_EPOCH,
                ..Validator::default()
            };

            state
                .validators
                .push(validator)
                .expect("test registries are far below the limit");

            state
                .balances
                .push(config.max_effective_balance)
                .expect("test registries are far below the limit");
        }

        state
    }

    #[test]
    fn block_root_at_slot_rejects_current_and_stale_slots() -> Result<()> {
        let config = Config::minimal();
        let mut state = state_with_validators(&config, 0);

        state.slot = 100;
        state.block_roots[99 % 64] = H256::repeat_byte(9);

        assert_eq!(get_block_root_at_slot(&state, 99)?, H256::repeat_byte(9));
        assert!(get_block_root_at_slot(&state, 100).is_err());
        assert!(get_block_root_at_slot(&state, 35).is_err());

        Ok(())
    }

    #[test]
    fn total_balance_has_a_floor_of_one_increment() -> Result<()> {
        let config = Config::minimal();
        let state = state_with_validators(&config, 0);

        assert_eq!(
            get_total_balance(&config, &state, [])?,
            config.effective_balance_increment,
        );

        Ok(())
    }

    #[test]
    fn attesting_indices_require_matching_length() -> Result<()> {
        let committee = [4, 8, 15];
        let mut bits = BitList::with_length(3)?;

        bits.set(0, true);
        bits.set(2, true);

        itertools::assert_equal(get_attesting_indices(&committee, &bits)?, [4, 15]);

        let short = BitList::with_length(2)?;

        assert!(get_attesting_indices(&committee, &short).is_err());

        Ok(())
    }

    #[test]
    fn attestation_with_wrong_source_is_rejected() {
        let config = Config::minimal();
        let mut state = state_with_validators(&config, 4);

        state.slot = 20;

        let data = AttestationData {
            slot: 17,
            source: Checkpoint {
                epoch: 1,
                root: H256::repeat_byte(1),
            },
            target: Checkpoint {
                epoch: 2,
                root: H256::zero(),
            },
            ..AttestationData::default()
        };

        assert!(get_attestation_participation_flags(&config, &state, data, 1).is_err());
    }

    #[test]
    fn timely_attestation_earns_all_flags() -> Result<()> {
        let config = Config::minimal();
        let mut state = state_with_validators(&config, 4);

        state.slot = 18;

        let data = AttestationData {
            slot: 17,
            target: Checkpoint {
                epoch: 2,
                root: H256::zero(),
            },
            ..AttestationData::default()
        };

        assert_eq!(
            get_attestation_participation_flags(&config, &state, data, 1)?,
            0b111,
        );

        Ok(())
    }

    #[test]
    fn sync_committee_indices_fill_the_committee() -> Result<()> {
        let config = Config::minimal();
        let state = state_with_validators(&config, 16);

        let indices = get_next_sync_committee_indices(&config, &state)?;

        assert_eq!(indices.len(), SYNC_COMMITTEE_SIZE);
        assert!(indices.iter().all(|index| *index < 16));

        Ok(())
    }

    #[test]
    fn domain_uses_previous_version_before_fork_epoch() {
        let config = Config::minimal();
        let mut state = BeaconState::empty(&config);

        state.fork.previous_version = config.altair_fork_version;
        state.fork.current_version = config.bellatrix_fork_version;
        state.fork.epoch = 5;

        assert_eq!(
            get_domain(&config, &state, DOMAIN_BEACON_PROPOSER, Some(4)),
            misc::compute_domain(
                &config,
                DOMAIN_BEACON_PROPOSER,
                Some(config.altair_fork_version),
                Some(H256::zero()),
            ),
        );
    }
}
