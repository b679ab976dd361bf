use core::{num::NonZeroU64, ops::Range};

use anyhow::Result;
use ssz::SszHash;
use tap::{Pipe as _, TryConv as _};
use types::{
    beacon_state::BeaconState,
    config::Config,
    containers::{ForkData, SigningData},
    primitives::{
        Domain, DomainType, Epoch, Slot, SyncCommitteePeriod, UnixSeconds, ValidatorIndex,
        Version, H256,
    },
};

use crate::{accessors, error::Error};

#[must_use]
pub fn compute_epoch_at_slot(config: &Config, slot: Slot) -> Epoch {
    slot / config.slots_per_epoch
}

#[must_use]
pub const fn compute_start_slot_at_epoch(config: &Config, epoch: Epoch) -> Slot {
    epoch.saturating_mul(config.slots_per_epoch.get())
}

#[must_use]
pub fn is_epoch_start(config: &Config, slot: Slot) -> bool {
    slots_since_epoch_start(config, slot) == 0
}

#[must_use]
pub fn slots_since_epoch_start(config: &Config, slot: Slot) -> u64 {
    slot % config.slots_per_epoch
}

#[must_use]
pub const fn slots_in_epoch(config: &Config, epoch: Epoch) -> Range<Slot> {
    compute_start_slot_at_epoch(config, epoch)..compute_start_slot_at_epoch(config, epoch + 1)
}

#[must_use]
pub fn sync_committee_period(config: &Config, epoch: Epoch) -> SyncCommitteePeriod {
    epoch / config.epochs_per_sync_committee_period
}

#[must_use]
pub const fn compute_timestamp_at_slot(
    config: &Config,
    state: &BeaconState,
    slot: Slot,
) -> UnixSeconds {
    state.genesis_time + slot * config.seconds_per_slot.get()
}

#[must_use]
pub const fn compute_activation_exit_epoch(config: &Config, epoch: Epoch) -> Epoch {
    epoch + 1 + config.max_seed_lookahead
}

// > Return the 32-byte fork data root for the ``current_version`` and ``genesis_validators_root``.
// > This is used primarily in signature domains to avoid collisions across forks/chains.
#[must_use]
pub fn compute_fork_data_root(current_version: Version, genesis_validators_root: H256) -> H256 {
    ForkData {
        current_version,
        genesis_validators_root,
    }
    .hash_tree_root()
}

#[must_use]
pub fn compute_domain(
    config: &Config,
    domain_type: DomainType,
    fork_version: Option<Version>,
    genesis_validators_root: Option<H256>,
) -> Domain {
    let fork_version = fork_version.unwrap_or(config.genesis_fork_version);
    let genesis_validators_root = genesis_validators_root.unwrap_or_else(H256::zero);
    let fork_data_root = compute_fork_data_root(fork_version, genesis_validators_root);

    let mut domain = Domain::zero();
    domain[..DomainType::len_bytes()].copy_from_slice(domain_type.as_bytes());
    domain[DomainType::len_bytes()..].copy_from_slice(&fork_data_root[..28]);
    domain
}

pub fn compute_signing_root(object: &(impl SszHash + ?Sized), domain: Domain) -> H256 {
    SigningData {
        object_root: object.hash_tree_root(),
        domain,
    }
    .hash_tree_root()
}

#[must_use]
pub fn compute_shuffled_index(
    config: &Config,
    index: ValidatorIndex,
    index_count: NonZeroU64,
    seed: H256,
) -> ValidatorIndex {
    shuffling::shuffle_single(index, index_count, seed, config.shuffle_round_count)
}

#[must_use]
pub fn committee_count_from_active_validator_count(config: &Config, active_count: u64) -> u64 {
    (active_count / config.slots_per_epoch / config.target_committee_size)
        .clamp(1, config.max_committees_per_slot.get())
}

// > Return from ``indices`` a random index sampled by effective balance.
pub fn compute_proposer_index(
    config: &Config,
    state: &BeaconState,
    indices: &[ValidatorIndex],
    seed: H256,
) -> Result<ValidatorIndex> {
    let total = indices
        .len()
        .try_conv::<u64>()?
        .pipe(NonZeroU64::new)
        .ok_or(Error::NoActiveValidators)?;

    let max_random_byte = u64::from(u8::MAX);

    (0..u64::MAX / H256::len_bytes() as u64)
        .flat_map(|quotient| {
            hashing::hash_256_64(seed, quotient)
                .to_fixed_bytes()
                .into_iter()
                .map(u64::from)
        })
        .zip(0..)
        .find_map(|(random_byte, attempt)| {
            let shuffled_index_of_index =
                compute_shuffled_index(config, attempt % total, total, seed)
                    .try_conv::<usize>()
                    .expect(
                        "shuffled_index_of_index fits in usize because it is less than indices.len()",
                    );

            let candidate_index = indices[shuffled_index_of_index];

            let effective_balance = accessors::get_validator(state, candidate_index)
                .expect("candidate_index was produced by enumerating active validators")
                .effective_balance;

            (effective_balance * max_random_byte >= config.max_effective_balance * random_byte)
                .then_some(candidate_index)
        })
        .ok_or_else(|| Error::FailedToSelectProposer.into())
}

#[cfg(test)]
mod tests {
    use test_case::test_case;
    use types::consts::DOMAIN_RANDAO;

    use super::*;

    #[test_case(0 => 0)]
    #[test_case(7 => 0)]
    #[test_case(8 => 1)]
    #[test_case(17 => 2)]
    fn epoch_at_slot_uses_configured_epoch_length(slot: Slot) -> Epoch {
        compute_epoch_at_slot(&Config::minimal(), slot)
    }

    #[test_case(0 => 1; "at least one committee")]
    #[test_case(64 => 2)]
    #[test_case(1_000_000 => 4; "at most the configured maximum")]
    fn committee_count_is_clamped(active_count: u64) -> u64 {
        committee_count_from_active_validator_count(&Config::minimal(), active_count)
    }

    #[test]
    fn domain_starts_with_domain_type() {
        let config = Config::minimal();
        let domain = compute_domain(&config, DOMAIN_RANDAO, None, None);
        let fork_data_root = compute_fork_data_root(config.genesis_fork_version, H256::zero());

        assert_eq!(&domain[..4], DOMAIN_RANDAO.as_bytes());
        assert_eq!(&domain[4..], &fork_data_root[..28]);
    }

    #[test]
    fn signing_root_depends_on_domain() {
        let config = Config::minimal();
        let first = compute_domain(&config, DOMAIN_RANDAO, None, None);
        let second = compute_domain(&config, DOMAIN_RANDAO, None, Some(H256::repeat_byte(1)));

        assert_ne!(
            compute_signing_root(&5_u64, first),
            compute_signing_root(&5_u64, second),
        );
    }

    #[test]
    fn slots_in_epoch_spans_one_epoch() {
        assert_eq!(slots_in_epoch(&Config::minimal(), 2), 16..24);
    }
}
