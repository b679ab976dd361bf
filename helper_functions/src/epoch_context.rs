//! Caches derived from a [`BeaconState`] that are expensive to recompute.
//!
//! An [`EpochContext`] is valid for one epoch. Shufflings and public keys are kept behind [`Arc`]s
//! so that cloning a [`CachedBeaconState`] to hand a snapshot to another task is cheap.

use std::{collections::HashMap, sync::Arc};

use anyhow::{ensure, Result};
use bls::PublicKey;
use itertools::Itertools as _;
use rayon::iter::{IntoParallelRefIterator as _, ParallelIterator as _};
use tap::TryConv as _;
use types::{
    beacon_state::BeaconState,
    config::Config,
    consts::{DOMAIN_BEACON_ATTESTER, DOMAIN_BEACON_PROPOSER},
    containers::{Attestation, IndexedAttestation},
    primitives::{CommitteeIndex, Epoch, PublicKeyBytes, Slot, ValidatorIndex, H256},
};

use crate::{accessors, error::Error, misc};

/// Decompressed public keys of validators in the registry, indexed both ways.
#[derive(Clone, Default, Debug)]
pub struct PubkeyCache {
    public_keys: Vec<PublicKey>,
    indices: HashMap<PublicKeyBytes, ValidatorIndex>,
}

impl PubkeyCache {
    pub fn new(state: &BeaconState) -> Result<Self> {
        let mut cache = Self::default();
        cache.sync(state)?;
        Ok(cache)
    }

    /// Decompresses keys of validators added to the registry since the last call.
    pub fn sync(&mut self, state: &BeaconState) -> Result<()> {
        let new_validators = state
            .validators
            .get(self.public_keys.len()..)
            .unwrap_or_default();

        if new_validators.is_empty() {
            return Ok(());
        }

        let decompressed = new_validators
            .par_iter()
            .map(|validator| PublicKey::try_from(validator.pubkey))
            .collect::<Result<Vec<_>, _>>()?;

        for (validator, index) in new_validators.iter().zip(self.public_keys.len() as u64..) {
            self.indices.entry(validator.pubkey).or_insert(index);
        }

        self.public_keys.extend(decompressed);

        Ok(())
    }

    pub fn get(&self, index: ValidatorIndex) -> Result<&PublicKey> {
        index
            .try_conv::<usize>()
            .ok()
            .and_then(|position| self.public_keys.get(position))
            .ok_or_else(|| Error::ValidatorNotFound { index }.into())
    }

    #[must_use]
    pub fn index_of(&self, pubkey: PublicKeyBytes) -> Option<ValidatorIndex> {
        self.indices.get(&pubkey).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.public_keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.public_keys.is_empty()
    }
}

/// Active validators of one epoch in committee order.
#[derive(Debug)]
pub struct Shuffling {
    epoch: Epoch,
    seed: H256,
    shuffled: Vec<ValidatorIndex>,
    committees_per_slot: u64,
}

impl Shuffling {
    pub fn compute(config: &Config, state: &BeaconState, epoch: Epoch) -> Result<Self> {
        let mut shuffled = accessors::active_validator_indices(state, epoch).collect_vec();
        let seed = accessors::get_seed(config, state, epoch, DOMAIN_BEACON_ATTESTER);
        let committees_per_slot = misc::committee_count_from_active_validator_count(
            config,
            shuffled.len().try_conv::<u64>()?,
        );

        shuffling::shuffle_slice(&mut shuffled, seed, config.shuffle_round_count)?;

        Ok(Self {
            epoch,
            seed,
            shuffled,
            committees_per_slot,
        })
    }

    #[must_use]
    pub const fn epoch(&self) -> Epoch {
        self.epoch
    }

    #[must_use]
    pub const fn seed(&self) -> H256 {
        self.seed
    }

    #[must_use]
    pub const fn committees_per_slot(&self) -> u64 {
        self.committees_per_slot
    }

    #[must_use]
    pub fn active_validator_count(&self) -> usize {
        self.shuffled.len()
    }

    // > Return the beacon committee at ``slot`` for ``index``.
    pub fn committee(
        &self,
        config: &Config,
        slot: Slot,
        index: CommitteeIndex,
    ) -> Result<&[ValidatorIndex]> {
        ensure!(
            index < self.committees_per_slot,
            Error::CommitteeIndexOutOfBounds {
                index,
                committees_per_slot: self.committees_per_slot,
            },
        );

        let committee_count = self.committees_per_slot * config.slots_per_epoch.get();
        let committee_number =
            misc::slots_since_epoch_start(config, slot) * self.committees_per_slot + index;

        let length = self.shuffled.len().try_conv::<u64>()?;
        let start = (length * committee_number / committee_count).try_conv::<usize>()?;
        let end = (length * (committee_number + 1) / committee_count).try_conv::<usize>()?;

        Ok(&self.shuffled[start..end])
    }
}

#[derive(Clone, Debug)]
pub struct EpochContext {
    epoch: Epoch,
    pubkeys: Arc<PubkeyCache>,
    previous_shuffling: Arc<Shuffling>,
    current_shuffling: Arc<Shuffling>,
    proposers: Arc<[ValidatorIndex]>,
    current_sync_committee_indices: Arc<[ValidatorIndex]>,
}

impl EpochContext {
    pub fn new(config: &Config, state: &BeaconState) -> Result<Self> {
        let pubkeys = Arc::new(PubkeyCache::new(state)?);
        let epoch = accessors::get_current_epoch(config, state);
        let previous_epoch = accessors::get_previous_epoch(config, state);
        let current_shuffling = Arc::new(Shuffling::compute(config, state, epoch)?);

        let previous_shuffling = if previous_epoch == epoch {
            Arc::clone(&current_shuffling)
        } else {
            Arc::new(Shuffling::compute(config, state, previous_epoch)?)
        };

        let proposers = compute_proposers(config, state, epoch)?;
        let current_sync_committee_indices = sync_committee_indices(&pubkeys, state);

        Ok(Self {
            epoch,
            pubkeys,
            previous_shuffling,
            current_shuffling,
            proposers,
            current_sync_committee_indices,
        })
    }

    /// Moves the context to the epoch `state` has just entered.
    ///
    /// The previous shuffling is reused instead of being computed again.
    pub fn rotate(&mut self, config: &Config, state: &BeaconState) -> Result<()> {
        let epoch = accessors::get_current_epoch(config, state);

        ensure!(
            epoch == self.epoch + 1,
            Error::EpochNotCached {
                epoch,
                previous: self.previous_shuffling.epoch,
                current: self.epoch,
            },
        );

        if self.pubkeys.len() < state.validator_count() {
            Arc::make_mut(&mut self.pubkeys).sync(state)?;
        }

        let next_shuffling = Arc::new(Shuffling::compute(config, state, epoch)?);

        self.previous_shuffling = core::mem::replace(&mut self.current_shuffling, next_shuffling);
        self.proposers = compute_proposers(config, state, epoch)?;
        self.current_sync_committee_indices = sync_committee_indices(&self.pubkeys, state);
        self.epoch = epoch;

        Ok(())
    }

    #[must_use]
    pub const fn epoch(&self) -> Epoch {
        self.epoch
    }

    #[must_use]
    pub fn pubkeys(&self) -> &PubkeyCache {
        &self.pubkeys
    }

    pub fn public_key(&self, index: ValidatorIndex) -> Result<&PublicKey> {
        self.pubkeys.get(index)
    }

    pub fn shuffling(&self, epoch: Epoch) -> Result<&Shuffling> {
        if epoch == self.epoch {
            return Ok(&self.current_shuffling);
        }

        if epoch == self.previous_shuffling.epoch {
            return Ok(&self.previous_shuffling);
        }

        Err(Error::EpochNotCached {
            epoch,
            previous: self.previous_shuffling.epoch,
            current: self.epoch,
        }
        .into())
    }

    pub fn committee_count_per_slot(&self, epoch: Epoch) -> Result<u64> {
        Ok(self.shuffling(epoch)?.committees_per_slot())
    }

    pub fn beacon_committee(
        &self,
        config: &Config,
        slot: Slot,
        index: CommitteeIndex,
    ) -> Result<&[ValidatorIndex]> {
        let epoch = misc::compute_epoch_at_slot(config, slot);
        self.shuffling(epoch)?.committee(config, slot, index)
    }

    pub fn beacon_proposer_index(&self, config: &Config, slot: Slot) -> Result<ValidatorIndex> {
        let epoch = misc::compute_epoch_at_slot(config, slot);

        ensure!(
            epoch == self.epoch,
            Error::EpochNotCached {
                epoch,
                previous: self.previous_shuffling.epoch,
                current: self.epoch,
            },
        );

        let position = misc::slots_since_epoch_start(config, slot).try_conv::<usize>()?;

        Ok(self.proposers[position])
    }

    /// Validator indices of the current sync committee in committee order.
    ///
    /// Empty if any member's key is not in the registry.
    #[must_use]
    pub fn current_sync_committee_indices(&self) -> &[ValidatorIndex] {
        &self.current_sync_committee_indices
    }

    pub fn sync_committee_member(&self, position: usize) -> Result<ValidatorIndex> {
        self.current_sync_committee_indices
            .get(position)
            .copied()
            .ok_or_else(|| Error::SyncCommitteeMemberUnknown { position }.into())
    }

    // > Return the indexed attestation corresponding to ``attestation``.
    pub fn indexed_attestation(
        &self,
        config: &Config,
        attestation: &Attestation,
    ) -> Result<IndexedAttestation> {
        let committee =
            self.beacon_committee(config, attestation.data.slot, attestation.data.index)?;

        let attesting_indices =
            accessors::get_attesting_indices(committee, &attestation.aggregation_bits)?
                .sorted_unstable()
                .dedup();

        Ok(IndexedAttestation {
            attesting_indices: ssz::ContiguousList::try_from_iter(attesting_indices)?,
            data: attestation.data,
            signature: attestation.signature,
        })
    }
}

/// A [`BeaconState`] together with the [`EpochContext`] for its current epoch.
#[derive(Clone, Debug)]
pub struct CachedBeaconState {
    pub config: Arc<Config>,
    pub state: BeaconState,
    pub epoch_context: EpochContext,
}

impl CachedBeaconState {
    pub fn new(config: Arc<Config>, state: BeaconState) -> Result<Self> {
        let epoch_context = EpochContext::new(&config, &state)?;

        Ok(Self {
            config,
            state,
            epoch_context,
        })
    }

    #[must_use]
    pub const fn slot(&self) -> Slot {
        self.state.slot
    }

    #[must_use]
    pub fn current_epoch(&self) -> Epoch {
        accessors::get_current_epoch(&self.config, &self.state)
    }

    /// Root of the underlying state.
    ///
    /// Participation updates must have been flushed.
    #[must_use]
    pub fn root(&self) -> H256 {
        self.state.root()
    }
}

fn compute_proposers(
    config: &Config,
    state: &BeaconState,
    epoch: Epoch,
) -> Result<Arc<[ValidatorIndex]>> {
    let indices = accessors::active_validator_indices(state, epoch).collect_vec();
    let epoch_seed = accessors::get_seed(config, state, epoch, DOMAIN_BEACON_PROPOSER);

    misc::slots_in_epoch(config, epoch)
        .map(|slot| {
            let seed = hashing::hash_256_64(epoch_seed, slot);
            misc::compute_proposer_index(config, state, &indices, seed)
        })
        .collect()
}

fn sync_committee_indices(pubkeys: &PubkeyCache, state: &BeaconState) -> Arc<[ValidatorIndex]> {
    state
        .current_sync_committee
        .pubkeys
        .iter()
        .map(|pubkey| pubkeys.index_of(*pubkey))
        .collect::<Option<_>>()
        .unwrap_or_else(|| Arc::from(Vec::new()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use bls::SecretKey;
    use types::{consts::FAR_FUTURE_EPOCH, containers::Validator};

    use super::*;

    fn state(config: &Config, count: u8) -> Result<BeaconState> {
        let mut state = BeaconState::empty(config);

        for index in 0..count {
            let pubkey = SecretKey::derive(&[index; 32])?.to_public_key().into();

            let validator = Validator {
                pubkey,
                effective_balance: config.max_effective_balance,
                exit_epoch: FAR_FUTURE_EPOCH,
                withdrawable_epoch: FAR_FUTURE_EPOCH,
                ..Validator::default()
            };

            state.validators.push(validator)?;
            state.balances.push(config.max_effective_balance)?;
        }

        Ok(state)
    }

    #[test]
    fn committees_of_an_epoch_partition_active_validators() -> Result<()> {
        let config = Config::minimal();
        let state = state(&config, 64)?;
        let context = EpochContext::new(&config, &state)?;

        let mut seen = HashSet::new();

        for slot in misc::slots_in_epoch(&config, 0) {
            for index in 0..context.committee_count_per_slot(0)? {
                for member in context.beacon_committee(&config, slot, index)? {
                    assert!(seen.insert(*member));
                }
            }
        }

        assert_eq!(seen.len(), 64);

        Ok(())
    }

    #[test]
    fn committees_match_unshuffled_definition() -> Result<()> {
        let config = Config::minimal();
        let state = state(&config, 20)?;
        let shuffling = Shuffling::compute(&config, &state, 0)?;
        let count = core::num::NonZeroU64::new(20).expect("20 is nonzero");

        let committee = shuffling.committee(&config, 0, 0)?;

        for (position, member) in committee.iter().enumerate() {
            let shuffled_index =
                misc::compute_shuffled_index(&config, position as u64, count, shuffling.seed());
            assert_eq!(*member, shuffled_index);
        }

        Ok(())
    }

    #[test]
    fn proposer_cache_matches_direct_computation() -> Result<()> {
        let config = Config::minimal();
        let state = state(&config, 16)?;
        let context = EpochContext::new(&config, &state)?;

        for slot in misc::slots_in_epoch(&config, 0) {
            assert_eq!(
                context.beacon_proposer_index(&config, slot)?,
                accessors::compute_beacon_proposer_index(&config, &state, slot)?,
            );
        }

        assert!(context.beacon_proposer_index(&config, 8).is_err());

        Ok(())
    }

    #[test]
    fn pubkey_cache_maps_both_ways() -> Result<()> {
        let config = Config::minimal();
        let state = state(&config, 4)?;
        let cache = PubkeyCache::new(&state)?;

        assert_eq!(cache.len(), 4);
        assert_eq!(cache.index_of(state.validators[2].pubkey), Some(2));
        assert_eq!(
            PublicKeyBytes::from(*cache.get(3)?),
            state.validators[3].pubkey,
        );
        assert!(cache.get(4).is_err());

        Ok(())
    }

    #[test]
    fn rotation_reuses_current_shuffling_as_previous() -> Result<()> {
        let config = Config::minimal();
        let mut state = state(&config, 16)?;
        let mut context = EpochContext::new(&config, &state)?;

        let committee = context.beacon_committee(&config, 3, 0)?.to_vec();

        state.slot = 8;
        context.rotate(&config, &state)?;

        assert_eq!(context.epoch(), 1);
        assert_eq!(context.beacon_committee(&config, 3, 0)?, committee);

        state.slot = 24;

        assert!(context.rotate(&config, &state).is_err());

        Ok(())
    }
}
