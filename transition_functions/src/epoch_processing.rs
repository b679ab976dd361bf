use core::{mem, num::NonZeroU64};
use std::sync::Arc;

use anyhow::Result;
use helper_functions::{
    accessors::{
        active_validator_indices, get_block_root, get_current_epoch, get_next_epoch,
        get_next_sync_committee, get_previous_epoch, get_randao_mix, get_total_active_balance,
        get_total_balance,
    },
    epoch_context::EpochContext,
    mutators::decrease_balance,
};
use itertools::Itertools as _;
use tap::TryConv as _;
use types::{
    beacon_state::BeaconState,
    config::Config,
    consts::{GENESIS_EPOCH, TIMELY_TARGET_FLAG_INDEX},
    containers::Checkpoint,
    participation::{has_flag, EpochParticipation},
    primitives::{Epoch, Gwei},
};

pub fn process_epoch(
    config: &Config,
    state: &mut BeaconState,
    epoch_context: &EpochContext,
) -> Result<()> {
    let total_active_balance = get_total_active_balance(config, state)?;

    process_justification_and_finalization(config, state, total_active_balance)?;
    process_slashings(config, state, total_active_balance)?;
    process_effective_balance_updates(config, state);
    process_slashings_reset(config, state)?;
    process_randao_mixes_reset(config, state)?;
    process_participation_flag_updates(state);
    process_sync_committee_updates(config, state, epoch_context)?;

    Ok(())
}

pub fn process_justification_and_finalization(
    config: &Config,
    state: &mut BeaconState,
    total_active_balance: NonZeroU64,
) -> Result<()> {
    // > Initial FFG checkpoint values have a `0x00` stub for `root`.
    // > Skip FFG updates in the first two epochs to avoid
    // > corner cases that might result in modifying this stub.
    if get_current_epoch(config, state) <= GENESIS_EPOCH + 1 {
        return Ok(());
    }

    let previous_epoch = get_previous_epoch(config, state);
    let current_epoch = get_current_epoch(config, state);

    let previous_target_balance = target_balance(
        config,
        state,
        &state.previous_epoch_participation,
        previous_epoch,
    )?;

    let current_target_balance = target_balance(
        config,
        state,
        &state.current_epoch_participation,
        current_epoch,
    )?;

    weigh_justification_and_finalization(
        config,
        state,
        total_active_balance.get(),
        previous_target_balance,
        current_target_balance,
    )
}

pub fn weigh_justification_and_finalization(
    config: &Config,
    state: &mut BeaconState,
    total_active_balance: Gwei,
    previous_epoch_target_balance: Gwei,
    current_epoch_target_balance: Gwei,
) -> Result<()> {
    let previous_epoch = get_previous_epoch(config, state);
    let current_epoch = get_current_epoch(config, state);
    let old_previous_justified_checkpoint = state.previous_justified_checkpoint;
    let old_current_justified_checkpoint = state.current_justified_checkpoint;

    // > Process justifications
    state.previous_justified_checkpoint = state.current_justified_checkpoint;
    state.justification_bits.shift_right(1);

    for (epoch, bit, target_balance) in [
        (previous_epoch, 1, previous_epoch_target_balance),
        (current_epoch, 0, current_epoch_target_balance),
    ] {
        if target_balance * 3 >= total_active_balance * 2 {
            state.current_justified_checkpoint = Checkpoint {
                epoch,
                root: get_block_root(config, state, epoch)?,
            };

            state.justification_bits.set(bit, true);
        }
    }

    // > Process finalizations
    let bits = &state.justification_bits;

    // > The 2nd/3rd/4th most recent epochs are justified, the 2nd using the 4th as source
    if bits[1..4].all() && old_previous_justified_checkpoint.epoch + 3 == current_epoch {
        state.finalized_checkpoint = old_previous_justified_checkpoint;
    }

    // > The 2nd/3rd most recent epochs are justified, the 2nd using the 3rd as source
    if bits[1..3].all() && old_previous_justified_checkpoint.epoch + 2 == current_epoch {
        state.finalized_checkpoint = old_previous_justified_checkpoint;
    }

    // > The 1st/2nd/3rd most recent epochs are justified, the 1st using the 3rd as source
    if bits[0..3].all() && old_current_justified_checkpoint.epoch + 2 == current_epoch {
        state.finalized_checkpoint = old_current_justified_checkpoint;
    }

    // > The 1st/2nd most recent epochs are justified, the 1st using the 2nd as source
    if bits[0..2].all() && old_current_justified_checkpoint.epoch + 1 == current_epoch {
        state.finalized_checkpoint = old_current_justified_checkpoint;
    }

    Ok(())
}

pub fn process_slashings(
    config: &Config,
    state: &mut BeaconState,
    total_active_balance: NonZeroU64,
) -> Result<()> {
    let current_epoch = get_current_epoch(config, state);
    let withdrawable_epoch = current_epoch + config.epochs_per_slashings_vector.get() / 2;
    let increment = config.effective_balance_increment;

    let adjusted_total_slashing_balance = state
        .slashings
        .iter()
        .sum::<Gwei>()
        .saturating_mul(config.proportional_slashing_multiplier)
        .min(total_active_balance.get());

    let penalties = (0..)
        .zip(&state.validators)
        .filter(|(_, validator)| {
            validator.slashed && validator.withdrawable_epoch == withdrawable_epoch
        })
        .map(|(index, validator)| {
            // > Factored out from penalty numerator to avoid uint64 overflow
            let penalty_numerator =
                validator.effective_balance / increment * adjusted_total_slashing_balance;
            let penalty = penalty_numerator / total_active_balance * increment.get();
            (index, penalty)
        })
        .collect_vec();

    for (index, penalty) in penalties {
        decrease_balance(state, index, penalty)?;
    }

    Ok(())
}

pub fn process_effective_balance_updates(config: &Config, state: &mut BeaconState) {
    let increment = config.effective_balance_increment.get();
    let hysteresis_increment = increment / config.hysteresis_quotient;
    let downward_threshold = hysteresis_increment * config.hysteresis_downward_multiplier;
    let upward_threshold = hysteresis_increment * config.hysteresis_upward_multiplier;

    // > Update effective balances with hysteresis
    for (validator, balance) in state.validators.iter_mut().zip(state.balances.iter().copied()) {
        let below = balance + downward_threshold < validator.effective_balance;
        let above = validator.effective_balance + upward_threshold < balance;

        if below || above {
            validator.effective_balance =
                (balance - balance % increment).min(config.max_effective_balance);
        }
    }
}

pub fn process_slashings_reset(config: &Config, state: &mut BeaconState) -> Result<()> {
    let next_epoch = get_next_epoch(config, state);
    let position = historical_position(next_epoch, state.slashings.len())?;

    // > Reset slashings
    state.slashings[position] = 0;

    Ok(())
}

pub fn process_randao_mixes_reset(config: &Config, state: &mut BeaconState) -> Result<()> {
    let current_epoch = get_current_epoch(config, state);
    let next_epoch = get_next_epoch(config, state);
    let position = historical_position(next_epoch, state.randao_mixes.len())?;

    // > Set randao mix
    state.randao_mixes[position] = get_randao_mix(state, current_epoch);

    Ok(())
}

/// Moves current participation to previous and starts the next epoch with zeroed flags.
pub fn process_participation_flag_updates(state: &mut BeaconState) {
    let zeroed = vec![0; state.validator_count()];

    state.previous_epoch_participation = mem::take(&mut state.current_epoch_participation);
    state.current_epoch_participation.bulk_replace(zeroed);
}

pub fn process_sync_committee_updates(
    config: &Config,
    state: &mut BeaconState,
    epoch_context: &EpochContext,
) -> Result<()> {
    let next_epoch = get_next_epoch(config, state);

    if !config.is_altair_enabled(next_epoch)
        || next_epoch % config.epochs_per_sync_committee_period != 0
    {
        return Ok(());
    }

    let committee = get_next_sync_committee(config, state, epoch_context.pubkeys())?;

    state.current_sync_committee =
        mem::replace(&mut state.next_sync_committee, Arc::new(committee));

    Ok(())
}

fn target_balance(
    config: &Config,
    state: &BeaconState,
    participation: &EpochParticipation,
    epoch: Epoch,
) -> Result<Gwei> {
    let participating = active_validator_indices(state, epoch).filter(|index| {
        usize::try_from(*index).is_ok_and(|position| {
            !state.validators[position].slashed
                && participation
                    .get(position)
                    .is_some_and(|flags| has_flag(flags, TIMELY_TARGET_FLAG_INDEX))
        })
    });

    Ok(get_total_balance(config, state, participating)?.get())
}

fn historical_position(epoch: Epoch, length: usize) -> Result<usize> {
    Ok((epoch % length as u64).try_conv::<usize>()?)
}

#[cfg(test)]
mod tests {
    use types::{consts::FAR_FUTURE_EPOCH, containers::Validator, primitives::H256};

    use super::*;

    fn state_with_validators(config: &Config, count: u64) -> BeaconState {
        let mut state = BeaconState::empty(config);

        for _ in 0..count {
            state
                .validators
                .push(Validator {
                    effective_balance: config.max_effective_balance,
                    activation_epoch: 0,
                    exit_epoch: FAR_FUTURE_EPOCH,
                    withdrawable_epoch: FAR_FUTURE_EPOCH,
                    ..Validator::default()
                })
                .expect("registry limit is far above the validator count in tests");

            state
                .balances
                .push(config.max_effective_balance)
                .expect("registry limit is far above the validator count in tests");
        }

        state.previous_epoch_participation = EpochParticipation::zeroed(count as usize);
        state.current_epoch_participation = EpochParticipation::zeroed(count as usize);

        state
    }

    #[test]
    fn supermajority_of_target_votes_justifies_both_epochs() -> Result<()> {
        let config = Config::minimal();
        let mut state = state_with_validators(&config, 4);

        // Last slot of epoch 3.
        state.slot = 31;

        for (position, root) in state.block_roots.iter_mut().enumerate() {
            *root = H256::repeat_byte(position as u8 + 1);
        }

        weigh_justification_and_finalization(&config, &mut state, 100, 67, 67)?;

        assert_eq!(state.current_justified_checkpoint.epoch, 3);
        assert_eq!(state.current_justified_checkpoint.root, H256::repeat_byte(25));
        assert!(state.justification_bits[0]);
        assert!(state.justification_bits[1]);

        Ok(())
    }

    #[test]
    fn consecutive_justification_finalizes_previous_checkpoint() -> Result<()> {
        let config = Config::minimal();
        let mut state = state_with_validators(&config, 4);

        state.slot = 31;
        state.current_justified_checkpoint = Checkpoint {
            epoch: 2,
            root: H256::repeat_byte(2),
        };
        state.justification_bits.set(0, true);

        weigh_justification_and_finalization(&config, &mut state, 100, 0, 67)?;

        assert_eq!(state.finalized_checkpoint.epoch, 2);
        assert_eq!(state.previous_justified_checkpoint.epoch, 2);
        assert_eq!(state.current_justified_checkpoint.epoch, 3);

        Ok(())
    }

    #[test]
    fn insufficient_votes_do_not_justify() -> Result<()> {
        let config = Config::minimal();
        let mut state = state_with_validators(&config, 4);

        state.slot = 31;

        weigh_justification_and_finalization(&config, &mut state, 100, 66, 66)?;

        assert_eq!(state.current_justified_checkpoint, Checkpoint::default());
        assert!(state.justification_bits.not_any());

        Ok(())
    }

    #[test]
    fn participation_is_rotated() {
        let config = Config::minimal();
        let mut state = state_with_validators(&config, 3);

        state.current_epoch_participation.queue_update(1, 0b111);

        process_participation_flag_updates(&mut state);

        assert_eq!(state.previous_epoch_participation.get(1), Some(0b111));
        assert_eq!(state.current_epoch_participation.len(), 3);
        assert!(state.current_epoch_participation.iter().all(|flags| flags == 0));
    }

    #[test]
    fn effective_balance_follows_balance_with_hysteresis() {
        let config = Config::minimal();
        let mut state = state_with_validators(&config, 2);

        // Within the downward threshold of 0.25 ETH.
        state.balances[0] = config.max_effective_balance - 200_000_000;
        // Beyond it.
        state.balances[1] = config.max_effective_balance - 1_500_000_000;

        process_effective_balance_updates(&config, &mut state);

        assert_eq!(state.validators[0].effective_balance, config.max_effective_balance);
        assert_eq!(state.validators[1].effective_balance, 30_000_000_000);
    }

    #[test]
    fn randao_mix_is_carried_into_next_epoch() -> Result<()> {
        let config = Config::minimal();
        let mut state = state_with_validators(&config, 1);

        state.slot = 15;
        state.randao_mixes[1] = H256::repeat_byte(9);

        process_randao_mixes_reset(&config, &mut state)?;

        assert_eq!(state.randao_mixes[2], H256::repeat_byte(9));

        Ok(())
    }

    #[test]
    fn slashed_validators_are_penalized_halfway_to_withdrawal() -> Result<()> {
        let config = Config::minimal();
        let mut state = state_with_validators(&config, 4);
        let total_active_balance = get_total_active_balance(&config, &state)?;

        state.validators[2].slashed = true;
        state.validators[2].withdrawable_epoch = config.epochs_per_slashings_vector.get() / 2;
        state.slashings[0] = config.max_effective_balance;

        process_slashings(&config, &mut state, total_active_balance)?;

        // 32 ETH slashed, doubled by the multiplier, out of 128 ETH active.
        assert_eq!(state.balances[2], config.max_effective_balance - 16_000_000_000);
        assert_eq!(state.balances[1], config.max_effective_balance);

        Ok(())
    }
}
