use anyhow::Result;
use tap::TryConv as _;
use types::{
    beacon_state::BeaconState,
    config::Config,
    consts::{FAR_FUTURE_EPOCH, PROPOSER_WEIGHT, WEIGHT_DENOMINATOR},
    containers::Validator,
    primitives::{Gwei, ValidatorIndex},
};

use crate::{accessors, error::Error, misc};

pub fn validator_mut(state: &mut BeaconState, index: ValidatorIndex) -> Result<&mut Validator> {
    index
        .try_conv::<usize>()
        .ok()
        .and_then(|position| state.validators.get_mut(position))
        .ok_or_else(|| Error::ValidatorNotFound { index }.into())
}

fn balance_mut(state: &mut BeaconState, index: ValidatorIndex) -> Result<&mut Gwei> {
    index
        .try_conv::<usize>()
        .ok()
        .and_then(|position| state.balances.get_mut(position))
        .ok_or_else(|| Error::ValidatorNotFound { index }.into())
}

pub fn increase_balance(state: &mut BeaconState, index: ValidatorIndex, delta: Gwei) -> Result<()> {
    let balance = balance_mut(state, index)?;
    *balance = balance.saturating_add(delta);
    Ok(())
}

// > Decrease the validator balance at index ``index`` by ``delta``, with underflow protection.
pub fn decrease_balance(state: &mut BeaconState, index: ValidatorIndex, delta: Gwei) -> Result<()> {
    let balance = balance_mut(state, index)?;
    *balance = balance.saturating_sub(delta);
    Ok(())
}

#[must_use]
pub fn get_validator_churn_limit(config: &Config, state: &BeaconState) -> u64 {
    let current_epoch = accessors::get_current_epoch(config, state);
    let active_count = accessors::active_validator_count(state, current_epoch);

    (active_count / config.churn_limit_quotient).max(config.min_per_epoch_churn_limit)
}

// > Initiate the exit of the validator with index ``index``.
pub fn initiate_validator_exit(
    config: &Config,
    state: &mut BeaconState,
    index: ValidatorIndex,
) -> Result<()> {
    // > Return if validator already initiated exit
    if accessors::get_validator(state, index)?.exit_epoch != FAR_FUTURE_EPOCH {
        return Ok(());
    }

    // > Compute exit queue epoch
    let current_epoch = accessors::get_current_epoch(config, state);

    let mut exit_queue_epoch = state
        .validators
        .iter()
        .map(|validator| validator.exit_epoch)
        .filter(|exit_epoch| *exit_epoch != FAR_FUTURE_EPOCH)
        .fold(
            misc::compute_activation_exit_epoch(config, current_epoch),
            Ord::max,
        );

    let exit_queue_churn = state
        .validators
        .iter()
        .filter(|validator| validator.exit_epoch == exit_queue_epoch)
        .count() as u64;

    if exit_queue_churn >= get_validator_churn_limit(config, state) {
        exit_queue_epoch += 1;
    }

    // > Set validator exit epoch and withdrawable epoch
    let validator = validator_mut(state, index)?;

    validator.exit_epoch = exit_queue_epoch;
    validator.withdrawable_epoch = exit_queue_epoch + config.min_validator_withdrawability_delay;

    Ok(())
}

// > Slash the validator with index ``slashed_index``.
pub fn slash_validator(
    config: &Config,
    state: &mut BeaconState,
    slashed_index: ValidatorIndex,
    proposer_index: ValidatorIndex,
    whistleblower_index: Option<ValidatorIndex>,
) -> Result<()> {
    let epoch = accessors::get_current_epoch(config, state);

    initiate_validator_exit(config, state, slashed_index)?;

    let validator = validator_mut(state, slashed_index)?;

    validator.slashed = true;
    validator.withdrawable_epoch = validator
        .withdrawable_epoch
        .max(epoch + config.epochs_per_slashings_vector.get());

    let effective_balance = validator.effective_balance;

    let slashings_position = (epoch % state.slashings.len() as u64).try_conv::<usize>()?;
    state.slashings[slashings_position] += effective_balance;

    decrease_balance(
        state,
        slashed_index,
        effective_balance / config.min_slashing_penalty_quotient,
    )?;

    // > Apply proposer and whistleblower rewards
    let whistleblower_index = whistleblower_index.unwrap_or(proposer_index);
    let whistleblower_reward = effective_balance / config.whistleblower_reward_quotient;
    let proposer_reward = whistleblower_reward * PROPOSER_WEIGHT / WEIGHT_DENOMINATOR;

    increase_balance(state, proposer_index, proposer_reward)?;
    increase_balance(
        state,
        whistleblower_index,
        whistleblower_reward - proposer_reward,
    )?;

    Ok(())
}
