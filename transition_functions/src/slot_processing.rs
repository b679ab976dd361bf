use std::sync::Arc;

use anyhow::{ensure, Result};
use helper_functions::{epoch_context::CachedBeaconState, misc};
use ssz::SszHash as _;
use tap::TryConv as _;
use types::{
    beacon_state::BeaconState,
    containers::BeaconBlock,
    primitives::{Slot, H256},
};

use crate::{epoch_processing, error::Error};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProcessSlots {
    Always,
    IfNeeded,
    Never,
}

impl ProcessSlots {
    #[must_use]
    pub const fn should_process(self, state: &BeaconState, block: &BeaconBlock) -> bool {
        match self {
            Self::Always => true,
            Self::IfNeeded => state.slot < block.slot,
            Self::Never => false,
        }
    }
}

/// Advances `cached` to `slot`, running epoch processing and rotating the epoch context at every
/// epoch boundary crossed.
pub fn process_slots(cached: &mut CachedBeaconState, slot: Slot) -> Result<()> {
    ensure!(
        cached.state.slot < slot,
        Error::SlotNotLater {
            current: cached.state.slot,
            target: slot,
        },
    );

    let config = Arc::clone(&cached.config);

    while cached.state.slot < slot {
        process_slot(&mut cached.state)?;

        // > Process epoch on the start slot of the next epoch
        if misc::is_epoch_start(&config, cached.state.slot + 1) {
            epoch_processing::process_epoch(&config, &mut cached.state, &cached.epoch_context)?;
        }

        cached.state.slot += 1;

        if misc::is_epoch_start(&config, cached.state.slot) {
            cached.epoch_context.rotate(&config, &cached.state)?;
        }
    }

    Ok(())
}

/// Caches the roots of the state and the latest block in the historical vectors.
///
/// Queued participation updates must have been flushed.
pub fn process_slot(state: &mut BeaconState) -> Result<()> {
    let position = (state.slot % state.state_roots.len() as u64).try_conv::<usize>()?;

    // > Cache state root
    let previous_state_root = state.root();
    state.state_roots[position] = previous_state_root;

    // > Cache latest block header state root
    if state.latest_block_header.state_root == H256::zero() {
        state.latest_block_header.state_root = previous_state_root;
    }

    // > Cache block root
    let previous_block_root = state.latest_block_header.hash_tree_root();
    state.block_roots[position] = previous_block_root;

    Ok(())
}

#[cfg(test)]
mod tests {
    use types::config::Config;

    use super::*;

    #[test]
    fn process_slot_fills_in_header_state_root() -> Result<()> {
        let mut state = BeaconState::empty(&Config::minimal());
        let state_root = state.root();

        process_slot(&mut state)?;

        assert_eq!(state.state_roots[0], state_root);
        assert_eq!(state.latest_block_header.state_root, state_root);
        assert_eq!(
            state.block_roots[0],
            state.latest_block_header.hash_tree_root(),
        );

        Ok(())
    }

    #[test]
    fn process_slot_keeps_existing_header_state_root() -> Result<()> {
        let mut state = BeaconState::empty(&Config::minimal());
        let existing = H256::repeat_byte(7);

        state.latest_block_header.state_root = existing;

        process_slot(&mut state)?;

        assert_eq!(state.latest_block_header.state_root, existing);

        Ok(())
    }

    #[test]
    fn if_needed_skips_blocks_in_the_same_slot() {
        let mut state = BeaconState::empty(&Config::minimal());
        let block = BeaconBlock {
            slot: 3,
            ..BeaconBlock::default()
        };

        state.slot = 3;

        assert!(!ProcessSlots::IfNeeded.should_process(&state, &block));
        assert!(ProcessSlots::Always.should_process(&state, &block));

        state.slot = 2;

        assert!(ProcessSlots::IfNeeded.should_process(&state, &block));
        assert!(!ProcessSlots::Never.should_process(&state, &block));
    }
}
