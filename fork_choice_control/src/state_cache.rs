use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use fork_choice_store::Store;
use helper_functions::epoch_context::CachedBeaconState;
use log::debug;
use parking_lot::Mutex;
use thiserror::Error;
use transition_functions::process_slots;
use types::primitives::{Slot, H256};

/// States of blocks in the store advanced through empty slots.
///
/// Post-block states themselves live in the store.
#[derive(Default)]
pub struct StateCache {
    preprocessed: Mutex<HashMap<(H256, Slot), Arc<CachedBeaconState>>>,
}

impl StateCache {
    /// Returns the state of `block_root` advanced to `slot`.
    pub fn state_at_slot(
        &self,
        store: &Store,
        block_root: H256,
        slot: Slot,
    ) -> Result<Arc<CachedBeaconState>> {
        let chain_link = store
            .chain_link(block_root)
            .ok_or(Error::StateNotFound { block_root })?;

        let state = &chain_link.state;

        if slot <= state.slot() {
            return Ok(Arc::clone(state));
        }

        if let Some(state) = self.preprocessed.lock().get(&(block_root, slot)) {
            return Ok(Arc::clone(state));
        }

        debug!(
            "processing slots for state of block {block_root:?} from slot {} to {slot}",
            state.slot(),
        );

        let mut advanced = CachedBeaconState::clone(state);

        process_slots(&mut advanced, slot)?;

        let advanced = Arc::new(advanced);

        self.preprocessed
            .lock()
            .insert((block_root, slot), Arc::clone(&advanced));

        Ok(advanced)
    }

    pub fn prune(&self, finalized_slot: Slot) {
        self.preprocessed
            .lock()
            .retain(|(_, slot), _| finalized_slot <= *slot);
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("state not found in fork choice store: {block_root:?}")]
    StateNotFound { block_root: H256 },
}
