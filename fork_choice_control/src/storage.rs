use std::sync::Arc;

use anyhow::Result;
use database::Storage;
use derive_more::Display;
use helper_functions::{epoch_context::CachedBeaconState, misc};
use log::debug;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use types::{
    beacon_state::BeaconState,
    config::Config,
    containers::SignedBeaconBlock,
    primitives::{Slot, H256},
};

/// Blocks and epoch boundary states persisted through a [`Storage`].
///
/// Every imported block is saved by root. A post-block state is saved by slot when its block is
/// the first one in an epoch, which bounds the number of slots needed to rebuild any later state.
pub struct Archive<S> {
    config: Arc<Config>,
    storage: S,
}

impl<S: Storage> Archive<S> {
    pub const fn new(config: Arc<Config>, storage: S) -> Self {
        Self { config, storage }
    }

    pub const fn storage(&self) -> &S {
        &self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    pub fn save_block(&self, block_root: H256, block: &SignedBeaconBlock) -> Result<()> {
        self.save(BlockByRoot(block_root), block)
    }

    /// Saves `state` if the block it belongs to is the first one in its epoch.
    ///
    /// Returns `true` if the state was saved.
    pub fn save_state_if_epoch_boundary(
        &self,
        block_root: H256,
        parent_slot: Slot,
        state: &CachedBeaconState,
    ) -> Result<bool> {
        let slot = state.slot();
        let epoch = misc::compute_epoch_at_slot(&self.config, slot);

        if slot > 0 && misc::compute_epoch_at_slot(&self.config, parent_slot) == epoch {
            return Ok(false);
        }

        self.save_state(block_root, state)?;

        Ok(true)
    }

    pub fn save_state(&self, block_root: H256, state: &CachedBeaconState) -> Result<()> {
        let slot = state.slot();

        debug!("archiving state at slot {slot} (block root: {block_root:?})");

        self.save(
            StateBySlot(slot),
            &ArchivedState {
                block_root,
                state: state.state.clone(),
            },
        )
    }

    pub fn block_by_root(&self, block_root: H256) -> Result<Option<SignedBeaconBlock>> {
        self.get(BlockByRoot(block_root))
    }

    pub fn state_by_slot(&self, slot: Slot) -> Result<Option<ArchivedState>> {
        self.get(StateBySlot(slot))
    }

    /// Loads the archived state with the highest slot along with the block it belongs to.
    pub fn latest_state(&self) -> Result<Option<(Arc<SignedBeaconBlock>, CachedBeaconState)>> {
        let Some(bytes) = self.storage.last_value(StateBySlot::PREFIX.as_bytes())? else {
            return Ok(None);
        };

        let ArchivedState { block_root, state } = bincode::deserialize(&bytes)?;

        let block = self
            .block_by_root(block_root)?
            .ok_or(Error::BlockNotFound { block_root })?;

        let cached = CachedBeaconState::new(Arc::clone(&self.config), state)?;

        Ok(Some((Arc::new(block), cached)))
    }

    fn save(&self, key: impl core::fmt::Display, value: &impl Serialize) -> Result<()> {
        self.storage
            .put(key.to_string().as_bytes(), &bincode::serialize(value)?)
    }

    fn get<V: DeserializeOwned>(&self, key: impl core::fmt::Display) -> Result<Option<V>> {
        self.storage
            .get(key.to_string().as_bytes())?
            .map(|bytes| bincode::deserialize(&bytes))
            .transpose()
            .map_err(Into::into)
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct ArchivedState {
    pub block_root: H256,
    pub state: BeaconState,
}

#[derive(Display)]
#[display("{}{_0:x}", Self::PREFIX)]
pub struct BlockByRoot(pub H256);

impl BlockByRoot {
    pub const PREFIX: &'static str = "b";
}

// Slots are zero-padded so that keys sort in slot order.
#[derive(Display)]
#[display("{}{_0:020}", Self::PREFIX)]
pub struct StateBySlot(pub Slot);

impl StateBySlot {
    pub const PREFIX: &'static str = "s";
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("block not found in storage: {block_root:?}")]
    BlockNotFound { block_root: H256 },
}
