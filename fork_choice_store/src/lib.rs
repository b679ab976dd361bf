//! Tree of imported blocks with the execution status of each one.
//!
//! Blocks are kept from the last finalized block onward. Every block except the anchor has its
//! parent in the store.
//!
//! Execution statuses follow optimistic sync rules:
//! - A block whose payload was not validated yet is [`ExecutionStatus::Optimistic`].
//! - A block becoming valid makes all of its optimistic ancestors valid.
//! - A block becoming invalid makes all of its descendants invalid.
//!
//! Notes on nomenclature:
//! - Pruning means removing blocks that do not descend from the finalized block.
//! - Invalidating means marking a block and its descendants as [`ExecutionStatus::Invalid`].
//!
//! The head is the viable leaf with the highest slot. Attestations are not tracked, so there is
//! no LMD GHOST weighing. A leaf is viable if it descends from the justified block and is not
//! invalid.

pub use crate::{
    error::Error,
    misc::{ApplyBlockChanges, ChainLink, ExecutionStatus},
    store::Store,
};

mod error;
mod misc;
mod store;
