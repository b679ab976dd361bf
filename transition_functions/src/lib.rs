//! State transition functions for a beacon state with Altair participation tracking and a
//! Bellatrix execution payload.

pub use crate::{
    error::Error,
    slot_processing::{process_slot, process_slots, ProcessSlots},
    state_transition::{state_transition, verify_signatures, StateRootPolicy},
};

pub mod block_processing;
pub mod epoch_processing;

mod error;
mod slot_processing;
mod state_transition;
