//! Chain segment import on top of the fork choice store.
//!
//! This crate handles the following concerns:
//! - [Verification of chain segments](`Controller::process_chain_segment`).
//!   Blocks are checked for sanity first. State transitions, collection of signature sets and
//!   execution payload validation then run concurrently for each epoch of the segment. The
//!   signatures of the whole segment are verified in one batch before anything is imported.
//! - Optimistic import of blocks whose payloads the execution engine has not validated yet.
//! - Invalidation of branches with invalid payloads.
//! - Caching of states advanced through empty slots.
//! - [Archival](`Archive`) of imported blocks and epoch boundary states.

pub use crate::{
    controller::Controller,
    error::{BlockError, ChainSegmentError},
    misc::ImportBlockOptions,
    storage::{Archive, ArchivedState, BlockByRoot, StateBySlot},
};

mod block_verifier;
mod controller;
mod error;
mod misc;
mod state_cache;
mod storage;
