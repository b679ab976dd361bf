//! Beacon chain types: primitives, configuration, containers and the state.

pub mod beacon_state;
pub mod config;
pub mod consts;
pub mod containers;
pub mod participation;
pub mod primitives;

mod container_impls;
