pub mod accessors;
pub mod epoch_context;
pub mod error;
pub mod misc;
pub mod mutators;
pub mod predicates;
pub mod signature_sets;
pub mod signing;
pub mod verifier;
