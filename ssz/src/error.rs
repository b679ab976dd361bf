use thiserror::Error;

use crate::gindex::Gindex;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum GindexError {
    #[error("generalized index cannot be zero")]
    Zero,
    #[error("generalized index string is empty")]
    Empty,
    #[error("generalized index string must start with 1, found {found:?}")]
    MissingLeadingOne { found: char },
    #[error("generalized index string contains invalid character {found:?}")]
    InvalidCharacter { found: char },
    #[error("generalized index has {depth} levels but at most 63 are supported")]
    TooDeep { depth: usize },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum TreeError {
    #[error("path to {gindex} passes through a leaf at depth {depth}")]
    PathThroughLeaf { gindex: Gindex, depth: u8 },
    #[error("{gindexes} generalized indices were supplied with {nodes} nodes")]
    LengthMismatch { gindexes: usize, nodes: usize },
    #[error("generalized indices in a batch must be at the same depth ({expected} != {actual})")]
    DepthMismatch { expected: u8, actual: u8 },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
#[error("expected list to have no more than {maximum} elements, found {actual} elements")]
pub struct ListTooLong {
    pub maximum: usize,
    pub actual: usize,
}
