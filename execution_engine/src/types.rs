use serde::{Deserialize, Serialize};
use types::primitives::ExecutionBlockHash;

#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadStatusV1 {
    pub status: PayloadValidationStatus,
    pub latest_valid_hash: Option<ExecutionBlockHash>,
    pub validation_error: Option<String>,
}

impl PayloadStatusV1 {
    #[must_use]
    pub const fn new(status: PayloadValidationStatus) -> Self {
        Self {
            status,
            latest_valid_hash: None,
            validation_error: None,
        }
    }

    #[must_use]
    pub const fn valid(block_hash: ExecutionBlockHash) -> Self {
        Self {
            status: PayloadValidationStatus::Valid,
            latest_valid_hash: Some(block_hash),
            validation_error: None,
        }
    }

    #[must_use]
    pub fn invalid(latest_valid_hash: Option<ExecutionBlockHash>, error: impl Into<String>) -> Self {
        Self {
            status: PayloadValidationStatus::Invalid,
            latest_valid_hash,
            validation_error: Some(error.into()),
        }
    }
}

/// Outcome of payload validation.
///
/// The first six variants are returned by the execution layer itself.
/// `ElError` and `Unavailable` are produced locally when the call fails or cannot be made.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayloadValidationStatus {
    Valid,
    Invalid,
    Syncing,
    Accepted,
    InvalidBlockHash,
    InvalidTerminalBlock,
    ElError,
    Unavailable,
}

impl PayloadValidationStatus {
    #[must_use]
    pub const fn is_valid(self) -> bool {
        matches!(self, Self::Valid)
    }

    /// Whether the payload and its descendants must be marked invalid.
    #[must_use]
    pub const fn is_invalid(self) -> bool {
        matches!(self, Self::Invalid)
    }

    /// Whether the block may be imported optimistically.
    #[must_use]
    pub const fn is_optimistic(self) -> bool {
        matches!(self, Self::Syncing | Self::Accepted)
    }
}
