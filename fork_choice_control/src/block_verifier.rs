use std::sync::Arc;

use anyhow::{Error as AnyhowError, Result};
use execution_engine::{ExecutionEngine, PayloadStatusV1, PayloadValidationStatus};
use fork_choice_store::{ExecutionStatus, Store};
use helper_functions::{
    epoch_context::CachedBeaconState,
    signature_sets::{get_all_block_signature_sets, SignatureSet},
    verifier::{self, NullVerifier},
};
use log::debug;
use tokio_util::sync::CancellationToken;
use transition_functions::{ProcessSlots, StateRootPolicy};
use types::{
    consts::GENESIS_SLOT,
    containers::SignedBeaconBlock,
    primitives::{Slot, H256},
};

use crate::{error::BlockError, misc::ImportBlockOptions};

pub type BlockWithRoot = (H256, Arc<SignedBeaconBlock>);

/// A block that passed every check along with its post-state.
pub struct VerifiedBlock {
    pub block_root: H256,
    pub block: Arc<SignedBeaconBlock>,
    pub state: Arc<CachedBeaconState>,
    pub execution_status: ExecutionStatus,
}

/// Outcome of verifying blocks in order.
///
/// `values` holds results for the leading blocks that passed.
/// If `error` is present, it belongs to the block at position `values.len()`.
struct Partial<T> {
    values: Vec<T>,
    error: Option<BlockError>,
}

impl<T> Partial<T> {
    fn failed_at(&self) -> Option<usize> {
        self.error.as_ref().map(|_| self.values.len())
    }
}

/// Outcome of verifying the blocks of one epoch.
///
/// Signatures are only collected here. They are verified once for the whole segment by
/// [`verify_signature_sets`] before anything is committed.
pub struct EpochOutcome {
    pub verified: Vec<VerifiedBlock>,
    pub signature_sets: Result<Vec<SignatureSet>, BlockError>,
    pub error: Option<BlockError>,
}

#[derive(Clone, Copy, Debug)]
pub struct OptimisticImportPolicy {
    pub justified_execution_enabled: bool,
    pub current_slot: Slot,
    pub safe_slots_to_import_optimistically: u64,
}

impl OptimisticImportPolicy {
    const fn allows(self, block_slot: Slot) -> bool {
        self.justified_execution_enabled
            || block_slot + self.safe_slots_to_import_optimistically <= self.current_slot
    }
}

/// Drops ignorable blocks from `blocks` and rejects the segment if any other block fails a cheap
/// check.
///
/// Only the parent of the first remaining block has to be in the store. Later blocks are checked
/// against their predecessors during the state transition.
pub fn sanity_check(
    store: &Store,
    blocks: impl IntoIterator<Item = Arc<SignedBeaconBlock>>,
    options: ImportBlockOptions,
    current_slot: Slot,
) -> Result<Vec<BlockWithRoot>, BlockError> {
    let finalized_slot = store.finalized_slot();
    let mut relevant = vec![];

    for block in blocks {
        let block_root = block.root();
        let block_slot = block.slot();

        if block_slot == GENESIS_SLOT {
            if options.ignore_if_known {
                continue;
            }

            return Err(BlockError::GenesisBlock);
        }

        if block_slot <= finalized_slot {
            if options.ignore_if_finalized {
                continue;
            }

            return Err(BlockError::WouldRevertFinalizedSlot {
                block_slot,
                finalized_slot,
            });
        }

        if store.contains_block(block_root) {
            if options.ignore_if_known {
                continue;
            }

            return Err(BlockError::AlreadyKnown { block_root });
        }

        let parent_root = block.parent_root();

        if relevant.is_empty() && !store.contains_block(parent_root) {
            return Err(BlockError::ParentUnknown {
                block_root,
                parent_root,
            });
        }

        if block_slot > current_slot {
            return Err(BlockError::FutureSlot {
                block_slot,
                current_slot,
            });
        }

        relevant.push((block_root, block));
    }

    Ok(relevant)
}

/// Verifies blocks that are all in the same epoch.
///
/// `pre_state` must be the state of the first block's parent advanced to the first block's slot.
/// The state transitions, the collection of signature sets and the execution payloads are
/// processed concurrently. Once one of the first two fails, no further payloads are sent to the
/// execution engine.
pub async fn verify_epoch_segment(
    blocks: &[BlockWithRoot],
    pre_state: &CachedBeaconState,
    options: ImportBlockOptions,
    execution_engine: &impl ExecutionEngine,
    policy: OptimisticImportPolicy,
) -> EpochOutcome {
    let abort = CancellationToken::new();

    let state_transitions = async {
        let outcome = replay_state_transitions(blocks, pre_state).await;

        if outcome.error.is_some() {
            abort.cancel();
        }

        outcome
    };

    let signatures = async {
        let result = collect_signature_sets(blocks, pre_state, options).await;

        if result.is_err() {
            abort.cancel();
        }

        result
    };

    let execution_payloads = verify_execution_payloads(blocks, execution_engine, policy, &abort);

    let (state_transitions, signatures, execution_payloads) =
        tokio::join!(state_transitions, signatures, execution_payloads);

    aggregate(blocks, state_transitions, signatures, execution_payloads)
}

async fn replay_state_transitions(
    blocks: &[BlockWithRoot],
    pre_state: &CachedBeaconState,
) -> Partial<Arc<CachedBeaconState>> {
    let mut state = pre_state.clone();
    let mut post_states = Vec::with_capacity(blocks.len());

    for (position, (block_root, block)) in blocks.iter().enumerate() {
        if position > 0 {
            tokio::task::yield_now().await;
        }

        let result = transition_functions::state_transition(
            &mut state,
            block,
            ProcessSlots::IfNeeded,
            StateRootPolicy::Verify,
            NullVerifier,
        );

        if let Err(error) = result {
            return Partial {
                values: post_states,
                error: Some(state_transition_error(*block_root, &error)),
            };
        }

        post_states.push(Arc::new(state.clone()));
    }

    Partial {
        values: post_states,
        error: None,
    }
}

async fn collect_signature_sets(
    blocks: &[BlockWithRoot],
    pre_state: &CachedBeaconState,
    options: ImportBlockOptions,
) -> Result<Vec<SignatureSet>, BlockError> {
    if options.valid_signatures {
        return Ok(vec![]);
    }

    let mut signature_sets = vec![];

    for (position, (_, block)) in blocks.iter().enumerate() {
        if position > 0 {
            tokio::task::yield_now().await;
        }

        let block_sets =
            get_all_block_signature_sets(pre_state, block, options.valid_proposer_signature)
                .map_err(|error| invalid_signature(&error))?;

        signature_sets.extend(block_sets);
    }

    Ok(signature_sets)
}

/// Verifies the signature sets of a whole segment in one batch.
pub async fn verify_signature_sets(signature_sets: Vec<SignatureSet>) -> Result<(), BlockError> {
    if signature_sets.is_empty() {
        return Ok(());
    }

    debug!("verifying {} signatures", signature_sets.len());

    tokio::task::spawn_blocking(move || verifier::verify_signature_sets(signature_sets))
        .await
        .map_err(|error| invalid_signature(&AnyhowError::new(error)))?
        .map_err(|error| invalid_signature(&error))
}

async fn verify_execution_payloads(
    blocks: &[BlockWithRoot],
    execution_engine: &impl ExecutionEngine,
    policy: OptimisticImportPolicy,
    abort: &CancellationToken,
) -> Partial<ExecutionStatus> {
    let mut statuses = Vec::with_capacity(blocks.len());

    for (block_root, block) in blocks {
        let payload = block.execution_payload();

        if payload.is_default() {
            statuses.push(ExecutionStatus::PreMerge);
            continue;
        }

        let response = tokio::select! {
            biased;

            () = abort.cancelled() => None,
            response = execution_engine.notify_new_payload(*block_root, payload) => Some(response),
        };

        let Some(response) = response else {
            debug!("payload verification aborted at block {block_root:?}");

            return Partial {
                values: statuses,
                error: Some(BlockError::Aborted),
            };
        };

        match execution_status(*block_root, block.slot(), response, policy) {
            Ok(status) => statuses.push(status),
            Err(error) => {
                return Partial {
                    values: statuses,
                    error: Some(error),
                }
            }
        }
    }

    Partial {
        values: statuses,
        error: None,
    }
}

fn execution_status(
    block_root: H256,
    block_slot: Slot,
    response: Result<PayloadStatusV1>,
    policy: OptimisticImportPolicy,
) -> Result<ExecutionStatus, BlockError> {
    let PayloadStatusV1 {
        status,
        latest_valid_hash,
        validation_error,
    } = match response {
        Ok(payload_status) => payload_status,
        Err(error) => {
            return Err(BlockError::ExecutionEngineError {
                block_root,
                status: PayloadValidationStatus::ElError,
                latest_valid_hash: None,
                validation_error: Some(format!("{error:#}")),
            })
        }
    };

    match status {
        PayloadValidationStatus::Valid => Ok(ExecutionStatus::Valid),
        PayloadValidationStatus::Syncing | PayloadValidationStatus::Accepted => {
            if policy.allows(block_slot) {
                Ok(ExecutionStatus::Optimistic)
            } else {
                Err(BlockError::UnsafeOptimisticImport {
                    block_slot,
                    current_slot: policy.current_slot,
                })
            }
        }
        PayloadValidationStatus::Invalid
        | PayloadValidationStatus::InvalidBlockHash
        | PayloadValidationStatus::InvalidTerminalBlock
        | PayloadValidationStatus::ElError
        | PayloadValidationStatus::Unavailable => Err(BlockError::ExecutionEngineError {
            block_root,
            status,
            latest_valid_hash,
            validation_error,
        }),
    }
}

// A signature failure rejects the whole segment.
// Otherwise blocks are importable up to the first one that failed either of the other paths.
// An aborted payload path is never the cause of a failure, so the other error is reported.
fn aggregate(
    blocks: &[BlockWithRoot],
    state_transitions: Partial<Arc<CachedBeaconState>>,
    signature_sets: Result<Vec<SignatureSet>, BlockError>,
    execution_payloads: Partial<ExecutionStatus>,
) -> EpochOutcome {
    if signature_sets.is_err() {
        return EpochOutcome {
            verified: vec![],
            signature_sets,
            error: None,
        };
    }

    let transition_failed_at = state_transitions.failed_at();
    let payload_failed_at = execution_payloads.failed_at();
    let payload_aborted = matches!(execution_payloads.error, Some(BlockError::Aborted));

    let error = match (transition_failed_at, payload_failed_at) {
        (Some(transition_position), Some(payload_position))
            if payload_position < transition_position && !payload_aborted =>
        {
            execution_payloads.error
        }
        (Some(_), _) => state_transitions.error,
        (None, Some(_)) => execution_payloads.error,
        (None, None) => None,
    };

    let verified = blocks
        .iter()
        .zip(state_transitions.values)
        .zip(execution_payloads.values)
        .map(
            |(((block_root, block), state), execution_status)| VerifiedBlock {
                block_root: *block_root,
                block: Arc::clone(block),
                state,
                execution_status,
            },
        )
        .collect();

    EpochOutcome {
        verified,
        signature_sets,
        error,
    }
}

fn state_transition_error(block_root: H256, error: &AnyhowError) -> BlockError {
    match error.downcast_ref() {
        Some(transition_functions::Error::StateRootMismatch { computed, in_block }) => {
            BlockError::InvalidStateRoot {
                block_root,
                computed: *computed,
                in_block: *in_block,
            }
        }
        _ => BlockError::StateTransition {
            block_root,
            message: format!("{error:#}"),
        },
    }
}

fn invalid_signature(error: &AnyhowError) -> BlockError {
    BlockError::InvalidSignature {
        message: format!("{error:#}"),
    }
}
