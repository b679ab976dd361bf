use anyhow::{ensure, Result};
use helper_functions::{
    epoch_context::CachedBeaconState,
    signature_sets::{self, SignatureSet},
    verifier::Verifier,
};
use types::containers::SignedBeaconBlock;

use crate::{
    block_processing,
    error::Error,
    slot_processing::{self, ProcessSlots},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StateRootPolicy {
    Verify,
    Trust,
}

impl StateRootPolicy {
    pub fn verify(self, cached: &CachedBeaconState, block: &SignedBeaconBlock) -> Result<()> {
        if self == Self::Trust {
            return Ok(());
        }

        let computed = cached.root();
        let in_block = block.state_root();

        ensure!(
            computed == in_block,
            Error::StateRootMismatch { computed, in_block },
        );

        Ok(())
    }
}

/// Applies `signed_block` to `cached`.
///
/// When `verifier` is not null, signature sets are built from the state after slot processing and
/// verified on the Rayon pool while the block is being processed.
pub fn state_transition<V: Verifier + Send>(
    cached: &mut CachedBeaconState,
    signed_block: &SignedBeaconBlock,
    process_slots: ProcessSlots,
    state_root_policy: StateRootPolicy,
    verifier: V,
) -> Result<()> {
    let block = &signed_block.message;

    // > Process slots (including those with no blocks) since block
    if process_slots.should_process(&cached.state, block) {
        slot_processing::process_slots(cached, block.slot)?;
    }

    let signature_sets = if V::IS_NULL {
        None
    } else {
        Some(signature_sets::get_all_block_signature_sets(
            cached,
            signed_block,
            false,
        )?)
    };

    let process_block = |cached: &mut CachedBeaconState| {
        // > Process block
        block_processing::process_block(cached, block)?;

        // > Verify state root
        state_root_policy.verify(cached, signed_block)
    };

    match signature_sets {
        Some(signature_sets) => {
            let (signature_result, block_result) = rayon::join(
                move || verify_signatures(verifier, signature_sets),
                || process_block(cached),
            );

            signature_result.and(block_result)
        }
        None => process_block(cached),
    }
}

pub fn verify_signatures(
    mut verifier: impl Verifier,
    signature_sets: impl IntoIterator<Item = SignatureSet>,
) -> Result<()> {
    let signature_sets = signature_sets.into_iter();

    verifier.reserve(signature_sets.size_hint().0);
    verifier.extend(signature_sets)?;
    verifier.finish()
}
