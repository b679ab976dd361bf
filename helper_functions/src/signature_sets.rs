//! Builders of signature sets for every signed object in a block.
//!
//! A set pairs the public key (or keys) of the signer with the signing root and the signature as
//! it appears in the block. Sets are verified later, usually all at once with
//! [`crate::verifier::verify_signature_sets`].

use anyhow::{ensure, Result};
use bls::{PublicKey, SignatureBytes};
use types::{
    containers::{
        Attestation, IndexedAttestation, ProposerSlashing, SignedBeaconBlock,
        SignedBeaconBlockHeader, SignedVoluntaryExit,
    },
    primitives::H256,
};

use crate::{
    epoch_context::CachedBeaconState,
    error::{Error, SignatureKind},
    misc,
    signing::{RandaoEpoch, SignForSingleFork as _, SignForSingleForkAtSlot as _},
};

#[derive(Clone, Debug)]
pub enum SignatureSet {
    Single {
        public_key: PublicKey,
        signing_root: H256,
        signature: SignatureBytes,
        kind: SignatureKind,
    },
    Aggregate {
        public_keys: Vec<PublicKey>,
        signing_root: H256,
        signature: SignatureBytes,
        kind: SignatureKind,
    },
}

impl SignatureSet {
    #[must_use]
    pub const fn kind(&self) -> SignatureKind {
        match self {
            Self::Single { kind, .. } | Self::Aggregate { kind, .. } => *kind,
        }
    }

    #[must_use]
    pub const fn signing_root(&self) -> H256 {
        match self {
            Self::Single { signing_root, .. } | Self::Aggregate { signing_root, .. } => {
                *signing_root
            }
        }
    }

    #[must_use]
    pub const fn signature(&self) -> SignatureBytes {
        match self {
            Self::Single { signature, .. } | Self::Aggregate { signature, .. } => *signature,
        }
    }
}

pub fn proposer_signature_set(
    cached: &CachedBeaconState,
    block: &SignedBeaconBlock,
) -> Result<SignatureSet> {
    let CachedBeaconState {
        config,
        state,
        epoch_context,
    } = cached;

    Ok(SignatureSet::Single {
        public_key: *epoch_context.public_key(block.message.proposer_index)?,
        signing_root: block.message.signing_root(config, state),
        signature: block.signature,
        kind: SignatureKind::Block,
    })
}

pub fn randao_signature_set(
    cached: &CachedBeaconState,
    block: &SignedBeaconBlock,
) -> Result<SignatureSet> {
    let CachedBeaconState {
        config,
        state,
        epoch_context,
    } = cached;

    let epoch = misc::compute_epoch_at_slot(config, block.message.slot);

    Ok(SignatureSet::Single {
        public_key: *epoch_context.public_key(block.message.proposer_index)?,
        signing_root: RandaoEpoch::from(epoch).signing_root(config, state),
        signature: block.message.body.randao_reveal,
        kind: SignatureKind::Randao,
    })
}

/// Both headers of a proposer slashing are signed by the same proposer.
pub fn proposer_slashing_signature_sets(
    cached: &CachedBeaconState,
    proposer_slashing: &ProposerSlashing,
) -> Result<[SignatureSet; 2]> {
    let CachedBeaconState {
        config,
        state,
        epoch_context,
    } = cached;

    let set_for = |signed_header: &SignedBeaconBlockHeader| -> Result<_> {
        Ok(SignatureSet::Single {
            public_key: *epoch_context.public_key(signed_header.message.proposer_index)?,
            signing_root: signed_header.message.signing_root(config, state),
            signature: signed_header.signature,
            kind: SignatureKind::ProposerSlashing,
        })
    };

    Ok([
        set_for(&proposer_slashing.signed_header_1)?,
        set_for(&proposer_slashing.signed_header_2)?,
    ])
}

pub fn indexed_attestation_signature_set(
    cached: &CachedBeaconState,
    indexed_attestation: &IndexedAttestation,
    kind: SignatureKind,
) -> Result<SignatureSet> {
    let CachedBeaconState {
        config,
        state,
        epoch_context,
    } = cached;

    ensure!(
        !indexed_attestation.attesting_indices.is_empty(),
        Error::AttestationHasNoAttestingIndices,
    );

    let public_keys = indexed_attestation
        .attesting_indices
        .iter()
        .map(|index| epoch_context.public_key(*index).copied())
        .collect::<Result<_>>()?;

    Ok(SignatureSet::Aggregate {
        public_keys,
        signing_root: indexed_attestation.data.signing_root(config, state),
        signature: indexed_attestation.signature,
        kind,
    })
}

pub fn attestation_signature_set(
    cached: &CachedBeaconState,
    attestation: &Attestation,
) -> Result<SignatureSet> {
    let indexed_attestation = cached
        .epoch_context
        .indexed_attestation(&cached.config, attestation)?;

    indexed_attestation_signature_set(cached, &indexed_attestation, SignatureKind::Attestation)
}

pub fn voluntary_exit_signature_set(
    cached: &CachedBeaconState,
    signed_voluntary_exit: &SignedVoluntaryExit,
) -> Result<SignatureSet> {
    let CachedBeaconState {
        config,
        state,
        epoch_context,
    } = cached;

    let exit = signed_voluntary_exit.message;

    Ok(SignatureSet::Single {
        public_key: *epoch_context.public_key(exit.validator_index)?,
        signing_root: exit.signing_root(config, state),
        signature: signed_voluntary_exit.signature,
        kind: SignatureKind::VoluntaryExit,
    })
}

/// Returns `None` for an aggregate without participants, which must carry the infinity signature.
///
/// The domain is computed for the slot before `block.slot` rather than the slot before the state's
/// slot. Both are the same during block processing, but the block slot keeps the set correct when
/// it is built from an earlier state for batch verification.
pub fn sync_aggregate_signature_set(
    cached: &CachedBeaconState,
    block: &SignedBeaconBlock,
) -> Result<Option<SignatureSet>> {
    let CachedBeaconState {
        config,
        state,
        epoch_context,
    } = cached;

    let sync_aggregate = &block.message.body.sync_aggregate;

    let public_keys = sync_aggregate
        .sync_committee_bits
        .ones()
        .map(|position| {
            let index = epoch_context.sync_committee_member(position)?;
            epoch_context.public_key(index).copied()
        })
        .collect::<Result<Vec<_>>>()?;

    if public_keys.is_empty() {
        ensure!(
            sync_aggregate.sync_committee_signature.is_empty(),
            Error::SyncAggregateWithoutParticipants,
        );

        return Ok(None);
    }

    let previous_slot = block.message.slot.max(1) - 1;
    let signing_root = block
        .message
        .parent_root
        .signing_root(config, state, previous_slot);

    Ok(Some(SignatureSet::Aggregate {
        public_keys,
        signing_root,
        signature: sync_aggregate.sync_committee_signature,
        kind: SignatureKind::SyncAggregate,
    }))
}

/// Collects the signature sets of everything signed in `block`.
///
/// `cached` must be in the same epoch as `block`.
pub fn get_all_block_signature_sets(
    cached: &CachedBeaconState,
    block: &SignedBeaconBlock,
    skip_proposer_signature: bool,
) -> Result<Vec<SignatureSet>> {
    let body = &block.message.body;
    let mut signature_sets = Vec::new();

    if !skip_proposer_signature {
        signature_sets.push(proposer_signature_set(cached, block)?);
    }

    signature_sets.push(randao_signature_set(cached, block)?);

    for proposer_slashing in &body.proposer_slashings {
        signature_sets.extend(proposer_slashing_signature_sets(cached, proposer_slashing)?);
    }

    for attester_slashing in &body.attester_slashings {
        for indexed_attestation in [
            &attester_slashing.attestation_1,
            &attester_slashing.attestation_2,
        ] {
            signature_sets.push(indexed_attestation_signature_set(
                cached,
                indexed_attestation,
                SignatureKind::AttesterSlashing,
            )?);
        }
    }

    let attestation_sets = body
        .attestations
        .iter()
        .map(|attestation| attestation_signature_set(cached, attestation))
        .collect::<Result<Vec<_>>>()?;

    signature_sets.extend(attestation_sets);

    for voluntary_exit in &body.voluntary_exits {
        signature_sets.push(voluntary_exit_signature_set(cached, voluntary_exit)?);
    }

    let epoch = misc::compute_epoch_at_slot(&cached.config, block.message.slot);

    if cached.config.is_altair_enabled(epoch) {
        signature_sets.extend(sync_aggregate_signature_set(cached, block)?);
    }

    Ok(signature_sets)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bls::SecretKey;
    use types::{
        beacon_state::BeaconState, config::Config, consts::FAR_FUTURE_EPOCH,
        containers::Validator,
    };

    use super::*;

    fn cached_state(count: u8) -> Result<CachedBeaconState> {
        let config = Config::minimal();
        let mut state = BeaconState::empty(&config);

        for index in 0..count {
            let validator = Validator {
                pubkey: SecretKey::derive(&[index; 32])?.to_public_key().into(),
                effective_balance: config.max_effective_balance,
                exit_epoch: FAR_FUTURE_EPOCH,
                withdrawable_epoch: FAR_FUTURE_EPOCH,
                ..Validator::default()
            };

            state.validators.push(validator)?;
            state.balances.push(config.max_effective_balance)?;
        }

        CachedBeaconState::new(Arc::new(config), state)
    }

    #[test]
    fn empty_sync_aggregate_with_infinity_signature_has_no_set() -> Result<()> {
        let cached = cached_state(4)?;
        let block = SignedBeaconBlock::default();

        assert!(sync_aggregate_signature_set(&cached, &block)?.is_none());

        Ok(())
    }

    #[test]
    fn empty_sync_aggregate_with_real_signature_is_rejected() -> Result<()> {
        let cached = cached_state(4)?;
        let mut block = SignedBeaconBlock::default();

        block.message.body.sync_aggregate.sync_committee_signature =
            SecretKey::derive(&[1; 32])?.sign(H256::zero()).into();

        assert!(sync_aggregate_signature_set(&cached, &block).is_err());

        Ok(())
    }

    #[test]
    fn proposer_and_randao_sets_use_proposer_key() -> Result<()> {
        let cached = cached_state(4)?;
        let mut block = SignedBeaconBlock::default();

        block.message.proposer_index = 2;

        let proposer_set = proposer_signature_set(&cached, &block)?;
        let randao_set = randao_signature_set(&cached, &block)?;

        assert_eq!(proposer_set.kind(), SignatureKind::Block);
        assert_eq!(randao_set.kind(), SignatureKind::Randao);
        assert_ne!(proposer_set.signing_root(), randao_set.signing_root());

        block.message.proposer_index = 4;

        assert!(proposer_signature_set(&cached, &block).is_err());

        Ok(())
    }

    #[test]
    fn skipping_proposer_signature_drops_one_set() -> Result<()> {
        let cached = cached_state(4)?;
        let block = SignedBeaconBlock::default();

        assert_eq!(get_all_block_signature_sets(&cached, &block, false)?.len(), 2);
        assert_eq!(get_all_block_signature_sets(&cached, &block, true)?.len(), 1);

        Ok(())
    }
}
