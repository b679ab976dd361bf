//! Deterministic keys, genesis states and signed blocks for tests.
//!
//! Every validator's key is derived from its index, so blocks built here pass full signature
//! verification.

use std::sync::Arc;

use anyhow::Result;
use bls::{SecretKey, Signature};
use helper_functions::{
    accessors,
    epoch_context::{CachedBeaconState, PubkeyCache},
    misc,
    signing::{RandaoEpoch, SignForSingleFork as _},
};
use ssz::{BitList, ContiguousList, SszHash as _};
use transition_functions::{block_processing, process_slots};
use types::{
    beacon_state::BeaconState,
    config::Config,
    consts::{FAR_FUTURE_EPOCH, GENESIS_EPOCH},
    containers::{
        Attestation, AttestationData, BeaconBlock, BeaconBlockBody, BeaconBlockHeader, Checkpoint,
        ExecutionPayload, Fork, SignedBeaconBlock, Validator,
    },
    primitives::{ExecutionBlockHash, Slot, UnixSeconds, ValidatorIndex, H256},
};

pub const GENESIS_TIME: UnixSeconds = 1_606_824_000;

/// # Panics
///
/// Never. The key material is always long enough for key generation.
#[must_use]
pub fn secret_key(validator_index: ValidatorIndex) -> SecretKey {
    let mut ikm = [0; 32];
    ikm[..8].copy_from_slice(&validator_index.to_le_bytes());
    ikm[8..].fill(0x42);

    SecretKey::derive(&ikm).expect("32 bytes of key material are enough to derive a key")
}

/// Builds a genesis state with `validator_count` active validators and the matching genesis block.
///
/// All forks enabled at genesis in `config` are active in the returned state.
/// The execution layer has not merged yet.
pub fn genesis(
    config: &Arc<Config>,
    validator_count: u64,
) -> Result<(Arc<SignedBeaconBlock>, CachedBeaconState)> {
    let mut state = BeaconState::empty(config);

    state.genesis_time = GENESIS_TIME;

    state.fork = Fork {
        previous_version: config.version_at(GENESIS_EPOCH),
        current_version: config.version_at(GENESIS_EPOCH),
        epoch: GENESIS_EPOCH,
    };

    for index in 0..validator_count {
        let validator = Validator {
            pubkey: secret_key(index).to_public_key().into(),
            effective_balance: config.max_effective_balance,
            activation_eligibility_epoch: GENESIS_EPOCH,
            activation_epoch: GENESIS_EPOCH,
            exit_epoch: FAR_FUTURE_EPOCH,
            withdrawable_epoch: FAR_FUTURE_EPOCH,
            ..Validator::default()
        };

        state.validators.push(validator)?;
        state.balances.push(config.max_effective_balance)?;
        state.previous_epoch_participation.push(0)?;
        state.current_epoch_participation.push(0)?;
    }

    state.genesis_validators_root = state.validators.hash_tree_root();

    let pubkeys = PubkeyCache::new(&state)?;
    let sync_committee = Arc::new(accessors::get_next_sync_committee(
        config, &state, &pubkeys,
    )?);

    state.current_sync_committee = Arc::clone(&sync_committee);
    state.next_sync_committee = sync_committee;

    state.latest_block_header = BeaconBlockHeader {
        body_root: BeaconBlockBody::default().hash_tree_root(),
        ..BeaconBlockHeader::default()
    };

    let block = SignedBeaconBlock {
        message: BeaconBlock {
            state_root: state.root(),
            ..BeaconBlock::default()
        },
        ..SignedBeaconBlock::default()
    };

    let cached = CachedBeaconState::new(Arc::clone(config), state)?;

    Ok((Arc::new(block), cached))
}

/// Builds a valid signed block on top of a post-block state.
pub struct BlockBuilder<'pre> {
    pre: &'pre CachedBeaconState,
    slot: Slot,
    execution_block_hash: Option<ExecutionBlockHash>,
    attest_previous_slot: bool,
}

impl<'pre> BlockBuilder<'pre> {
    #[must_use]
    pub const fn new(pre: &'pre CachedBeaconState, slot: Slot) -> Self {
        Self {
            pre,
            slot,
            execution_block_hash: None,
            attest_previous_slot: false,
        }
    }

    /// Includes an execution payload with the given hash that extends the previous one.
    #[must_use]
    pub const fn with_execution_payload(mut self, block_hash: ExecutionBlockHash) -> Self {
        self.execution_block_hash = Some(block_hash);
        self
    }

    /// Includes one attestation per committee of the previous slot with every member voting.
    #[must_use]
    pub const fn with_attestations(mut self) -> Self {
        self.attest_previous_slot = true;
        self
    }

    /// Returns the block along with its post-state.
    pub fn build(self) -> Result<(Arc<SignedBeaconBlock>, CachedBeaconState)> {
        let Self {
            pre,
            slot,
            execution_block_hash,
            attest_previous_slot,
        } = self;

        let mut post = pre.clone();

        if post.slot() < slot {
            process_slots(&mut post, slot)?;
        }

        let config = Arc::clone(&post.config);
        let epoch = misc::compute_epoch_at_slot(&config, slot);
        let proposer_index = post.epoch_context.beacon_proposer_index(&config, slot)?;
        let proposer_key = secret_key(proposer_index);

        let mut body = BeaconBlockBody {
            randao_reveal: RandaoEpoch::from(epoch)
                .sign(&config, &post.state, &proposer_key)
                .into(),
            ..BeaconBlockBody::default()
        };

        if let Some(block_hash) = execution_block_hash {
            let latest_header = &post.state.latest_execution_payload_header;

            body.execution_payload = ExecutionPayload {
                parent_hash: latest_header.block_hash,
                prev_randao: accessors::get_randao_mix(&post.state, post.current_epoch()),
                block_number: latest_header.block_number + 1,
                timestamp: misc::compute_timestamp_at_slot(&config, &post.state, slot),
                block_hash,
                ..ExecutionPayload::default()
            };
        }

        if attest_previous_slot && slot > 0 {
            let attestations = previous_slot_attestations(&post)?;
            body.attestations = ContiguousList::try_from_iter(attestations)?;
        }

        let mut block = BeaconBlock {
            slot,
            proposer_index,
            parent_root: post.state.latest_block_header.hash_tree_root(),
            state_root: H256::zero(),
            body,
        };

        block_processing::process_block(&mut post, &block)?;

        block.state_root = post.root();

        let signature = block.sign(&config, &post.state, &proposer_key).into();

        let signed_block = SignedBeaconBlock {
            message: block,
            signature,
        };

        Ok((Arc::new(signed_block), post))
    }
}

/// Builds blocks at each of `slots` in order, starting from `pre`.
pub fn chain(
    pre: &CachedBeaconState,
    slots: impl IntoIterator<Item = Slot>,
) -> Result<(Vec<Arc<SignedBeaconBlock>>, CachedBeaconState)> {
    let mut blocks = vec![];
    let mut post = pre.clone();

    for slot in slots {
        let (block, next) = BlockBuilder::new(&post, slot).with_attestations().build()?;
        blocks.push(block);
        post = next;
    }

    Ok((blocks, post))
}

/// Signed attestations for every committee in the slot before `cached`'s slot.
///
/// `cached` must already be advanced to the slot of the block that will include them.
pub fn previous_slot_attestations(cached: &CachedBeaconState) -> Result<Vec<Attestation>> {
    let CachedBeaconState {
        config,
        state,
        epoch_context,
    } = cached;

    let slot = state.slot - 1;
    let epoch = misc::compute_epoch_at_slot(config, slot);
    let current_epoch = cached.current_epoch();

    let source = if epoch == current_epoch {
        state.current_justified_checkpoint
    } else {
        state.previous_justified_checkpoint
    };

    let target = Checkpoint {
        epoch,
        root: accessors::get_block_root(config, state, epoch)?,
    };

    (0..epoch_context.committee_count_per_slot(epoch)?)
        .map(|index| {
            let committee = epoch_context.beacon_committee(config, slot, index)?;

            let data = AttestationData {
                slot,
                index,
                beacon_block_root: accessors::get_block_root_at_slot(state, slot)?,
                source,
                target,
            };

            let mut aggregation_bits = BitList::with_length(committee.len())?;
            let mut signature = Signature::default();

            for (position, member) in committee.iter().copied().enumerate() {
                aggregation_bits.set(position, true);
                signature.aggregate_in_place(data.sign(config, state, &secret_key(member)));
            }

            Ok(Attestation {
                aggregation_bits,
                data,
                signature: signature.into(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use bls::SignatureBytes;
    use helper_functions::{
        error::SignatureKind, signature_sets::get_all_block_signature_sets,
        verifier::MultiVerifier,
    };
    use transition_functions::{ProcessSlots, StateRootPolicy};
    use types::containers::{
        AttesterSlashing, IndexedAttestation, ProposerSlashing, SignedBeaconBlockHeader,
        SignedVoluntaryExit, VoluntaryExit,
    };

    use super::*;

    fn config() -> Arc<Config> {
        Arc::new(Config::minimal())
    }

    #[test]
    fn genesis_block_matches_latest_header() -> Result<()> {
        let config = config();
        let (block, mut cached) = genesis(&config, 16)?;

        process_slots(&mut cached, 1)?;

        assert_eq!(
            cached.state.latest_block_header.hash_tree_root(),
            block.message.hash_tree_root(),
        );

        Ok(())
    }

    #[test]
    fn built_blocks_pass_full_state_transition() -> Result<()> {
        let config = config();
        let (_, genesis_state) = genesis(&config, 16)?;
        let (blocks, expected) = chain(&genesis_state, 1..=10)?;

        let mut cached = genesis_state;

        for block in &blocks {
            transition_functions::state_transition(
                &mut cached,
                block,
                ProcessSlots::IfNeeded,
                StateRootPolicy::Verify,
                MultiVerifier::default(),
            )?;
        }

        assert_eq!(cached.root(), expected.root());

        Ok(())
    }

    #[test]
    fn tampered_block_fails_signature_verification() -> Result<()> {
        let config = config();
        let (_, mut cached) = genesis(&config, 16)?;
        let (block, _) = BlockBuilder::new(&cached, 1).build()?;

        let mut tampered = Arc::unwrap_or_clone(block);
        tampered.message.body.graffiti.0[0] = 1;

        let result = transition_functions::state_transition(
            &mut cached,
            &tampered,
            ProcessSlots::IfNeeded,
            StateRootPolicy::Trust,
            MultiVerifier::default(),
        );

        assert!(result.is_err());

        Ok(())
    }

    #[test]
    fn execution_payloads_extend_each_other() -> Result<()> {
        let config = config();
        let (_, genesis_state) = genesis(&config, 16)?;

        let (_, first) = BlockBuilder::new(&genesis_state, 1)
            .with_execution_payload(ExecutionBlockHash::repeat_byte(1))
            .build()?;

        let (second_block, second) = BlockBuilder::new(&first, 2)
            .with_execution_payload(ExecutionBlockHash::repeat_byte(2))
            .build()?;

        assert_eq!(
            second_block.message.body.execution_payload.parent_hash,
            ExecutionBlockHash::repeat_byte(1),
        );
        assert_eq!(
            second.state.latest_execution_payload_header.block_number,
            2,
        );

        Ok(())
    }

    #[test]
    fn full_attestations_justify_and_finalize() -> Result<()> {
        let config = config();
        let (_, genesis_state) = genesis(&config, 32)?;
        let slots_per_epoch = config.slots_per_epoch.get();
        let (_, post) = chain(&genesis_state, 1..=slots_per_epoch * 5)?;

        assert!(post.state.current_justified_checkpoint.epoch >= 3);
        assert!(post.state.finalized_checkpoint.epoch >= 2);

        Ok(())
    }

    #[test]
    fn block_with_one_of_each_operation_yields_eight_signature_sets() -> Result<()> {
        let config = config();
        let (_, mut cached) = genesis(&config, 16)?;

        process_slots(&mut cached, 2)?;

        let attestation = previous_slot_attestations(&cached)?.swap_remove(0);

        let header = |byte| SignedBeaconBlockHeader {
            message: BeaconBlockHeader {
                slot: 1,
                proposer_index: 3,
                body_root: H256::repeat_byte(byte),
                ..BeaconBlockHeader::default()
            },
            signature: SignatureBytes::empty(),
        };

        let indexed = |index| -> Result<_> {
            Ok(IndexedAttestation {
                attesting_indices: ContiguousList::try_from_iter([index])?,
                data: AttestationData {
                    slot: 1,
                    ..AttestationData::default()
                },
                signature: SignatureBytes::empty(),
            })
        };

        let body = BeaconBlockBody {
            proposer_slashings: ContiguousList::try_from_iter([ProposerSlashing {
                signed_header_1: header(1),
                signed_header_2: header(2),
            }])?,
            attester_slashings: ContiguousList::try_from_iter([AttesterSlashing {
                attestation_1: indexed(4)?,
                attestation_2: indexed(5)?,
            }])?,
            attestations: ContiguousList::try_from_iter([attestation])?,
            voluntary_exits: ContiguousList::try_from_iter([SignedVoluntaryExit {
                message: VoluntaryExit {
                    epoch: 0,
                    validator_index: 6,
                },
                signature: SignatureBytes::empty(),
            }])?,
            ..BeaconBlockBody::default()
        };

        let block = SignedBeaconBlock {
            message: BeaconBlock {
                slot: 2,
                proposer_index: 1,
                body,
                ..BeaconBlock::default()
            },
            ..SignedBeaconBlock::default()
        };

        let kinds = get_all_block_signature_sets(&cached, &block, false)?
            .iter()
            .map(|set| set.kind())
            .collect::<Vec<_>>();

        assert_eq!(
            kinds,
            [
                SignatureKind::Block,
                SignatureKind::Randao,
                SignatureKind::ProposerSlashing,
                SignatureKind::ProposerSlashing,
                SignatureKind::AttesterSlashing,
                SignatureKind::AttesterSlashing,
                SignatureKind::Attestation,
                SignatureKind::VoluntaryExit,
            ],
        );

        Ok(())
    }
}
