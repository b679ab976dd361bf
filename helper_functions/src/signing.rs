use anyhow::Result;
use bls::{PublicKey, SecretKey, Signature, SignatureBytes};
use derive_more::From;
use ssz::SszHash;
use types::{
    beacon_state::BeaconState,
    config::Config,
    consts::{
        DOMAIN_BEACON_ATTESTER, DOMAIN_BEACON_PROPOSER, DOMAIN_RANDAO, DOMAIN_SYNC_COMMITTEE,
        DOMAIN_VOLUNTARY_EXIT,
    },
    containers::{AttestationData, BeaconBlock, BeaconBlockHeader, VoluntaryExit},
    primitives::{DomainType, Epoch, Slot, H256},
};

use crate::{
    accessors,
    error::SignatureKind,
    misc,
    verifier::{SingleVerifier, Verifier as _},
};

// This wrapper is needed to differentiate between `Epoch` and `Slot`.
// They are aliased to the same type and thus cannot have different trait implementations.
#[derive(Clone, Copy, From, SszHash)]
#[ssz(transparent)]
pub struct RandaoEpoch(Epoch);

pub trait SignForSingleFork: SszHash {
    const DOMAIN_TYPE: DomainType;
    const SIGNATURE_KIND: SignatureKind;

    fn epoch(&self, config: &Config) -> Epoch;

    fn signing_root(&self, config: &Config, state: &BeaconState) -> H256 {
        let epoch = Some(self.epoch(config));
        let domain = accessors::get_domain(config, state, Self::DOMAIN_TYPE, epoch);
        misc::compute_signing_root(self, domain)
    }

    fn sign(&self, config: &Config, state: &BeaconState, secret_key: &SecretKey) -> Signature {
        secret_key.sign(self.signing_root(config, state))
    }

    fn verify(
        &self,
        config: &Config,
        state: &BeaconState,
        signature_bytes: SignatureBytes,
        public_key: &PublicKey,
    ) -> Result<()> {
        SingleVerifier.verify_singular(
            self.signing_root(config, state),
            signature_bytes,
            public_key,
            Self::SIGNATURE_KIND,
        )
    }
}

pub trait SignForSingleForkAtSlot: SszHash {
    const DOMAIN_TYPE: DomainType;
    const SIGNATURE_KIND: SignatureKind;

    fn signing_root(&self, config: &Config, state: &BeaconState, slot: Slot) -> H256 {
        let epoch = misc::compute_epoch_at_slot(config, slot);
        let domain = accessors::get_domain(config, state, Self::DOMAIN_TYPE, Some(epoch));
        misc::compute_signing_root(self, domain)
    }

    fn sign(
        &self,
        config: &Config,
        state: &BeaconState,
        slot: Slot,
        secret_key: &SecretKey,
    ) -> Signature {
        secret_key.sign(self.signing_root(config, state, slot))
    }
}

impl SignForSingleFork for AttestationData {
    const DOMAIN_TYPE: DomainType = DOMAIN_BEACON_ATTESTER;
    const SIGNATURE_KIND: SignatureKind = SignatureKind::Attestation;

    fn epoch(&self, _config: &Config) -> Epoch {
        self.target.epoch
    }
}

impl SignForSingleFork for BeaconBlock {
    const DOMAIN_TYPE: DomainType = DOMAIN_BEACON_PROPOSER;
    const SIGNATURE_KIND: SignatureKind = SignatureKind::Block;

    fn epoch(&self, config: &Config) -> Epoch {
        misc::compute_epoch_at_slot(config, self.slot)
    }
}

impl SignForSingleFork for BeaconBlockHeader {
    const DOMAIN_TYPE: DomainType = DOMAIN_BEACON_PROPOSER;
    const SIGNATURE_KIND: SignatureKind = SignatureKind::Block;

    fn epoch(&self, config: &Config) -> Epoch {
        misc::compute_epoch_at_slot(config, self.slot)
    }
}

impl SignForSingleFork for RandaoEpoch {
    const DOMAIN_TYPE: DomainType = DOMAIN_RANDAO;
    const SIGNATURE_KIND: SignatureKind = SignatureKind::Randao;

    fn epoch(&self, _config: &Config) -> Epoch {
        self.0
    }
}

impl SignForSingleFork for VoluntaryExit {
    const DOMAIN_TYPE: DomainType = DOMAIN_VOLUNTARY_EXIT;
    const SIGNATURE_KIND: SignatureKind = SignatureKind::VoluntaryExit;

    fn epoch(&self, _config: &Config) -> Epoch {
        self.epoch
    }
}

// Sync committee members sign the root of the block at the previous slot.
impl SignForSingleForkAtSlot for H256 {
    const DOMAIN_TYPE: DomainType = DOMAIN_SYNC_COMMITTEE;
    const SIGNATURE_KIND: SignatureKind = SignatureKind::SyncAggregate;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_block_share_signing_root() {
        let config = Config::minimal();
        let state = BeaconState::empty(&config);

        let block = BeaconBlock {
            slot: 3,
            proposer_index: 1,
            ..BeaconBlock::default()
        };

        assert_eq!(
            block.signing_root(&config, &state),
            block.to_header().signing_root(&config, &state),
        );
    }

    #[test]
    fn signature_verifies_against_signing_root() -> Result<()> {
        let config = Config::minimal();
        let state = BeaconState::empty(&config);
        let secret_key = SecretKey::derive(&[3; 32])?;
        let public_key = secret_key.to_public_key();

        let epoch = RandaoEpoch::from(2);
        let signature = epoch.sign(&config, &state, &secret_key).into();

        epoch.verify(&config, &state, signature, &public_key)?;

        assert!(RandaoEpoch::from(3)
            .verify(&config, &state, signature, &public_key)
            .is_err());

        Ok(())
    }
}
