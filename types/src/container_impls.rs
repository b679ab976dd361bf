use bls::{PublicKeyBytes, SignatureBytes};
use ssz::{BitVector, SszHash as _};

use crate::{
    consts::SYNC_COMMITTEE_SIZE,
    containers::{
        BeaconBlock, BeaconBlockHeader, ExecutionPayload, ExecutionPayloadHeader,
        SignedBeaconBlock, SyncAggregate, SyncCommittee,
    },
    primitives::{Slot, H256, U256},
};

// `uint256` is a basic type packed into a single chunk in little-endian order.
pub fn uint256_root(value: &U256) -> H256 {
    let mut root = H256::zero();
    value.to_little_endian(root.as_bytes_mut());
    root
}

impl Default for SyncAggregate {
    fn default() -> Self {
        Self::empty()
    }
}

impl SyncAggregate {
    /// An aggregate with no participants. Its signature is the point at infinity.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            sync_committee_bits: BitVector::default(),
            sync_committee_signature: SignatureBytes::empty(),
        }
    }

    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.sync_committee_bits.count_ones()
    }
}

impl Default for SyncCommittee {
    fn default() -> Self {
        Self {
            pubkeys: vec![PublicKeyBytes::default(); SYNC_COMMITTEE_SIZE],
            aggregate_pubkey: PublicKeyBytes::default(),
        }
    }
}

impl BeaconBlock {
    #[must_use]
    pub fn to_header(&self) -> BeaconBlockHeader {
        BeaconBlockHeader {
            slot: self.slot,
            proposer_index: self.proposer_index,
            parent_root: self.parent_root,
            state_root: self.state_root,
            body_root: self.body.hash_tree_root(),
        }
    }
}

impl SignedBeaconBlock {
    #[must_use]
    pub const fn slot(&self) -> Slot {
        self.message.slot
    }

    #[must_use]
    pub const fn parent_root(&self) -> H256 {
        self.message.parent_root
    }

    #[must_use]
    pub const fn state_root(&self) -> H256 {
        self.message.state_root
    }

    /// Root of the unsigned block, which is how blocks are identified.
    #[must_use]
    pub fn root(&self) -> H256 {
        self.message.hash_tree_root()
    }

    #[must_use]
    pub fn execution_payload(&self) -> &ExecutionPayload {
        &self.message.body.execution_payload
    }
}

impl ExecutionPayload {
    /// Payloads before the merge transition are represented by the default value.
    #[must_use]
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    #[must_use]
    pub fn to_header(&self) -> ExecutionPayloadHeader {
        ExecutionPayloadHeader {
            parent_hash: self.parent_hash,
            fee_recipient: self.fee_recipient,
            state_root: self.state_root,
            receipts_root: self.receipts_root,
            logs_bloom: self.logs_bloom,
            prev_randao: self.prev_randao,
            block_number: self.block_number,
            gas_limit: self.gas_limit,
            gas_used: self.gas_used,
            timestamp: self.timestamp,
            extra_data: self.extra_data.clone(),
            base_fee_per_gas: self.base_fee_per_gas,
            block_hash: self.block_hash,
            transactions_root: self.transactions.hash_tree_root(),
        }
    }
}

impl ExecutionPayloadHeader {
    #[must_use]
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint256_is_little_endian() {
        let root = uint256_root(&U256::from(0x0102));

        assert_eq!(root[0], 0x02);
        assert_eq!(root[1], 0x01);
        assert!(root[2..].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn header_commits_to_body() {
        let mut block = BeaconBlock::default();
        let before = block.to_header();

        block.body.graffiti = H256::repeat_byte(1);

        assert_ne!(before.body_root, block.to_header().body_root);
        assert_ne!(before.hash_tree_root(), block.to_header().hash_tree_root());
    }

    #[test]
    fn default_sync_aggregate_has_infinity_signature() {
        let sync_aggregate = SyncAggregate::default();

        assert_eq!(sync_aggregate.participant_count(), 0);
        assert!(sync_aggregate.sync_committee_signature.is_empty());
    }
}
