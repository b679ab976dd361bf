use core::num::NonZeroU64;

use hex_literal::hex;
use nonzero_ext::nonzero;
use static_assertions::const_assert_eq;

use crate::primitives::{DomainType, Epoch, Slot, H32};

pub const DOMAIN_BEACON_ATTESTER: DomainType = H32(hex!("01000000"));
pub const DOMAIN_BEACON_PROPOSER: DomainType = H32(hex!("00000000"));
pub const DOMAIN_RANDAO: DomainType = H32(hex!("02000000"));
pub const DOMAIN_SYNC_COMMITTEE: DomainType = H32(hex!("07000000"));
pub const DOMAIN_VOLUNTARY_EXIT: DomainType = H32(hex!("04000000"));

pub const FAR_FUTURE_EPOCH: Epoch = Epoch::MAX;
pub const GENESIS_EPOCH: Epoch = 0;
pub const GENESIS_SLOT: Slot = 0;

pub const JUSTIFICATION_BITS_LENGTH: usize = 4;

pub const TIMELY_SOURCE_FLAG_INDEX: usize = 0;
pub const TIMELY_TARGET_FLAG_INDEX: usize = 1;
pub const TIMELY_HEAD_FLAG_INDEX: usize = 2;

pub const TIMELY_SOURCE_WEIGHT: u64 = 14;
pub const TIMELY_TARGET_WEIGHT: u64 = 26;
pub const TIMELY_HEAD_WEIGHT: u64 = 14;

pub const PARTICIPATION_FLAG_WEIGHTS: [(usize, u64); 3] = [
    (TIMELY_SOURCE_FLAG_INDEX, TIMELY_SOURCE_WEIGHT),
    (TIMELY_TARGET_FLAG_INDEX, TIMELY_TARGET_WEIGHT),
    (TIMELY_HEAD_FLAG_INDEX, TIMELY_HEAD_WEIGHT),
];

pub const SYNC_REWARD_WEIGHT: u64 = 2;
pub const PROPOSER_WEIGHT: u64 = 8;
pub const WEIGHT_DENOMINATOR: NonZeroU64 = nonzero!(64_u64);

const_assert_eq!(
    WEIGHT_DENOMINATOR.get(),
    TIMELY_SOURCE_WEIGHT
        + TIMELY_TARGET_WEIGHT
        + TIMELY_HEAD_WEIGHT
        + SYNC_REWARD_WEIGHT
        + PROPOSER_WEIGHT,
);

// List and vector limits. These fix the shape of containers and therefore their roots,
// so they are not configurable at runtime. Values are taken from the mainnet preset.
pub const MAX_ATTESTATIONS: usize = 128;
pub const MAX_ATTESTER_SLASHINGS: usize = 2;
pub const MAX_BYTES_PER_TRANSACTION: usize = 1 << 30;
pub const MAX_EXTRA_DATA_BYTES: usize = 32;
pub const MAX_PROPOSER_SLASHINGS: usize = 16;
pub const MAX_TRANSACTIONS_PER_PAYLOAD: usize = 1 << 20;
pub const MAX_VALIDATORS_PER_COMMITTEE: usize = 2048;
pub const MAX_VOLUNTARY_EXITS: usize = 16;
pub const SYNC_COMMITTEE_SIZE: usize = 512;
pub const VALIDATOR_REGISTRY_LIMIT: usize = 1 << 40;

/// Number of validators whose participation flags share one 32 byte chunk.
pub const PARTICIPATION_FLAGS_PER_CHUNK: usize = 32;
