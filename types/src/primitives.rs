pub use bls::{PublicKeyBytes, SignatureBytes};
pub use ethereum_types::{Bloom, H160, H256, H32, U256};

pub type CommitteeIndex = u64;
pub type Domain = H256;
pub type DomainType = H32;
pub type Epoch = u64;
pub type ExecutionAddress = H160;
pub type ExecutionBlockHash = H256;
pub type ExecutionBlockNumber = u64;
pub type Gwei = u64;
pub type ParticipationFlags = u8;
pub type Slot = u64;
pub type SyncCommitteePeriod = u64;
pub type UnixSeconds = u64;
pub type ValidatorIndex = u64;
pub type Version = H32;
