use thiserror::Error;
use types::primitives::H256;

#[derive(Debug, Error)]
pub enum Error {
    #[error("block {block_root:?} is already present in the store")]
    BlockAlreadyPresent { block_root: H256 },
    #[error("parent {parent_root:?} of block {block_root:?} is not present in the store")]
    ParentUnknown { block_root: H256, parent_root: H256 },
}
