//! SHA-256 helpers shared by Merkle tree hashing and the state transition.
//!
//! Every function hashes a fixed layout. Integers are encoded in little-endian byte order
//! to match how they are packed into SSZ chunks.

use ethereum_types::H256;
use once_cell::sync::Lazy;
use sha2::{Digest as _, Sha256};

/// Deepest zero subtree any tree in the crate graph needs.
///
/// `VALIDATOR_REGISTRY_LIMIT` is 2⁴⁰, so lists of validators and balances need 40 levels.
pub const MAX_ZERO_HASH_DEPTH: usize = 40;

/// `ZERO_HASHES[depth]` is the root of a perfect binary tree of height `depth` with zeroed leaves.
pub static ZERO_HASHES: Lazy<[H256; MAX_ZERO_HASH_DEPTH + 1]> = Lazy::new(|| {
    let mut hashes = [H256::zero(); MAX_ZERO_HASH_DEPTH + 1];

    for depth in 1..=MAX_ZERO_HASH_DEPTH {
        hashes[depth] = hash_256_256(hashes[depth - 1], hashes[depth - 1]);
    }

    hashes
});

#[inline]
#[must_use]
pub fn hash_bytes(bytes: impl AsRef<[u8]>) -> H256 {
    H256(Sha256::digest(bytes.as_ref()).into())
}

#[inline]
#[must_use]
pub fn hash_64(value: u64) -> H256 {
    hash_bytes(value.to_le_bytes())
}

#[inline]
#[must_use]
pub fn hash_256_256(left: H256, right: H256) -> H256 {
    let digest = Sha256::new()
        .chain_update(left.as_bytes())
        .chain_update(right.as_bytes())
        .finalize();

    H256(digest.into())
}

#[inline]
#[must_use]
pub fn hash_256_8(a: H256, b: u8) -> H256 {
    let digest = Sha256::new()
        .chain_update(a.as_bytes())
        .chain_update([b])
        .finalize();

    H256(digest.into())
}

#[inline]
#[must_use]
pub fn hash_256_8_32(a: H256, b: u8, c: u32) -> H256 {
    let digest = Sha256::new()
        .chain_update(a.as_bytes())
        .chain_update([b])
        .chain_update(c.to_le_bytes())
        .finalize();

    H256(digest.into())
}

#[inline]
#[must_use]
pub fn hash_256_64(a: H256, b: u64) -> H256 {
    let digest = Sha256::new()
        .chain_update(a.as_bytes())
        .chain_update(b.to_le_bytes())
        .finalize();

    H256(digest.into())
}

#[inline]
#[must_use]
pub fn hash_32_64_256(a: [u8; 4], b: u64, c: H256) -> H256 {
    let digest = Sha256::new()
        .chain_update(a)
        .chain_update(b.to_le_bytes())
        .chain_update(c.as_bytes())
        .finalize();

    H256(digest.into())
}

// Called with `SignatureBytes`, which this crate cannot name.
#[inline]
#[must_use]
pub fn hash_768(bytes: impl AsRef<[u8; 96]>) -> H256 {
    hash_bytes(bytes.as_ref())
}
