use ethereum_types::{Bloom, H160, H256, H32};
use itertools::Itertools as _;

use crate::merkleize::{merkleize_vector, mix_in_length};

/// Types that have an SSZ `hash_tree_root`.
pub trait SszHash {
    /// Number of values of this type packed into one chunk when they are elements of a collection.
    const PACKING_FACTOR: usize = 1;

    fn hash_tree_root(&self) -> H256;

    /// Converts elements of a collection to chunks.
    fn pack(values: &[Self]) -> Vec<H256>
    where
        Self: Sized,
    {
        values.iter().map(Self::hash_tree_root).collect()
    }

    /// Root of a collection of fixed length.
    #[must_use]
    fn vector_root(values: &[Self]) -> H256
    where
        Self: Sized,
    {
        merkleize_vector(&Self::pack(values))
    }

    /// Root of a collection of variable length with at most `maximum` elements.
    #[must_use]
    fn list_root(values: &[Self], maximum: usize) -> H256
    where
        Self: Sized,
    {
        let chunk_limit = maximum.div_ceil(Self::PACKING_FACTOR) as u64;

        let root = crate::merkleize::merkleize_chunks(
            Self::pack(values),
            crate::merkleize::depth_for_chunk_count(chunk_limit),
        );

        mix_in_length(root, values.len())
    }
}

/// Root of a vector stored in a type that does not know its own length.
#[must_use]
pub fn vector_root<T: SszHash>(values: &[T]) -> H256 {
    T::vector_root(values)
}

#[must_use]
pub fn list_root<T: SszHash, const N: usize>(values: &[T]) -> H256 {
    T::list_root(values, N)
}

impl SszHash for u8 {
    const PACKING_FACTOR: usize = 32;

    fn hash_tree_root(&self) -> H256 {
        let mut chunk = H256::zero();
        chunk.as_bytes_mut()[0] = *self;
        chunk
    }

    fn pack(values: &[Self]) -> Vec<H256> {
        values.chunks(32).map(H256::from_slice_padded).collect()
    }
}

impl SszHash for bool {
    const PACKING_FACTOR: usize = 32;

    fn hash_tree_root(&self) -> H256 {
        u8::from(*self).hash_tree_root()
    }

    fn pack(values: &[Self]) -> Vec<H256> {
        u8::pack(&values.iter().copied().map(u8::from).collect_vec())
    }
}

impl SszHash for u64 {
    const PACKING_FACTOR: usize = 4;

    fn hash_tree_root(&self) -> H256 {
        let mut chunk = H256::zero();
        chunk[..8].copy_from_slice(&self.to_le_bytes());
        chunk
    }

    fn pack(values: &[Self]) -> Vec<H256> {
        values
            .chunks(4)
            .map(|chunk| {
                let bytes = chunk.iter().flat_map(|value| value.to_le_bytes()).collect_vec();
                H256::from_slice_padded(&bytes)
            })
            .collect()
    }
}

impl SszHash for H256 {
    fn hash_tree_root(&self) -> H256 {
        *self
    }
}

impl SszHash for H160 {
    fn hash_tree_root(&self) -> H256 {
        H256::from_slice_padded(self.as_bytes())
    }
}

impl SszHash for H32 {
    fn hash_tree_root(&self) -> H256 {
        H256::from_slice_padded(self.as_bytes())
    }
}

impl SszHash for Bloom {
    fn hash_tree_root(&self) -> H256 {
        u8::vector_root(self.as_bytes())
    }
}

impl<T: SszHash> SszHash for triomphe::Arc<T> {
    fn hash_tree_root(&self) -> H256 {
        self.as_ref().hash_tree_root()
    }
}

impl<T: SszHash> SszHash for std::sync::Arc<T> {
    fn hash_tree_root(&self) -> H256 {
        self.as_ref().hash_tree_root()
    }
}

trait FromSlicePadded {
    fn from_slice_padded(bytes: &[u8]) -> Self;
}

impl FromSlicePadded for H256 {
    fn from_slice_padded(bytes: &[u8]) -> Self {
        let mut chunk = Self::zero();
        chunk[..bytes.len()].copy_from_slice(bytes);
        chunk
    }
}

#[cfg(test)]
mod tests {
    use hashing::ZERO_HASHES;

    use super::*;

    #[test]
    fn integers_are_packed_little_endian() {
        let chunks = u64::pack(&[1, 2, 3, 4, 5]);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0][..8], 1_u64.to_le_bytes());
        assert_eq!(chunks[0][24..], 4_u64.to_le_bytes());
        assert_eq!(chunks[1][..8], 5_u64.to_le_bytes());
        assert!(chunks[1][8..].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn empty_list_root_mixes_in_zero_length() {
        let root = u64::list_root(&[], 8);

        assert_eq!(root, hashing::hash_256_256(ZERO_HASHES[1], H256::zero()));
    }

    #[test]
    fn address_is_padded_on_the_right() {
        let address = H160::repeat_byte(0xff);
        let root = address.hash_tree_root();

        assert!(root[..20].iter().all(|byte| *byte == 0xff));
        assert!(root[20..].iter().all(|byte| *byte == 0));
    }
}
