use bitvec::vec::BitVec;
use derive_more::{Deref, DerefMut};
use ethereum_types::H256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{merkleize, porcelain::SszHash};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
#[error("expected bit vector of length {expected}, found {actual} bits")]
pub struct BitVectorLengthMismatch {
    expected: usize,
    actual: usize,
}

/// A vector of exactly `N` bits.
#[derive(Clone, PartialEq, Eq, Debug, Deref, DerefMut, Deserialize, Serialize)]
#[serde(try_from = "Vec<bool>", into = "Vec<bool>")]
pub struct BitVector<const N: usize> {
    bits: BitVec<u8>,
}

impl<const N: usize> Default for BitVector<N> {
    fn default() -> Self {
        Self {
            bits: BitVec::repeat(false, N),
        }
    }
}

impl<const N: usize> TryFrom<Vec<bool>> for BitVector<N> {
    type Error = BitVectorLengthMismatch;

    fn try_from(bits: Vec<bool>) -> Result<Self, Self::Error> {
        if bits.len() != N {
            return Err(BitVectorLengthMismatch {
                expected: N,
                actual: bits.len(),
            });
        }

        Ok(Self {
            bits: bits.into_iter().collect(),
        })
    }
}

impl<const N: usize> From<BitVector<N>> for Vec<bool> {
    fn from(bit_vector: BitVector<N>) -> Self {
        bit_vector.bits.into_iter().collect()
    }
}

impl<const N: usize> SszHash for BitVector<N> {
    fn hash_tree_root(&self) -> H256 {
        let chunks = u8::pack(self.bits.as_raw_slice());
        let depth = merkleize::depth_for_chunk_count(N.div_ceil(256) as u64);

        merkleize::merkleize_chunks(chunks, depth)
    }
}

impl<const N: usize> BitVector<N> {
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_vector_has_fixed_length() {
        let bit_vector = BitVector::<512>::default();

        assert_eq!(bit_vector.len(), 512);
        assert_eq!(bit_vector.hash_tree_root(), hashing::ZERO_HASHES[1]);
    }

    #[test]
    fn vectors_of_wrong_length_are_rejected() {
        assert!(BitVector::<4>::try_from(vec![true; 3]).is_err());
        assert!(BitVector::<4>::try_from(vec![true; 4]).is_ok());
    }
}
