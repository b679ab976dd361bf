use bitvec::vec::BitVec;
use derive_more::{Deref, DerefMut};
use ethereum_types::H256;
use serde::{Deserialize, Serialize};

use crate::{error::ListTooLong, merkleize, porcelain::SszHash};

/// A list of at most `N` bits.
///
/// Bits are stored in [`bitvec::order::Lsb0`] order, which matches SSZ.
#[derive(Clone, PartialEq, Eq, Default, Debug, Deref, DerefMut, Deserialize, Serialize)]
#[serde(try_from = "Vec<bool>", into = "Vec<bool>")]
pub struct BitList<const N: usize> {
    bits: BitVec<u8>,
}

impl<const N: usize> TryFrom<Vec<bool>> for BitList<N> {
    type Error = ListTooLong;

    fn try_from(bits: Vec<bool>) -> Result<Self, Self::Error> {
        let mut bit_list = Self::with_length(bits.len())?;

        for (index, bit) in bits.into_iter().enumerate() {
            bit_list.bits.set(index, bit);
        }

        Ok(bit_list)
    }
}

impl<const N: usize> From<BitList<N>> for Vec<bool> {
    fn from(bit_list: BitList<N>) -> Self {
        bit_list.bits.into_iter().collect()
    }
}

impl<const N: usize> SszHash for BitList<N> {
    fn hash_tree_root(&self) -> H256 {
        let chunks = u8::pack(self.bits.as_raw_slice());
        let chunk_limit = N.div_ceil(256) as u64;
        let root = merkleize::merkleize_chunks(chunks, merkleize::depth_for_chunk_count(chunk_limit));

        merkleize::mix_in_length(root, self.bits.len())
    }
}

impl<const N: usize> BitList<N> {
    pub const MAXIMUM_LENGTH: usize = N;

    pub fn with_length(length: usize) -> Result<Self, ListTooLong> {
        if length > N {
            return Err(ListTooLong {
                maximum: N,
                actual: length,
            });
        }

        Ok(Self {
            bits: BitVec::repeat(false, length),
        })
    }

    /// Indices of set bits.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }
}
