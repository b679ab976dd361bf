//! Swap-or-not shuffling of validator indices.
//!
//! The epoch context shuffles the active validator indices of an epoch once with
//! [`shuffle_slice`] and slices beacon committees out of the result. Proposer and sync committee
//! selection only need a few positions, so they sample candidates with [`shuffle_single`].
//! Both must agree for every index, otherwise committee members and proposers would be drawn from
//! different permutations.

use core::{
    fmt::Debug,
    num::NonZeroU64,
    ops::{Index as _, Rem as _},
};

use anyhow::Result;
use bit_field::BitArray as _;
use itertools::izip;
use tap::TryConv as _;
use types::primitives::H256;

const BITS_PER_HASH: usize = H256::len_bytes() * 8;

/// Shuffles a whole list in place with swap-or-not rounds applied in reverse.
///
/// Afterwards `slice[i]` holds the element that was at `shuffle_single(i, …)`, so committees are
/// consecutive subslices of the result.
pub fn shuffle_slice<T>(slice: &mut [T], seed: H256, round_count: u8) -> Result<()> {
    let Some(length) = slice.len().try_into().map(NonZeroU64::new)? else {
        return Ok(());
    };

    for round in (0..round_count).rev() {
        let pivot = compute_pivot(seed, round, length)
            .try_conv::<usize>()
            .expect("remainder of division by number that fits in usize also fits in usize");

        let midpoint = pivot + 1;
        let (low, high) = slice.split_at_mut(midpoint);

        swap_around_mirror(seed, round, low, 0);
        swap_around_mirror(seed, round, high, midpoint);
    }

    Ok(())
}

fn swap_around_mirror<T>(seed: H256, round: u8, slice: &mut [T], offset: usize) {
    // Pairs are swapped in windows of 256 positions, one source hash per window.

    let mirror = slice.len() / 2;
    let offset_mirror = offset + mirror;
    let offset_length = offset + slice.len();
    let trailing = mirror.min(offset_length % BITS_PER_HASH);
    let leading = (mirror - trailing) % BITS_PER_HASH;

    let (low, mut high) = slice.split_at_mut(mirror);

    if low.len() < high.len() {
        high = &mut high[1..];
    }

    assert_eq!(low.len(), mirror);
    assert_eq!(high.len(), mirror);

    if trailing > 0 {
        let source = compute_source(seed, round, offset_length / BITS_PER_HASH);
        let bit_indices = (0..offset_length % BITS_PER_HASH).rev();
        let low_elements = low[..trailing].iter_mut();
        let high_elements = high[mirror - trailing..].iter_mut().rev();

        swap_using_source(source, bit_indices, low_elements, high_elements);
    }

    for (offset_chunk_index, low_chunk, high_chunk) in izip!(
        (0..offset_length / BITS_PER_HASH).rev(),
        low[trailing..].chunks_exact_mut(BITS_PER_HASH),
        high[..mirror - trailing].rchunks_exact_mut(BITS_PER_HASH),
    ) {
        let source = compute_source(seed, round, offset_chunk_index);
        let bit_indices = 0..BITS_PER_HASH;
        let low_elements = low_chunk.iter_mut().rev();
        let high_elements = high_chunk;

        swap_using_source(source, bit_indices, low_elements, high_elements);
    }

    if leading > 0 {
        let source = compute_source(seed, round, offset_mirror / BITS_PER_HASH);
        let bit_indices = (0..BITS_PER_HASH).rev();
        let low_elements = low[mirror - leading..].iter_mut();
        let high_elements = high[..leading].iter_mut().rev();

        swap_using_source(source, bit_indices, low_elements, high_elements);
    }
}

fn swap_using_source<'slice, T: 'slice>(
    source: H256,
    bit_indices: impl IntoIterator<Item = usize>,
    low: impl IntoIterator<Item = &'slice mut T>,
    high: impl IntoIterator<Item = &'slice mut T>,
) {
    for (bit_index, index, flip) in izip!(bit_indices, low, high) {
        let bit = source.as_bytes().get_bit(bit_index);

        if bit {
            core::mem::swap(index, flip);
        }
    }
}

/// Position in the input list of the element that ends up at `index` after shuffling.
///
/// # Panics
///
/// Panics if `index` is not less than `index_count`.
#[must_use]
pub fn shuffle_single(mut index: u64, index_count: NonZeroU64, seed: H256, round_count: u8) -> u64 {
    assert!(index < index_count.get());

    for round in 0..round_count {
        let pivot = compute_pivot(seed, round, index_count);
        let flip = (pivot + index_count.get() - index) % index_count;
        let position = index.max(flip);
        let source = compute_source(seed, round, position / BITS_PER_HASH as u64);
        let bit_index = position.to_le_bytes()[0].into();
        let bit = source.as_bytes().get_bit(bit_index);

        if bit {
            index = flip;
        }
    }

    index
}

fn compute_pivot(seed: H256, round: u8, index_count: NonZeroU64) -> u64 {
    hashing::hash_256_8(seed, round)
        .index(..size_of::<u64>())
        .try_into()
        .map(u64::from_le_bytes)
        .expect("slice has the same size as u64")
        .rem(index_count)
}

fn compute_source(
    seed: H256,
    round: u8,
    position_window: impl TryInto<u64, Error = impl Debug>,
) -> H256 {
    // The position window is serialized as 4 bytes.
    #[allow(clippy::cast_possible_truncation)]
    let position_window = position_window
        .try_into()
        .expect("position_window should fit in u64") as u32;

    hashing::hash_256_8_32(seed, round, position_window)
}

#[cfg(test)]
mod tests {
    use itertools::Itertools as _;
    use nonzero_ext::nonzero;
    use test_case::test_case;

    use super::*;

    const SEED: H256 = H256::repeat_byte(0x5a);

    // Lengths straddle the 256-position windows used for source hashes.
    #[test_case(1, 10; "single validator")]
    #[test_case(7, 10; "fewer validators than a committee")]
    #[test_case(64, 10; "minimal preset genesis")]
    #[test_case(300, 10; "more than one source window")]
    #[test_case(513, 90; "mainnet round count")]
    fn committees_agree_with_single_index_lookups(
        validator_count: u64,
        round_count: u8,
    ) -> Result<()> {
        let mut committees = (0..validator_count).collect_vec();

        shuffle_slice(&mut committees, SEED, round_count)?;

        let count = NonZeroU64::new(validator_count).expect("test counts are nonzero");

        let proposer_candidates = (0..validator_count)
            .map(|index| shuffle_single(index, count, SEED, round_count))
            .collect_vec();

        assert_eq!(committees, proposer_candidates);

        Ok(())
    }

    #[test]
    fn every_validator_is_sampled_exactly_once() {
        let validator_count = nonzero!(100_u64);

        let candidates = (0..validator_count.get())
            .map(|index| shuffle_single(index, validator_count, SEED, 10))
            .sorted()
            .collect_vec();

        assert_eq!(candidates, (0..validator_count.get()).collect_vec());
    }

    #[test]
    fn epoch_without_active_validators_is_left_alone() -> Result<()> {
        let mut no_validators: [u64; 0] = [];
        shuffle_slice(&mut no_validators, SEED, 10)
    }

    #[test]
    fn different_seeds_give_different_committees() -> Result<()> {
        let mut first = (0..64_u64).collect_vec();
        let mut second = first.clone();

        shuffle_slice(&mut first, SEED, 10)?;
        shuffle_slice(&mut second, H256::repeat_byte(0xa5), 10)?;

        assert_ne!(first, second);

        Ok(())
    }

    #[test]
    fn zero_rounds_keep_validator_order() {
        assert_eq!(shuffle_single(3, nonzero!(10_u64), SEED, 0), 3);
    }
}
