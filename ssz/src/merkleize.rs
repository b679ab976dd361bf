use ethereum_types::H256;
use hashing::ZERO_HASHES;
use itertools::Itertools as _;

/// Number of levels needed to fit `chunk_count` leaves.
#[must_use]
pub const fn depth_for_chunk_count(chunk_count: u64) -> u8 {
    if chunk_count <= 1 {
        return 0;
    }

    // `trailing_zeros` of a power of 2 is at most 63.
    #[expect(clippy::cast_possible_truncation)]
    let depth = chunk_count.next_power_of_two().trailing_zeros() as u8;

    depth
}

/// Computes the root of a tree of `depth` levels with `chunks` on the left and zeros after them.
#[must_use]
pub fn merkleize_chunks(chunks: impl IntoIterator<Item = H256>, depth: u8) -> H256 {
    let depth = usize::from(depth);
    let mut level = chunks.into_iter().collect_vec();

    debug_assert!(depth >= 64 || level.len() as u64 <= 1 << depth);

    for height in 0..depth {
        if level.is_empty() {
            return ZERO_HASHES[depth];
        }

        level = level
            .chunks(2)
            .map(|pair| {
                let right = pair.get(1).copied().unwrap_or(ZERO_HASHES[height]);
                hashing::hash_256_256(pair[0], right)
            })
            .collect();
    }

    level.first().copied().unwrap_or(ZERO_HASHES[depth])
}

/// Merkleizes chunks of a value with a fixed number of them.
#[must_use]
pub fn merkleize_vector(chunks: &[H256]) -> H256 {
    merkleize_chunks(
        chunks.iter().copied(),
        depth_for_chunk_count(chunks.len() as u64),
    )
}

#[must_use]
pub fn mix_in_length(root: H256, length: usize) -> H256 {
    hashing::hash_256_64(root, length as u64)
}
