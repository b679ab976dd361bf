//! Simple Serialize hashing and persistent binary Merkle trees.
//!
//! Only the parts of SSZ needed for computing roots are implemented here.
//! Values are stored in plain Rust containers and hashed on demand, except for the ones that are
//! large and frequently updated, which are backed by [`Tree`].

pub use ethereum_types::H256;
pub use hashing;
pub use ssz_derive::SszHash;

pub use crate::{
    bit_list::BitList,
    bit_vector::{BitVector, BitVectorLengthMismatch},
    contiguous_list::ContiguousList,
    error::{GindexError, ListTooLong, TreeError},
    gindex::Gindex,
    merkleize::{depth_for_chunk_count, merkleize_chunks, merkleize_vector, mix_in_length},
    node::Node,
    porcelain::{SszHash, list_root, vector_root},
    tree::Tree,
};

mod bit_list;
mod bit_vector;
mod contiguous_list;
mod error;
mod gindex;
mod merkleize;
mod node;
mod porcelain;
mod tree;
