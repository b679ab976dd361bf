//! `#[derive(SszHash)]` for SSZ containers.
//!
//! The generated `hash_tree_root` merkleizes the roots of all fields in declaration order.
//! Supported field attributes:
//! - `#[ssz(skip)]` excludes a field (caches and other derived data).
//! - `#[ssz(with = "path")]` hashes the field with `path(&field)` instead of `SszHash`.
//!
//! Supported container attributes:
//! - `#[ssz(transparent)]` forwards to the single unskipped field.
//! - `#[ssz(internal)]` refers to the `ssz` crate as `crate`.

use darling::FromDeriveInput as _;
use proc_macro::TokenStream;
use syn::{Error, parse_macro_input};

use crate::ssz_type::SszType;

mod crate_path;
mod ssz_field;
mod ssz_type;

#[proc_macro_derive(SszHash, attributes(ssz))]
pub fn derive(input: TokenStream) -> TokenStream {
    match SszType::from_derive_input(&parse_macro_input!(input)) {
        Ok(ssz_type) => ssz_type.impls().unwrap_or_else(Error::into_compile_error),
        Err(error) => error.write_errors(),
    }
    .into()
}
