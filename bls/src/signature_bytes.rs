use derive_more::AsRef;
use fixed_hash::construct_fixed_hash;
use impl_serde::impl_fixed_hash_serde;
use ssz::{H256, SszHash};

use crate::{consts::SIGNATURE_SIZE, signature::Signature};

construct_fixed_hash! {
    #[derive(AsRef)]
    pub struct SignatureBytes(SIGNATURE_SIZE);
}

impl_fixed_hash_serde!(SignatureBytes, SIGNATURE_SIZE);

impl From<Signature> for SignatureBytes {
    #[inline]
    fn from(signature: Signature) -> Self {
        Self(signature.as_raw().compress())
    }
}

impl SszHash for SignatureBytes {
    #[inline]
    fn hash_tree_root(&self) -> H256 {
        u8::vector_root(self.as_bytes())
    }
}

impl SignatureBytes {
    /// The compressed point at infinity of G2.
    ///
    /// This is the signature of an empty aggregate.
    #[inline]
    #[must_use]
    pub fn empty() -> Self {
        let mut bytes = Self::zero();
        bytes.as_mut()[0] = 0xc0;
        bytes
    }

    #[inline]
    #[must_use]
    pub fn is_empty(self) -> bool {
        self == Self::empty()
    }
}
