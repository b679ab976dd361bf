use core::num::NonZeroU64;

use blst::{
    blst_scalar,
    min_pk::{AggregateSignature as RawAggregateSignature, Signature as RawSignature},
    BLST_ERROR,
};
use derive_more::From;
use itertools::Itertools as _;
use rand::Rng as _;

use crate::{
    consts::DOMAIN_SEPARATION_TAG, error::Error, public_key::PublicKey,
    signature_bytes::SignatureBytes,
};

const MULTI_VERIFY_RANDOM_BYTES: usize = size_of::<NonZeroU64>();
const MULTI_VERIFY_RANDOM_BITS: usize = MULTI_VERIFY_RANDOM_BYTES * 8;

#[derive(Clone, Copy, PartialEq, Eq, Debug, From)]
pub struct Signature(RawSignature);

impl Default for Signature {
    #[inline]
    fn default() -> Self {
        SignatureBytes::empty()
            .try_into()
            .expect("compressed signature constructed in SignatureBytes::empty is valid")
    }
}

impl TryFrom<SignatureBytes> for Signature {
    type Error = Error;

    #[inline]
    fn try_from(bytes: SignatureBytes) -> Result<Self, Self::Error> {
        RawSignature::uncompress(bytes.as_bytes())
            .map(Self)
            .map_err(|_| Error::InvalidSignature)
    }
}

impl Signature {
    #[must_use]
    pub fn verify(&self, message: impl AsRef<[u8]>, public_key: &PublicKey) -> bool {
        let result = self.as_raw().verify(
            true,
            message.as_ref(),
            DOMAIN_SEPARATION_TAG,
            &[],
            public_key.as_raw(),
            false,
        );

        result == BLST_ERROR::BLST_SUCCESS
    }

    #[inline]
    pub fn aggregate_in_place(&mut self, other: Self) {
        let mut self_aggregate = RawAggregateSignature::from_signature(self.as_raw());
        let other_aggregate = RawAggregateSignature::from_signature(other.as_raw());
        self_aggregate.add_aggregate(&other_aggregate);
        self.0 = self_aggregate.to_signature();
    }

    #[must_use]
    pub fn fast_aggregate_verify<'keys>(
        &self,
        message: impl AsRef<[u8]>,
        public_keys: impl IntoIterator<Item = &'keys PublicKey>,
    ) -> bool {
        let public_keys = public_keys.into_iter().map(PublicKey::as_raw).collect_vec();

        let result = self.as_raw().fast_aggregate_verify(
            true,
            message.as_ref(),
            DOMAIN_SEPARATION_TAG,
            public_keys.as_slice(),
        );

        result == BLST_ERROR::BLST_SUCCESS
    }

    /// Verifies many signatures at once using random linear combinations.
    ///
    /// Each signature is checked against the single public key at the same position.
    #[must_use]
    pub fn multi_verify<'all>(
        messages: impl IntoIterator<Item = &'all [u8]>,
        signatures: impl IntoIterator<Item = &'all Self>,
        public_keys: impl IntoIterator<Item = &'all PublicKey>,
    ) -> bool {
        let messages = messages.into_iter().collect_vec();
        let signatures = signatures.into_iter().map(Self::as_raw).collect_vec();
        let public_keys = public_keys.into_iter().map(PublicKey::as_raw).collect_vec();

        if signatures.is_empty() {
            return true;
        }

        // `ThreadRng` is cryptographically secure.
        let mut rng = rand::thread_rng();

        let randoms = core::iter::repeat_with(|| {
            let mut scalar = blst_scalar::default();
            let nonzero_bytes = rng.gen::<NonZeroU64>().get().to_le_bytes();
            scalar.b[..MULTI_VERIFY_RANDOM_BYTES].copy_from_slice(&nonzero_bytes);
            scalar
        })
        .take(signatures.len())
        .collect_vec();

        let result = RawSignature::verify_multiple_aggregate_signatures(
            messages.as_slice(),
            DOMAIN_SEPARATION_TAG,
            public_keys.as_slice(),
            false,
            signatures.as_slice(),
            false,
            randoms.as_slice(),
            MULTI_VERIFY_RANDOM_BITS,
        );

        result == BLST_ERROR::BLST_SUCCESS
    }

    #[must_use]
    pub(crate) const fn as_raw(&self) -> &RawSignature {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use crate::secret_key::SecretKey;

    use super::*;

    const MESSAGE: &str = "foo";

    #[test]
    fn signature_verify_succeeds_on_correct_triple() -> Result<(), Error> {
        let secret_key = secret_key(1)?;
        let public_key = secret_key.to_public_key();
        let signature = secret_key.sign(MESSAGE);

        assert!(signature.verify(MESSAGE, &public_key));

        Ok(())
    }

    #[test]
    fn signature_verify_fails_on_incorrect_public_key() -> Result<(), Error> {
        let signature = secret_key(1)?.sign(MESSAGE);
        let other_public_key = secret_key(2)?.to_public_key();

        assert!(!signature.verify(MESSAGE, &other_public_key));

        Ok(())
    }

    #[test]
    fn fast_aggregate_verify_accepts_aggregate_of_same_message() -> Result<(), Error> {
        let first = secret_key(1)?;
        let second = secret_key(2)?;

        let mut signature = first.sign(MESSAGE);
        signature.aggregate_in_place(second.sign(MESSAGE));

        let public_keys = [first.to_public_key(), second.to_public_key()];

        assert!(signature.fast_aggregate_verify(MESSAGE, &public_keys));
        assert!(!signature.fast_aggregate_verify(MESSAGE, &public_keys[..1]));

        Ok(())
    }

    #[test]
    fn multi_verify_detects_single_bad_signature() -> Result<(), Error> {
        let keys = [secret_key(1)?, secret_key(2)?, secret_key(3)?];
        let messages = [b"a".as_slice(), b"b", b"c"];
        let public_keys = keys.iter().map(SecretKey::to_public_key).collect_vec();

        let mut signatures = keys
            .iter()
            .zip(messages)
            .map(|(key, message)| key.sign(message))
            .collect_vec();

        assert!(Signature::multi_verify(messages, &signatures, &public_keys));

        signatures[1] = keys[1].sign(b"d");

        assert!(!Signature::multi_verify(messages, &signatures, &public_keys));

        Ok(())
    }

    #[test]
    fn empty_signature_bytes_decompress() {
        let bytes = SignatureBytes::from(Signature::default());
        assert!(bytes.is_empty());
    }

    fn secret_key(seed: u8) -> Result<SecretKey, Error> {
        SecretKey::derive(&[seed; 32])
    }
}
