#![expect(clippy::module_name_repetitions)]

use anyhow::{ensure, Result};
use bls::{PublicKey, Signature, SignatureBytes};
use derive_more::Constructor;
use rayon::iter::{IntoParallelRefIterator as _, ParallelIterator as _};
use static_assertions::assert_not_impl_any;
use types::primitives::H256;

use crate::{
    error::{Error, SignatureKind},
    signature_sets::SignatureSet,
};

pub trait Verifier {
    const IS_NULL: bool;

    fn reserve(&mut self, additional: usize);

    fn verify_singular(
        &mut self,
        message: H256,
        signature_bytes: SignatureBytes,
        public_key: &PublicKey,
        signature_kind: SignatureKind,
    ) -> Result<()>;

    fn verify_aggregate<'keys>(
        &mut self,
        message: H256,
        signature_bytes: SignatureBytes,
        public_keys: impl IntoIterator<Item = &'keys PublicKey>,
        signature_kind: SignatureKind,
    ) -> Result<()>;

    fn extend(&mut self, signature_sets: impl IntoIterator<Item = SignatureSet>) -> Result<()> {
        for signature_set in signature_sets {
            match signature_set {
                SignatureSet::Single {
                    public_key,
                    signing_root,
                    signature,
                    kind,
                } => self.verify_singular(signing_root, signature, &public_key, kind)?,
                SignatureSet::Aggregate {
                    public_keys,
                    signing_root,
                    signature,
                    kind,
                } => self.verify_aggregate(signing_root, signature, &public_keys, kind)?,
            }
        }

        Ok(())
    }

    fn finish(&self) -> Result<()>;
}

impl<V: Verifier> Verifier for &mut V {
    const IS_NULL: bool = V::IS_NULL;

    #[inline]
    fn reserve(&mut self, additional: usize) {
        (*self).reserve(additional);
    }

    #[inline]
    fn verify_singular(
        &mut self,
        message: H256,
        signature_bytes: SignatureBytes,
        public_key: &PublicKey,
        signature_kind: SignatureKind,
    ) -> Result<()> {
        (*self).verify_singular(message, signature_bytes, public_key, signature_kind)
    }

    #[inline]
    fn verify_aggregate<'keys>(
        &mut self,
        message: H256,
        signature_bytes: SignatureBytes,
        public_keys: impl IntoIterator<Item = &'keys PublicKey>,
        signature_kind: SignatureKind,
    ) -> Result<()> {
        (*self).verify_aggregate(message, signature_bytes, public_keys, signature_kind)
    }

    #[inline]
    fn finish(&self) -> Result<()> {
        (**self).finish()
    }
}

/// Accepts everything. Used when signatures have been verified elsewhere.
pub struct NullVerifier;

impl Verifier for NullVerifier {
    const IS_NULL: bool = true;

    #[inline]
    fn reserve(&mut self, _additional: usize) {}

    #[inline]
    fn verify_singular(
        &mut self,
        _message: H256,
        _signature_bytes: SignatureBytes,
        _public_key: &PublicKey,
        _signature_kind: SignatureKind,
    ) -> Result<()> {
        Ok(())
    }

    #[inline]
    fn verify_aggregate<'keys>(
        &mut self,
        _message: H256,
        _signature_bytes: SignatureBytes,
        _public_keys: impl IntoIterator<Item = &'keys PublicKey>,
        _signature_kind: SignatureKind,
    ) -> Result<()> {
        Ok(())
    }

    #[inline]
    fn finish(&self) -> Result<()> {
        Ok(())
    }
}

/// Verifies every signature as soon as it is submitted.
pub struct SingleVerifier;

impl Verifier for SingleVerifier {
    const IS_NULL: bool = false;

    #[inline]
    fn reserve(&mut self, _additional: usize) {}

    #[inline]
    fn verify_singular(
        &mut self,
        message: H256,
        signature_bytes: SignatureBytes,
        public_key: &PublicKey,
        signature_kind: SignatureKind,
    ) -> Result<()> {
        let signature = Signature::try_from(signature_bytes)?;

        ensure!(
            signature.verify(message, public_key),
            Error::SignatureInvalid(signature_kind),
        );

        Ok(())
    }

    #[inline]
    fn verify_aggregate<'keys>(
        &mut self,
        message: H256,
        signature_bytes: SignatureBytes,
        public_keys: impl IntoIterator<Item = &'keys PublicKey>,
        signature_kind: SignatureKind,
    ) -> Result<()> {
        let signature = Signature::try_from(signature_bytes)?;

        ensure!(
            signature.fast_aggregate_verify(message, public_keys),
            Error::SignatureInvalid(signature_kind),
        );

        Ok(())
    }

    #[inline]
    fn finish(&self) -> Result<()> {
        Ok(())
    }
}

/// Collects signatures and verifies all of them at once in [`Verifier::finish`].
#[derive(Default)]
pub struct MultiVerifier {
    triples: Vec<Triple>,
}

impl Verifier for MultiVerifier {
    const IS_NULL: bool = false;

    #[inline]
    fn reserve(&mut self, additional: usize) {
        self.triples.reserve_exact(additional);
    }

    #[inline]
    fn verify_singular(
        &mut self,
        message: H256,
        signature_bytes: SignatureBytes,
        public_key: &PublicKey,
        _signature_kind: SignatureKind,
    ) -> Result<()> {
        self.triples
            .push(Triple::new(message, signature_bytes, *public_key));

        Ok(())
    }

    #[inline]
    fn verify_aggregate<'keys>(
        &mut self,
        message: H256,
        signature_bytes: SignatureBytes,
        public_keys: impl IntoIterator<Item = &'keys PublicKey>,
        _signature_kind: SignatureKind,
    ) -> Result<()> {
        let public_keys = public_keys.into_iter().copied().collect::<Vec<_>>();

        let public_key = public_keys
            .par_iter()
            .copied()
            .reduce_with(|mut aggregate, public_key| {
                aggregate.aggregate_in_place(public_key);
                aggregate
            })
            .ok_or(bls::Error::NoPublicKeysToAggregate)?;

        self.triples
            .push(Triple::new(message, signature_bytes, public_key));

        Ok(())
    }

    #[inline]
    fn finish(&self) -> Result<()> {
        if self.triples.is_empty() {
            return Ok(());
        }

        let messages = self.triples.iter().map(|triple| triple.message.as_bytes());

        let signatures = self
            .triples
            .par_iter()
            .map(|triple| triple.signature_bytes.try_into())
            .collect::<Result<Vec<Signature>, _>>()?;

        let public_keys = self.triples.iter().map(|triple| &triple.public_key);

        ensure!(
            Signature::multi_verify(messages, signatures.iter(), public_keys),
            Error::SignatureInvalid(SignatureKind::Multi),
        );

        Ok(())
    }
}

impl MultiVerifier {
    #[must_use]
    pub fn len(&self) -> usize {
        self.triples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }
}

/// Verifies `signature_sets` with a single batched call.
pub fn verify_signature_sets(signature_sets: impl IntoIterator<Item = SignatureSet>) -> Result<()> {
    let mut verifier = MultiVerifier::default();
    verifier.extend(signature_sets)?;
    verifier.finish()
}

#[derive(Constructor)]
struct Triple {
    message: H256,
    signature_bytes: SignatureBytes,
    public_key: PublicKey,
}

assert_not_impl_any!(Triple: Copy);
