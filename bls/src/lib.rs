//! BLS12-381 signatures as used by the beacon chain, backed by `blst`.
//!
//! Keys and signatures travel in compressed form ([`PublicKeyBytes`], [`SignatureBytes`]) and
//! are decompressed only when they need to be verified.

pub use crate::{
    consts::DOMAIN_SEPARATION_TAG,
    error::Error,
    public_key::PublicKey,
    public_key_bytes::PublicKeyBytes,
    secret_key::SecretKey,
    signature::Signature,
    signature_bytes::SignatureBytes,
};

mod consts;
mod error;
mod public_key;
mod public_key_bytes;
mod secret_key;
mod signature;
mod signature_bytes;
