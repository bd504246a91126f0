//! Cryptographic primitives for the coterie substrate.
//!
//! Two layers of authenticated encryption (transit and event), Ed25519 event
//! signing, X25519 sealed boxes for key delivery, and BLAKE2b content
//! addressing. All operations go through [`CryptoCtx`], which carries the
//! `CRYPTO_MODE` switch: `real` uses the ciphers below, `dummy` substitutes
//! deterministic keyed-hash constructions for reproducible tests.

pub mod aead;
pub mod errors;
pub mod hashing;
pub mod kdf;
pub mod seal;
pub mod sign;

mod ctx;

pub use ctx::{CryptoCtx, CryptoMode};
pub use errors::CryptoError;
