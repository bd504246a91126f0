//! BLAKE2b content addressing.
//!
//! Event ids are BLAKE2b-128 of the canonical signed plaintext; key ids are
//! BLAKE2b-256 of the raw secret. Hashing is identical in both crypto modes;
//! ids must stay content-addressed even under dummy ciphers.

use blake2::digest::consts::{U16, U32, U64};
use blake2::{Blake2b, Digest};

use coterie_core::{EventId, KeyId, Secret};

/// BLAKE2b-128 over the canonical signed plaintext.
pub fn event_id(canonical_signed: &[u8]) -> EventId {
    let mut hasher = Blake2b::<U16>::new();
    hasher.update(canonical_signed);
    EventId::from_bytes(hasher.finalize().into())
}

/// BLAKE2b-256 over the key secret.
pub fn key_id(secret: &Secret) -> KeyId {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(secret.as_bytes());
    KeyId::from_bytes(hasher.finalize().into())
}

/// BLAKE2b-256 over arbitrary bytes.
pub fn hash32(data: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// BLAKE2b-512 over arbitrary bytes (dummy-mode signatures).
pub fn hash64(data: &[u8]) -> [u8; 64] {
    let mut hasher = Blake2b::<U64>::new();
    hasher.update(data);
    hasher.finalize().into()
}
