//! Ed25519 event signing.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};

use coterie_core::Secret;

use crate::errors::CryptoError;

/// Signature width in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Public key derived from a signing seed.
pub fn public_key(seed: &Secret) -> [u8; 32] {
    SigningKey::from_bytes(seed.as_bytes())
        .verifying_key()
        .to_bytes()
}

/// Sign a message with the key derived from `seed` (deterministic).
pub fn sign(seed: &Secret, message: &[u8]) -> [u8; 64] {
    SigningKey::from_bytes(seed.as_bytes())
        .sign(message)
        .to_bytes()
}

/// Verify a signature against a 32-byte public key.
pub fn verify(public: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> Result<(), CryptoError> {
    let verifying_key =
        VerifyingKey::from_bytes(public).map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig = ed25519_dalek::Signature::from_bytes(signature);

    verifying_key
        .verify(message, &sig)
        .map_err(|_| CryptoError::SignatureVerificationFailed)
}
