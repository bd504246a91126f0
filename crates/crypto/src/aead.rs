//! Symmetric authenticated encryption.
//!
//! XChaCha20-Poly1305 with a random 24-byte nonce prepended to the
//! ciphertext. Used for both the transit layer (hop-by-hop) and the event
//! layer (group/channel keys).

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;

use coterie_core::Secret;

use crate::errors::CryptoError;

/// Nonce width prepended to every ciphertext.
pub const NONCE_LEN: usize = 24;

/// Encrypt `plaintext`, returning `nonce || ciphertext`.
pub fn encrypt(key: &Secret, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt `nonce || ciphertext` produced by [`encrypt`].
pub fn decrypt(key: &Secret, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::InvalidFormat("ciphertext shorter than nonce".into()));
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}
