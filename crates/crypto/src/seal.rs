//! X25519 sealed boxes.
//!
//! Key events are sealed to one recipient: an ephemeral X25519 keypair is
//! generated, Diffie-Hellman with the recipient's sealing public key yields
//! a shared secret, and the payload is AEAD-encrypted under a key derived
//! from it. Output layout: `ephemeral_pub(32) || nonce || ciphertext`.
//!
//! The recipient's sealing keypair is derived from their identity seed via
//! [`crate::kdf::derive`] with [`crate::kdf::SEAL_CONTEXT`], so one stored
//! seed covers signing and unsealing.

use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use coterie_core::Secret;

use crate::errors::CryptoError;
use crate::{aead, kdf};

/// Sealing public key for an identity seed.
pub fn sealing_public_key(identity_seed: &Secret) -> [u8; 32] {
    let sealing_secret = kdf::derive(identity_seed, kdf::SEAL_CONTEXT);
    let secret = StaticSecret::from(*sealing_secret.as_bytes());
    PublicKey::from(&secret).to_bytes()
}

/// Seal `plaintext` to the holder of `recipient_pub`.
pub fn seal(recipient_pub: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut eph_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut eph_bytes);
    let ephemeral = StaticSecret::from(eph_bytes);
    let ephemeral_pub = PublicKey::from(&ephemeral);

    let shared = ephemeral.diffie_hellman(&PublicKey::from(*recipient_pub));
    let key = kdf::derive_raw(shared.as_bytes(), kdf::SEALED_BOX_CONTEXT);

    let boxed = aead::encrypt(&key, plaintext)?;

    let mut out = Vec::with_capacity(32 + boxed.len());
    out.extend_from_slice(ephemeral_pub.as_bytes());
    out.extend_from_slice(&boxed);
    Ok(out)
}

/// Open a sealed box with the recipient's identity seed.
pub fn unseal(identity_seed: &Secret, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < 32 {
        return Err(CryptoError::InvalidFormat("sealed box shorter than header".into()));
    }
    let (eph, boxed) = data.split_at(32);
    let eph_pub: [u8; 32] = eph
        .try_into()
        .map_err(|_| CryptoError::InvalidFormat("bad ephemeral key".into()))?;

    let sealing_secret = kdf::derive(identity_seed, kdf::SEAL_CONTEXT);
    let secret = StaticSecret::from(*sealing_secret.as_bytes());
    let shared = secret.diffie_hellman(&PublicKey::from(eph_pub));
    let key = kdf::derive_raw(shared.as_bytes(), kdf::SEALED_BOX_CONTEXT);

    aead::decrypt(&key, boxed)
}
