//! Mode-switched crypto front end.
//!
//! Handlers never call the cipher modules directly; they go through a
//! [`CryptoCtx`] so the whole pipeline can be flipped to deterministic dummy
//! constructions with `CRYPTO_MODE=dummy`. Dummy mode keeps every structural
//! property the pipeline relies on (tamper detection, wrong-key failure,
//! public-key derivation) while removing all randomness from ciphertexts.
//!
//! Content addressing (`hashing`) is identical in both modes.

use coterie_core::Secret;

use crate::errors::CryptoError;
use crate::{aead, hashing, kdf, seal, sign};

/// Cipher selection for the whole process.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum CryptoMode {
    #[default]
    Real,
    /// Keyed-hash stand-ins; deterministic, for tests.
    Dummy,
}

impl CryptoMode {
    /// Read `CRYPTO_MODE` from the environment (`real` unless set to `dummy`).
    pub fn from_env() -> Self {
        match std::env::var("CRYPTO_MODE").as_deref() {
            Ok("dummy") => CryptoMode::Dummy,
            _ => CryptoMode::Real,
        }
    }
}

/// Stateless crypto operations under one [`CryptoMode`].
#[derive(Debug, Copy, Clone, Default)]
pub struct CryptoCtx {
    mode: CryptoMode,
}

impl CryptoCtx {
    pub fn new(mode: CryptoMode) -> Self {
        Self { mode }
    }

    pub fn from_env() -> Self {
        Self::new(CryptoMode::from_env())
    }

    pub fn mode(&self) -> CryptoMode {
        self.mode
    }

    /// Fresh random 32-byte secret.
    pub fn generate_secret(&self) -> Secret {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Secret::from_bytes(bytes)
    }

    /// Signing public key for an identity seed.
    pub fn signing_public_key(&self, seed: &Secret) -> [u8; 32] {
        match self.mode {
            CryptoMode::Real => sign::public_key(seed),
            CryptoMode::Dummy => *seed.as_bytes(),
        }
    }

    /// Sealing public key for an identity seed.
    pub fn sealing_public_key(&self, seed: &Secret) -> [u8; 32] {
        match self.mode {
            CryptoMode::Real => seal::sealing_public_key(seed),
            CryptoMode::Dummy => *kdf::derive(seed, kdf::SEAL_CONTEXT).as_bytes(),
        }
    }

    pub fn sign(&self, seed: &Secret, message: &[u8]) -> [u8; 64] {
        match self.mode {
            CryptoMode::Real => sign::sign(seed, message),
            CryptoMode::Dummy => dummy_sign(seed.as_bytes(), message),
        }
    }

    pub fn verify(
        &self,
        public: &[u8; 32],
        message: &[u8],
        signature: &[u8; 64],
    ) -> Result<(), CryptoError> {
        match self.mode {
            CryptoMode::Real => sign::verify(public, message, signature),
            CryptoMode::Dummy => {
                // Dummy public keys are the seed itself, so the check is a
                // recomputation.
                if dummy_sign(public, message) == *signature {
                    Ok(())
                } else {
                    Err(CryptoError::SignatureVerificationFailed)
                }
            }
        }
    }

    pub fn aead_encrypt(&self, key: &Secret, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self.mode {
            CryptoMode::Real => aead::encrypt(key, plaintext),
            CryptoMode::Dummy => Ok(dummy_box(key.as_bytes(), plaintext)),
        }
    }

    pub fn aead_decrypt(&self, key: &Secret, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self.mode {
            CryptoMode::Real => aead::decrypt(key, data),
            CryptoMode::Dummy => dummy_open(key.as_bytes(), data),
        }
    }

    pub fn seal(&self, recipient_pub: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self.mode {
            CryptoMode::Real => seal::seal(recipient_pub, plaintext),
            CryptoMode::Dummy => {
                let mut out = Vec::with_capacity(32 + 32 + plaintext.len());
                out.extend_from_slice(recipient_pub);
                out.extend_from_slice(&dummy_box(recipient_pub, plaintext));
                Ok(out)
            }
        }
    }

    pub fn unseal(&self, identity_seed: &Secret, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self.mode {
            CryptoMode::Real => seal::unseal(identity_seed, data),
            CryptoMode::Dummy => {
                if data.len() < 32 {
                    return Err(CryptoError::InvalidFormat("sealed box shorter than header".into()));
                }
                let (addressed_to, boxed) = data.split_at(32);
                let own_pub = self.sealing_public_key(identity_seed);
                if addressed_to != own_pub {
                    return Err(CryptoError::DecryptionFailed("not addressed to this identity".into()));
                }
                dummy_open(&own_pub, boxed)
            }
        }
    }
}

/// Deterministic signature stand-in: BLAKE2b-512 over `key || msg`.
fn dummy_sign(key: &[u8; 32], message: &[u8]) -> [u8; 64] {
    let mut input = Vec::with_capacity(32 + 4 + message.len());
    input.extend_from_slice(key);
    input.extend_from_slice(b"sig:");
    input.extend_from_slice(message);
    hashing::hash64(&input)
}

/// Deterministic AEAD stand-in: `tag(32) || plaintext`, tag keyed by `key`.
fn dummy_box(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let tag = dummy_tag(key, plaintext);
    let mut out = Vec::with_capacity(32 + plaintext.len());
    out.extend_from_slice(&tag);
    out.extend_from_slice(plaintext);
    out
}

fn dummy_open(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < 32 {
        return Err(CryptoError::InvalidFormat("ciphertext shorter than tag".into()));
    }
    let (tag, plaintext) = data.split_at(32);
    if tag != dummy_tag(key, plaintext) {
        return Err(CryptoError::DecryptionFailed("tag mismatch".into()));
    }
    Ok(plaintext.to_vec())
}

fn dummy_tag(key: &[u8; 32], plaintext: &[u8]) -> [u8; 32] {
    let mut input = Vec::with_capacity(32 + 4 + plaintext.len());
    input.extend_from_slice(key);
    input.extend_from_slice(b"tag:");
    input.extend_from_slice(plaintext);
    hashing::hash32(&input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn both_modes() -> [CryptoCtx; 2] {
        [
            CryptoCtx::new(CryptoMode::Real),
            CryptoCtx::new(CryptoMode::Dummy),
        ]
    }

    #[test]
    fn aead_round_trip_in_both_modes() {
        for ctx in both_modes() {
            let key = Secret::from_bytes([1; 32]);
            let ct = ctx.aead_encrypt(&key, b"payload").unwrap();
            assert_eq!(ctx.aead_decrypt(&key, &ct).unwrap(), b"payload");

            let other = Secret::from_bytes([2; 32]);
            assert!(ctx.aead_decrypt(&other, &ct).is_err());
        }
    }

    #[test]
    fn sign_verify_in_both_modes() {
        for ctx in both_modes() {
            let seed = Secret::from_bytes([3; 32]);
            let public = ctx.signing_public_key(&seed);
            let sig = ctx.sign(&seed, b"event bytes");

            assert!(ctx.verify(&public, b"event bytes", &sig).is_ok());
            assert!(ctx.verify(&public, b"tampered", &sig).is_err());
        }
    }

    #[test]
    fn seal_unseal_in_both_modes() {
        for ctx in both_modes() {
            let seed = Secret::from_bytes([4; 32]);
            let public = ctx.sealing_public_key(&seed);
            let boxed = ctx.seal(&public, b"key material").unwrap();

            assert_eq!(ctx.unseal(&seed, &boxed).unwrap(), b"key material");

            let wrong = Secret::from_bytes([5; 32]);
            assert!(ctx.unseal(&wrong, &boxed).is_err());
        }
    }

    #[test]
    fn dummy_mode_is_deterministic() {
        let ctx = CryptoCtx::new(CryptoMode::Dummy);
        let key = Secret::from_bytes([6; 32]);
        assert_eq!(
            ctx.aead_encrypt(&key, b"x").unwrap(),
            ctx.aead_encrypt(&key, b"x").unwrap()
        );
    }
}
