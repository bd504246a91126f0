//! Crypto error types.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Covers MAC failures; callers treat this as a silent envelope drop.
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("signature verification failed")]
    SignatureVerificationFailed,

    /// Ciphertext or key material had the wrong shape.
    #[error("invalid format: {0}")]
    InvalidFormat(String),
}
