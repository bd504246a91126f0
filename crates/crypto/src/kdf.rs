//! Key derivation.
//!
//! Sub-keys are derived from a 32-byte seed with domain-separated BLAKE2b.
//! An identity's single stored seed yields both its Ed25519 signing key
//! (the seed itself) and its X25519 sealing secret (`derive(seed, SEAL)`).

use blake2::digest::consts::U32;
use blake2::digest::Mac;
use blake2::Blake2bMac;

use coterie_core::Secret;

/// Domain separator for the X25519 sealing secret derived from an identity seed.
pub const SEAL_CONTEXT: &str = "coterie.seal.v1";

/// Domain separator for sealed-box shared-secret expansion.
pub const SEALED_BOX_CONTEXT: &str = "coterie.sealed_box.v1";

/// Derive a sub-secret from `seed` under the given context string.
pub fn derive(seed: &Secret, context: &str) -> Secret {
    // Keyed BLAKE2b-256 with the seed as key and the context as message.
    let mut mac = <Blake2bMac<U32> as Mac>::new_from_slice(seed.as_bytes())
        .expect("32-byte key is always valid for BLAKE2b");
    mac.update(context.as_bytes());
    let out: [u8; 32] = mac.finalize().into_bytes().into();
    Secret::from_bytes(out)
}

/// Derive a sub-secret from raw shared-secret bytes (sealed boxes).
pub fn derive_raw(material: &[u8], context: &str) -> Secret {
    let mut mac = <Blake2bMac<U32> as Mac>::new_from_slice(&crate::hashing::hash32(material))
        .expect("32-byte key is always valid for BLAKE2b");
    mac.update(context.as_bytes());
    let out: [u8; 32] = mac.finalize().into_bytes().into();
    Secret::from_bytes(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let seed = Secret::from_bytes([5; 32]);
        assert_eq!(derive(&seed, SEAL_CONTEXT), derive(&seed, SEAL_CONTEXT));
    }

    #[test]
    fn contexts_separate_domains() {
        let seed = Secret::from_bytes([5; 32]);
        assert_ne!(derive(&seed, "a"), derive(&seed, "b"));
    }

    #[test]
    fn seeds_separate_outputs() {
        let a = Secret::from_bytes([1; 32]);
        let b = Secret::from_bytes([2; 32]);
        assert_ne!(derive(&a, SEAL_CONTEXT), derive(&b, SEAL_CONTEXT));
    }
}
