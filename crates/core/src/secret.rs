//! Secret key material.

use core::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::Zeroize;

use crate::error::CoreError;

/// 256-bit secret (signing seed, AEAD key, or transit secret).
///
/// Wiped on drop. The `Debug` impl never prints the material; serde encodes
/// hex so secrets survive the blocked-envelope round trip, which is local
/// storage only; outbound envelopes structurally cannot carry a `Secret`.
#[derive(Clone, PartialEq, Eq, Zeroize)]
#[zeroize(drop)]
pub struct Secret([u8; 32]);

impl Secret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let raw = hex::decode(s).map_err(|e| CoreError::invalid_id(format!("Secret: {e}")))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| CoreError::invalid_id("Secret: expected 32 bytes"))?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(..)")
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_material() {
        let s = Secret::from_bytes([9; 32]);
        assert_eq!(format!("{s:?}"), "Secret(..)");
    }

    #[test]
    fn hex_round_trip() {
        let s = Secret::from_bytes([3; 32]);
        assert_eq!(Secret::from_hex(&s.to_hex()).unwrap(), s);
    }
}
