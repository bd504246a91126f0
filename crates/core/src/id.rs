//! Strongly-typed identifiers used across the substrate.
//!
//! Event and key ids are content-addressed hashes carried as fixed-size byte
//! arrays and rendered as lowercase hex. Request ids are transient UUIDs that
//! correlate flow-originated envelopes; they never appear on the wire.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::CoreError;

macro_rules! impl_hex_id {
    ($t:ident, $len:expr, $name:literal) => {
        impl $t {
            /// Byte width of this identifier.
            pub const LEN: usize = $len;

            pub fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(s: &str) -> Result<Self, CoreError> {
                let raw = hex::decode(s)
                    .map_err(|e| CoreError::invalid_id(format!("{}: {}", $name, e)))?;
                let bytes: [u8; $len] = raw.try_into().map_err(|_| {
                    CoreError::invalid_id(format!("{}: expected {} bytes", $name, $len))
                })?;
                Ok(Self(bytes))
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($name, "({})"), self.to_hex())
            }
        }

        impl FromStr for $t {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }

        impl Serialize for $t {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $t {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Content-addressed event identifier: BLAKE2b-128 of the canonical signed
/// plaintext. Also used for the ids derived from events (peers, networks,
/// channels), since those are event ids of the creating events.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId([u8; 16]);

impl_hex_id!(EventId, 16, "EventId");

/// Content-addressed key identifier: BLAKE2b-256 of the key secret.
/// Transit keys and event keys are both named this way.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId([u8; 32]);

impl_hex_id!(KeyId, 32, "KeyId");

/// Correlates the envelopes one operation (command or flow) produced.
/// Local-only; assigned at construction, never transmitted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Create a new identifier (UUIDv7, time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
