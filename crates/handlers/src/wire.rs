//! Wire layouts.
//!
//! Outer datagram: `transit_key_id(32) || transit_ciphertext`. Inside the
//! transit layer sits a small JSON frame carrying the event-layer fields;
//! its body is the event-layer ciphertext (or sealed box).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use coterie_core::{EventId, KeyId};
use coterie_pipeline::KeyRef;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),

    #[error("bad frame: {0}")]
    BadFrame(String),
}

/// Split a raw datagram into its transit key id and ciphertext.
pub fn split_datagram(raw: &[u8]) -> Result<(KeyId, Vec<u8>), WireError> {
    if raw.len() <= KeyId::LEN {
        return Err(WireError::TooShort(raw.len()));
    }
    let (id, ciphertext) = raw.split_at(KeyId::LEN);
    let id: [u8; 32] = id
        .try_into()
        .map_err(|_| WireError::TooShort(raw.len()))?;
    Ok((KeyId::from_bytes(id), ciphertext.to_vec()))
}

/// Join transit fields back into a raw datagram (the wire's job; provided
/// for the simulator and tests).
pub fn join_datagram(transit_key_id: KeyId, transit_ciphertext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(KeyId::LEN + transit_ciphertext.len());
    out.extend_from_slice(transit_key_id.as_bytes());
    out.extend_from_slice(transit_ciphertext);
    out
}

/// The plaintext of the transit layer: event-layer fields plus the
/// event-layer ciphertext body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitFrame {
    pub key_ref: KeyRef,
    pub event_id: EventId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<EventId>,
    #[serde(with = "hex_body")]
    pub body: Vec<u8>,
}

mod hex_body {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

impl TransitFrame {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(|e| WireError::BadFrame(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(bytes).map_err(|e| WireError::BadFrame(e.to_string()))
    }
}
