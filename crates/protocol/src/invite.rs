//! Invite links.
//!
//! An invite link is the out-of-band bootstrap: it carries the network and
//! group ids, both shared secrets, an invite code, and the inviter's
//! address. Encoded as hex of compact JSON under a `coterie://` prefix.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use coterie_core::{EventId, KeyId, Secret};

const PREFIX: &str = "coterie://";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InviteError {
    #[error("bad invite link: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvitePayload {
    pub network_id: EventId,
    pub group_id: EventId,
    pub invite_code: String,
    pub event_key_id: KeyId,
    pub event_key_secret: Secret,
    pub transit_key_id: KeyId,
    pub transit_secret: Secret,
    pub inviter_ip: String,
    pub inviter_port: u16,
}

impl InvitePayload {
    pub fn encode(&self) -> Result<String, InviteError> {
        let json = serde_json::to_vec(self).map_err(|e| InviteError::Malformed(e.to_string()))?;
        Ok(format!("{PREFIX}{}", hex::encode(json)))
    }

    pub fn decode(link: &str) -> Result<Self, InviteError> {
        let body = link
            .strip_prefix(PREFIX)
            .ok_or_else(|| InviteError::Malformed("missing scheme".into()))?;
        let json =
            hex::decode(body.trim()).map_err(|e| InviteError::Malformed(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| InviteError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> InvitePayload {
        InvitePayload {
            network_id: EventId::from_bytes([1; 16]),
            group_id: EventId::from_bytes([1; 16]),
            invite_code: "welcome-1".into(),
            event_key_id: KeyId::from_bytes([2; 32]),
            event_key_secret: Secret::from_bytes([3; 32]),
            transit_key_id: KeyId::from_bytes([4; 32]),
            transit_secret: Secret::from_bytes([5; 32]),
            inviter_ip: "10.0.0.1".into(),
            inviter_port: 7000,
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let payload = sample();
        let link = payload.encode().unwrap();
        assert!(link.starts_with(PREFIX));
        assert_eq!(InvitePayload::decode(&link).unwrap(), payload);
    }

    #[test]
    fn rejects_foreign_schemes_and_garbage() {
        assert!(InvitePayload::decode("https://nope").is_err());
        assert!(InvitePayload::decode("coterie://zzzz").is_err());
    }
}
