//! Dependency references.
//!
//! An event names its prerequisites as ordered refs `"<kind>:<id>"`. The
//! resolver turns refs into resolved payloads before downstream handlers run.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;

/// The kind half of a dependency ref.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DepKind {
    /// A local identity; resolves to the identity event plus the private key.
    Identity,
    Peer,
    User,
    Group,
    Channel,
    Message,
    Invite,
    /// An event-layer (group) key held in local secret storage.
    Key,
    /// A transit-layer key held in local secret storage.
    TransitKey,
    /// A peer's last known network address.
    Address,
}

impl DepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepKind::Identity => "identity",
            DepKind::Peer => "peer",
            DepKind::User => "user",
            DepKind::Group => "group",
            DepKind::Channel => "channel",
            DepKind::Message => "message",
            DepKind::Invite => "invite",
            DepKind::Key => "key",
            DepKind::TransitKey => "transit_key",
            DepKind::Address => "address",
        }
    }

    /// Whether refs of this kind resolve against the validated-events store
    /// (as opposed to local secret tables or the address book).
    pub fn is_event_backed(&self) -> bool {
        !matches!(self, DepKind::Key | DepKind::TransitKey | DepKind::Address)
    }
}

impl FromStr for DepKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "identity" => Ok(DepKind::Identity),
            "peer" => Ok(DepKind::Peer),
            "user" => Ok(DepKind::User),
            "group" => Ok(DepKind::Group),
            "channel" => Ok(DepKind::Channel),
            "message" => Ok(DepKind::Message),
            "invite" => Ok(DepKind::Invite),
            "key" => Ok(DepKind::Key),
            "transit_key" => Ok(DepKind::TransitKey),
            "address" => Ok(DepKind::Address),
            other => Err(CoreError::malformed_ref(format!("unknown kind: {other}"))),
        }
    }
}

impl fmt::Display for DepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dependency reference: a kind plus the hex id it names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DepRef {
    pub kind: DepKind,
    pub id: String,
}

impl DepRef {
    pub fn new(kind: DepKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// Parse `"<kind>:<id>"`. The id must be non-empty lowercase hex.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| CoreError::malformed_ref(format!("missing ':' in {s:?}")))?;
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        {
            return Err(CoreError::malformed_ref(format!("bad id in {s:?}")));
        }
        Ok(Self {
            kind: kind.parse()?,
            id: id.to_string(),
        })
    }
}

impl fmt::Display for DepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for DepRef {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for DepRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DepRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_refs() {
        let r = DepRef::parse("identity:00ff00ff").unwrap();
        assert_eq!(r.kind, DepKind::Identity);
        assert_eq!(r.id, "00ff00ff");
        assert_eq!(r.to_string(), "identity:00ff00ff");
    }

    #[test]
    fn rejects_missing_separator() {
        assert!(DepRef::parse("identity").is_err());
    }

    #[test]
    fn rejects_unknown_kind() {
        assert!(DepRef::parse("widget:abcd").is_err());
    }

    #[test]
    fn rejects_non_hex_and_uppercase_ids() {
        assert!(DepRef::parse("peer:xyz").is_err());
        assert!(DepRef::parse("peer:ABCD").is_err());
        assert!(DepRef::parse("peer:").is_err());
    }

    #[test]
    fn serde_round_trip() {
        let r = DepRef::parse("transit_key:0a0b").unwrap();
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, "\"transit_key:0a0b\"");
        let back: DepRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn event_backed_kinds() {
        assert!(DepKind::Peer.is_event_backed());
        assert!(!DepKind::TransitKey.is_event_backed());
        assert!(!DepKind::Address.is_event_backed());
    }
}
