//! Envelope: the unit of transport through the pipeline.
//!
//! An envelope carries one event's data and metadata from ingress (or local
//! creation) to a terminal state. Field presence encodes pipeline stage, so
//! handler filters are pattern matches over presence plus the monotonic stage
//! flags. Envelopes are value-typed: handlers consume one and return zero or
//! more; the dispatcher owns their lifetime.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use coterie_core::{DepKind, DepRef, EventId, KeyId, RequestId, Secret};

/// Event-layer key reference. Held invariant across all handlers:
/// `key` names a symmetric group/channel key, `peer` names the recipient of
/// a sealed box. Transit keys are never referenced here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyRef {
    Key { key_id: KeyId },
    Peer { peer_id: EventId },
}

/// Local-only data riding on an envelope. Never transmitted: the outbound
/// type ([`OutgoingTransitEnvelope`]) has no field to put it in.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LocalMetadata {
    /// Identity signing seed (also yields the sealing secret by KDF).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<Secret>,

    /// Freshly minted event-layer key secret (group bootstrap, invites).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_key_secret: Option<Secret>,

    /// Freshly minted or invite-delivered transit-layer secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transit_secret: Option<Secret>,

    /// Bootstrap address learned out-of-band (invite links).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_addr: Option<(String, u16)>,
}

impl LocalMetadata {
    pub fn is_empty(&self) -> bool {
        self.private_key.is_none()
            && self.event_key_secret.is_none()
            && self.transit_secret.is_none()
            && self.bootstrap_addr.is_none()
    }
}

/// A resolved dependency payload, keyed in `resolved_deps` by its ref string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolvedDep {
    /// A validated, stored event.
    ValidatedEvent {
        event_type: String,
        event_id: EventId,
        plaintext: JsonValue,
    },
    /// A validated identity/peer event plus local key material when this
    /// node holds it (self-created path).
    Identity {
        event_id: EventId,
        plaintext: JsonValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        local_metadata: Option<LocalMetadata>,
    },
    /// A symmetric secret from local key storage (transit or event layer).
    TransitKey {
        key_id: KeyId,
        secret: Secret,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        network_id: Option<EventId>,
    },
    /// A peer's last known address.
    Address {
        peer_id: EventId,
        ip: String,
        port: u16,
    },
}

impl ResolvedDep {
    /// The event plaintext behind this dep, if it is event-backed.
    pub fn plaintext(&self) -> Option<&JsonValue> {
        match self {
            ResolvedDep::ValidatedEvent { plaintext, .. } => Some(plaintext),
            ResolvedDep::Identity { plaintext, .. } => Some(plaintext),
            _ => None,
        }
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

mod hex_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_some(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let opt = Option::<String>::deserialize(d)?;
        match opt {
            Some(s) => hex::decode(&s).map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// The envelope itself. All payload fields are optional; stage flags are
/// monotonic within one envelope's lifetime (`deps_included_and_valid` is the
/// exception: it resets whenever deps are added, see [`Envelope::add_dep`]).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Envelope {
    // ── event payload ────────────────────────────────────────────────
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_plaintext: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hex_opt")]
    pub event_ciphertext: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,

    // ── attribution ──────────────────────────────────────────────────
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<EventId>,

    // ── dependencies ─────────────────────────────────────────────────
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<DepRef>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resolved_deps: BTreeMap<String, ResolvedDep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_metadata: Option<LocalMetadata>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deps_included_and_valid: bool,

    // ── stage flags ──────────────────────────────────────────────────
    #[serde(default, skip_serializing_if = "is_false")]
    pub self_created: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub sig_checked: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_group_member: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub validated: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub stored: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub keys_stored: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub projected: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub local_only: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub should_remove: bool,

    // ── parked state ─────────────────────────────────────────────────
    #[serde(default, skip_serializing_if = "is_false")]
    pub missing_deps: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_dep_list: Vec<DepRef>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unblocked: bool,

    // ── transit layer ────────────────────────────────────────────────
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transit_key_id: Option<KeyId>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hex_opt")]
    pub transit_ciphertext: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_ref: Option<KeyRef>,

    // ── ingress ──────────────────────────────────────────────────────
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hex_opt")]
    pub raw_data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<i64>,

    // ── outbound path ────────────────────────────────────────────────
    #[serde(default, skip_serializing_if = "is_false")]
    pub outgoing: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub outgoing_checked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_ms: Option<i64>,

    // ── bookkeeping ──────────────────────────────────────────────────
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(default)]
    pub retry_count: u32,

    /// Control field: instructs the event-store owner to delete tombstones
    /// older than this timestamp. Set only by housekeeping jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gc_tombstones_before: Option<i64>,
}

impl Envelope {
    /// A locally created event envelope entering the pipeline.
    pub fn self_created(
        event_type: impl Into<String>,
        plaintext: JsonValue,
        deps: Vec<DepRef>,
        request_id: RequestId,
    ) -> Self {
        Self {
            event_plaintext: Some(plaintext),
            event_type: Some(event_type.into()),
            deps,
            self_created: true,
            request_id: Some(request_id),
            ..Self::default()
        }
    }

    /// An inbound datagram envelope.
    pub fn from_datagram(raw_data: Vec<u8>, origin_ip: String, origin_port: u16, received_at: i64) -> Self {
        Self {
            raw_data: Some(raw_data),
            origin_ip: Some(origin_ip),
            origin_port: Some(origin_port),
            received_at: Some(received_at),
            ..Self::default()
        }
    }

    /// Append a dependency, resetting the resolution gate. This is the only
    /// supported way to add deps; handlers must re-run the resolver after.
    pub fn add_dep(&mut self, dep: DepRef) {
        if !self.deps.contains(&dep) {
            self.deps.push(dep);
        }
        self.deps_included_and_valid = false;
    }

    /// Resolved payload for a specific ref.
    pub fn resolved(&self, dep: &DepRef) -> Option<&ResolvedDep> {
        self.resolved_deps.get(&dep.to_string())
    }

    /// First dep of the given kind, with its resolved payload if present.
    pub fn dep_of_kind(&self, kind: DepKind) -> Option<(&DepRef, Option<&ResolvedDep>)> {
        let dep = self.deps.iter().find(|d| d.kind == kind)?;
        Some((dep, self.resolved(dep)))
    }

    /// First resolved payload of the given kind.
    pub fn resolved_of_kind(&self, kind: DepKind) -> Option<&ResolvedDep> {
        self.dep_of_kind(kind).and_then(|(_, r)| r)
    }

    /// The event type, from the discriminator field or the plaintext.
    pub fn kind(&self) -> Option<&str> {
        self.event_type
            .as_deref()
            .or_else(|| self.plaintext_str("type"))
    }

    /// A string field of the plaintext object.
    pub fn plaintext_str(&self, key: &str) -> Option<&str> {
        self.event_plaintext.as_ref()?.get(key)?.as_str()
    }

    /// Whether the signed plaintext already carries a signature.
    pub fn has_signature(&self) -> bool {
        self.plaintext_str("signature").is_some()
    }
}

/// The only shape that may leave the node. Constructed from an envelope at
/// the send boundary; the type has no fields for plaintext, resolved deps,
/// or local metadata, so secrets cannot leak structurally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingTransitEnvelope {
    #[serde(with = "hex_required")]
    pub transit_ciphertext: Vec<u8>,
    pub transit_key_id: KeyId,
    pub dest_ip: String,
    pub dest_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_ms: Option<i64>,
}

mod hex_required {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Why an envelope could not be turned into an outbound datagram.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutboundError {
    #[error("missing field for outbound envelope: {0}")]
    Missing(&'static str),
}

impl TryFrom<&Envelope> for OutgoingTransitEnvelope {
    type Error = OutboundError;

    fn try_from(env: &Envelope) -> Result<Self, Self::Error> {
        Ok(Self {
            transit_ciphertext: env
                .transit_ciphertext
                .clone()
                .ok_or(OutboundError::Missing("transit_ciphertext"))?,
            transit_key_id: env
                .transit_key_id
                .ok_or(OutboundError::Missing("transit_key_id"))?,
            dest_ip: env.dest_ip.clone().ok_or(OutboundError::Missing("dest_ip"))?,
            dest_port: env.dest_port.ok_or(OutboundError::Missing("dest_port"))?,
            due_ms: env.due_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn add_dep_resets_resolution_gate() {
        let mut env = Envelope {
            deps_included_and_valid: true,
            ..Envelope::default()
        };
        env.add_dep(DepRef::parse("peer:ab12").unwrap());

        assert!(!env.deps_included_and_valid);
        assert_eq!(env.deps.len(), 1);
    }

    #[test]
    fn add_dep_is_idempotent_on_refs() {
        let mut env = Envelope::default();
        env.add_dep(DepRef::parse("peer:ab12").unwrap());
        env.add_dep(DepRef::parse("peer:ab12").unwrap());

        assert_eq!(env.deps.len(), 1);
    }

    #[test]
    fn kind_falls_back_to_plaintext_type() {
        let env = Envelope {
            event_plaintext: Some(json!({"type": "message"})),
            ..Envelope::default()
        };
        assert_eq!(env.kind(), Some("message"));
    }

    #[test]
    fn serde_round_trip_preserves_stage_flags() {
        let mut env = Envelope::self_created(
            "message",
            json!({"content": "hi"}),
            vec![DepRef::parse("channel:ff00").unwrap()],
            RequestId::new(),
        );
        env.sig_checked = true;
        env.retry_count = 3;
        env.event_ciphertext = Some(vec![1, 2, 3]);

        let text = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn outbound_conversion_carries_only_wire_fields() {
        let env = Envelope {
            transit_ciphertext: Some(vec![9, 9]),
            transit_key_id: Some(coterie_core::KeyId::from_bytes([1; 32])),
            dest_ip: Some("10.0.0.2".into()),
            dest_port: Some(7000),
            event_plaintext: Some(json!({"secret": "never"})),
            local_metadata: Some(LocalMetadata {
                private_key: Some(Secret::from_bytes([7; 32])),
                ..LocalMetadata::default()
            }),
            ..Envelope::default()
        };

        let out = OutgoingTransitEnvelope::try_from(&env).unwrap();
        let wire = serde_json::to_value(&out).unwrap();
        let keys: Vec<&str> = wire.as_object().unwrap().keys().map(|k| k.as_str()).collect();

        assert_eq!(
            keys,
            vec!["transit_ciphertext", "transit_key_id", "dest_ip", "dest_port"]
        );
    }

    #[test]
    fn outbound_conversion_requires_transit_fields() {
        let env = Envelope::default();
        assert!(OutgoingTransitEnvelope::try_from(&env).is_err());
    }
}
