//! Event plaintext shapes.
//!
//! Every event is a flat JSON object with a `type` discriminator, a `deps`
//! array of public prerequisite refs (what receivers must resolve), a
//! creation timestamp, and type-specific fields. Events are canonical
//! 512-byte strings on the wire, so the shapes stay lean: author and
//! network attribution ride in `deps` and `group_id` rather than repeated
//! fields, and validators cap free-text lengths. Identity, peer, and group
//! records are self-certifying: they embed their own `sign_pub`.

use serde_json::{json, Value as JsonValue};

use coterie_core::{EventId, KeyId};

pub const IDENTITY: &str = "identity";
pub const GROUP: &str = "group";
pub const PEER: &str = "peer";
pub const USER: &str = "user";
pub const INVITE: &str = "invite";
pub const CHANNEL: &str = "channel";
pub const MESSAGE: &str = "message";
pub const KEY: &str = "key";
pub const RECEIPT: &str = "receipt";

/// Free-text budget that keeps every shape inside the canonical width with
/// signature headroom.
pub const MAX_NAME_LEN: usize = 40;
pub const MAX_CONTENT_LEN: usize = 64;

pub fn identity(name: &str, sign_pub: &[u8; 32], seal_pub: &[u8; 32], created_at_ms: i64) -> JsonValue {
    json!({
        "type": IDENTITY,
        "name": name,
        "sign_pub": hex::encode(sign_pub),
        "seal_pub": hex::encode(seal_pub),
        "created_at_ms": created_at_ms,
        "deps": [],
    })
}

/// The group event is the network bootstrap: its own event id becomes the
/// network id every later event attributes to.
pub fn group(name: &str, key_id: KeyId, sign_pub: &[u8; 32], created_at_ms: i64) -> JsonValue {
    json!({
        "type": GROUP,
        "name": name,
        "key_id": key_id.to_hex(),
        "sign_pub": hex::encode(sign_pub),
        "created_at_ms": created_at_ms,
        "deps": [],
    })
}

pub fn peer(
    identity_id: EventId,
    network_id: EventId,
    sign_pub: &[u8; 32],
    seal_pub: &[u8; 32],
    created_at_ms: i64,
) -> JsonValue {
    json!({
        "type": PEER,
        "identity_id": identity_id.to_hex(),
        "network_id": network_id.to_hex(),
        "sign_pub": hex::encode(sign_pub),
        "seal_pub": hex::encode(seal_pub),
        "created_at_ms": created_at_ms,
        "deps": [],
    })
}

pub fn user(
    name: &str,
    peer_id: EventId,
    group_id: EventId,
    invite_code: &str,
    created_at_ms: i64,
) -> JsonValue {
    json!({
        "type": USER,
        "name": name,
        "peer_id": peer_id.to_hex(),
        "group_id": group_id.to_hex(),
        "invite_code": invite_code,
        "created_at_ms": created_at_ms,
        "deps": [format!("peer:{}", peer_id.to_hex())],
    })
}

pub fn invite_record(
    invite_code: &str,
    group_id: EventId,
    key_id: KeyId,
    created_at_ms: i64,
) -> JsonValue {
    json!({
        "type": INVITE,
        "invite_code": invite_code,
        "group_id": group_id.to_hex(),
        "key_id": key_id.to_hex(),
        "created_at_ms": created_at_ms,
        "deps": [],
    })
}

/// Channel author and network attribution ride in `deps`; `key_id` names
/// the event key messages in this channel encrypt under.
pub fn channel(
    name: &str,
    group_id: EventId,
    key_id: KeyId,
    peer_id: EventId,
    group_member_id: EventId,
    created_at_ms: i64,
) -> JsonValue {
    json!({
        "type": CHANNEL,
        "name": name,
        "group_id": group_id.to_hex(),
        "key_id": key_id.to_hex(),
        "group_member_id": group_member_id.to_hex(),
        "created_at_ms": created_at_ms,
        "deps": [
            format!("peer:{}", peer_id.to_hex()),
            format!("group:{}", group_id.to_hex()),
        ],
    })
}

/// The author peer is the first `peer:` dep; the membership claim is
/// `group_member_id` against `group_id`.
pub fn message(
    content: &str,
    channel_id: EventId,
    group_id: EventId,
    peer_id: EventId,
    group_member_id: EventId,
    created_at_ms: i64,
) -> JsonValue {
    json!({
        "type": MESSAGE,
        "content": content,
        "channel_id": channel_id.to_hex(),
        "group_id": group_id.to_hex(),
        "group_member_id": group_member_id.to_hex(),
        "created_at_ms": created_at_ms,
        "deps": [
            format!("peer:{}", peer_id.to_hex()),
            format!("channel:{}", channel_id.to_hex()),
        ],
    })
}

/// Sealed key delivery; unsigned (sealing authenticates the recipient path).
pub fn key(key_id: KeyId, secret_hex: &str, group_id: EventId, created_at_ms: i64) -> JsonValue {
    json!({
        "type": KEY,
        "key_id": key_id.to_hex(),
        "secret": secret_hex,
        "group_id": group_id.to_hex(),
        "created_at_ms": created_at_ms,
        "deps": [],
    })
}

pub fn receipt(message_id: EventId, peer_id: EventId, created_at_ms: i64) -> JsonValue {
    json!({
        "type": RECEIPT,
        "message_id": message_id.to_hex(),
        "peer_id": peer_id.to_hex(),
        "created_at_ms": created_at_ms,
        "deps": [format!("message:{}", message_id.to_hex())],
    })
}
