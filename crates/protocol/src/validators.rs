//! Per-type validators.
//!
//! Structural checks only: required fields, id shapes, free-text budgets,
//! canonical size. Anything deeper (membership, signatures, key secrets)
//! is enforced by the pipeline stages that own it.

use std::sync::Arc;

use serde_json::Value as JsonValue;

use coterie_core::Secret;
use coterie_crypto::hashing;
use coterie_handlers::canonical;
use coterie_pipeline::{Envelope, Validator};

use crate::events;

pub fn all() -> Vec<Arc<dyn Validator>> {
    vec![
        Arc::new(IdentityValidator),
        Arc::new(GroupValidator),
        Arc::new(PeerValidator),
        Arc::new(UserValidator),
        Arc::new(InviteValidator),
        Arc::new(ChannelValidator),
        Arc::new(MessageValidator),
        Arc::new(KeyValidator),
        Arc::new(ReceiptValidator),
    ]
}

fn plaintext(envelope: &Envelope) -> Option<&JsonValue> {
    envelope.event_plaintext.as_ref()
}

fn fits_canonical(envelope: &Envelope) -> bool {
    plaintext(envelope).is_some_and(|p| canonical::padded_canonical(p).is_ok())
}

fn str_field<'a>(p: &'a JsonValue, key: &str) -> Option<&'a str> {
    p.get(key)?.as_str()
}

fn has_text(p: &JsonValue, key: &str, max: usize) -> bool {
    str_field(p, key).is_some_and(|s| !s.is_empty() && s.len() <= max)
}

fn has_hex(p: &JsonValue, key: &str, bytes: usize) -> bool {
    str_field(p, key)
        .is_some_and(|s| s.len() == bytes * 2 && s.bytes().all(|b| b.is_ascii_hexdigit()))
}

fn has_event_id(p: &JsonValue, key: &str) -> bool {
    has_hex(p, key, 16)
}

fn has_key_id(p: &JsonValue, key: &str) -> bool {
    has_hex(p, key, 32)
}

fn has_pub(p: &JsonValue, key: &str) -> bool {
    has_hex(p, key, 32)
}

pub struct IdentityValidator;

impl Validator for IdentityValidator {
    fn event_type(&self) -> &'static str {
        events::IDENTITY
    }

    fn validate(&self, envelope: &Envelope) -> bool {
        let Some(p) = plaintext(envelope) else { return false };
        has_text(p, "name", events::MAX_NAME_LEN)
            && has_pub(p, "sign_pub")
            && has_pub(p, "seal_pub")
            && fits_canonical(envelope)
    }
}

pub struct GroupValidator;

impl Validator for GroupValidator {
    fn event_type(&self) -> &'static str {
        events::GROUP
    }

    fn validate(&self, envelope: &Envelope) -> bool {
        let Some(p) = plaintext(envelope) else { return false };
        has_text(p, "name", events::MAX_NAME_LEN)
            && has_key_id(p, "key_id")
            && has_pub(p, "sign_pub")
            && fits_canonical(envelope)
    }
}

pub struct PeerValidator;

impl Validator for PeerValidator {
    fn event_type(&self) -> &'static str {
        events::PEER
    }

    fn validate(&self, envelope: &Envelope) -> bool {
        let Some(p) = plaintext(envelope) else { return false };
        has_event_id(p, "identity_id")
            && has_event_id(p, "network_id")
            && has_pub(p, "sign_pub")
            && has_pub(p, "seal_pub")
            && fits_canonical(envelope)
    }
}

pub struct UserValidator;

impl Validator for UserValidator {
    fn event_type(&self) -> &'static str {
        events::USER
    }

    fn validate(&self, envelope: &Envelope) -> bool {
        let Some(p) = plaintext(envelope) else { return false };
        has_text(p, "name", events::MAX_NAME_LEN)
            && has_event_id(p, "peer_id")
            && has_event_id(p, "group_id")
            && has_text(p, "invite_code", events::MAX_NAME_LEN)
            && fits_canonical(envelope)
    }
}

pub struct InviteValidator;

impl Validator for InviteValidator {
    fn event_type(&self) -> &'static str {
        events::INVITE
    }

    fn validate(&self, envelope: &Envelope) -> bool {
        let Some(p) = plaintext(envelope) else { return false };
        has_text(p, "invite_code", events::MAX_NAME_LEN)
            && has_event_id(p, "group_id")
            && has_key_id(p, "key_id")
            && fits_canonical(envelope)
    }
}

pub struct ChannelValidator;

impl Validator for ChannelValidator {
    fn event_type(&self) -> &'static str {
        events::CHANNEL
    }

    fn validate(&self, envelope: &Envelope) -> bool {
        let Some(p) = plaintext(envelope) else { return false };
        has_text(p, "name", events::MAX_NAME_LEN)
            && has_event_id(p, "group_id")
            && has_key_id(p, "key_id")
            && has_event_id(p, "group_member_id")
            && fits_canonical(envelope)
    }
}

pub struct MessageValidator;

impl Validator for MessageValidator {
    fn event_type(&self) -> &'static str {
        events::MESSAGE
    }

    fn validate(&self, envelope: &Envelope) -> bool {
        let Some(p) = plaintext(envelope) else { return false };
        has_text(p, "content", events::MAX_CONTENT_LEN)
            && has_event_id(p, "channel_id")
            && has_event_id(p, "group_id")
            && has_event_id(p, "group_member_id")
            && fits_canonical(envelope)
    }
}

pub struct KeyValidator;

impl Validator for KeyValidator {
    fn event_type(&self) -> &'static str {
        events::KEY
    }

    fn validate(&self, envelope: &Envelope) -> bool {
        let Some(p) = plaintext(envelope) else { return false };
        if !(has_key_id(p, "key_id") && has_hex(p, "secret", 32) && has_event_id(p, "group_id")) {
            return false;
        }
        // The key id is the content address of the secret.
        let declared = str_field(p, "key_id");
        let secret = str_field(p, "secret").and_then(|s| Secret::from_hex(s).ok());
        match (declared, secret) {
            (Some(declared), Some(secret)) => {
                hashing::key_id(&secret).to_hex() == declared && fits_canonical(envelope)
            }
            _ => false,
        }
    }
}

pub struct ReceiptValidator;

impl Validator for ReceiptValidator {
    fn event_type(&self) -> &'static str {
        events::RECEIPT
    }

    fn validate(&self, envelope: &Envelope) -> bool {
        let Some(p) = plaintext(envelope) else { return false };
        has_event_id(p, "message_id") && has_event_id(p, "peer_id") && fits_canonical(envelope)
    }
}
