//! Canonical event encoding.
//!
//! The canonical plaintext is compact JSON with lexicographically sorted
//! keys (serde_json's default object ordering). The signed canonical form is
//! that JSON with the `signature` field present, right-padded with `0x20` to
//! exactly 512 bytes; `event_id` is BLAKE2b-128 of the padded form. Sealed
//! `key` events are unsigned; their id hashes the padded unsigned form.

use serde_json::Value as JsonValue;
use thiserror::Error;

use coterie_core::EventId;
use coterie_crypto::hashing;

/// Fixed canonical event width on the wire.
pub const CANONICAL_LEN: usize = 512;

const PAD_BYTE: u8 = b' ';

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CanonicalError {
    #[error("event exceeds canonical size: {0} > {CANONICAL_LEN}")]
    TooLarge(usize),

    #[error("plaintext is not an object")]
    NotAnObject,

    #[error("canonical form did not parse: {0}")]
    Unparseable(String),
}

/// Compact sorted-key JSON bytes of the plaintext.
pub fn canonical_bytes(plaintext: &JsonValue) -> Result<Vec<u8>, CanonicalError> {
    if !plaintext.is_object() {
        return Err(CanonicalError::NotAnObject);
    }
    serde_json::to_vec(plaintext).map_err(|e| CanonicalError::Unparseable(e.to_string()))
}

/// The plaintext without its `signature` field: what gets signed.
pub fn signing_input(plaintext: &JsonValue) -> Result<Vec<u8>, CanonicalError> {
    let object = plaintext.as_object().ok_or(CanonicalError::NotAnObject)?;
    let mut unsigned = object.clone();
    unsigned.remove("signature");
    canonical_bytes(&JsonValue::Object(unsigned))
}

/// Pad canonical bytes to the fixed width.
pub fn pad(canonical: &[u8]) -> Result<Vec<u8>, CanonicalError> {
    if canonical.len() > CANONICAL_LEN {
        return Err(CanonicalError::TooLarge(canonical.len()));
    }
    let mut out = Vec::with_capacity(CANONICAL_LEN);
    out.extend_from_slice(canonical);
    out.resize(CANONICAL_LEN, PAD_BYTE);
    Ok(out)
}

/// Canonical signed padded form of a plaintext.
pub fn padded_canonical(plaintext: &JsonValue) -> Result<Vec<u8>, CanonicalError> {
    pad(&canonical_bytes(plaintext)?)
}

/// Content address of a plaintext: BLAKE2b-128 over the padded form.
pub fn compute_event_id(plaintext: &JsonValue) -> Result<EventId, CanonicalError> {
    Ok(hashing::event_id(&padded_canonical(plaintext)?))
}

/// Parse a padded canonical form back into a plaintext object.
pub fn parse_padded(padded: &[u8]) -> Result<JsonValue, CanonicalError> {
    let trimmed: &[u8] = {
        let mut end = padded.len();
        while end > 0 && padded[end - 1] == PAD_BYTE {
            end -= 1;
        }
        &padded[..end]
    };
    let value: JsonValue = serde_json::from_slice(trimmed)
        .map_err(|e| CanonicalError::Unparseable(e.to_string()))?;
    if !value.is_object() {
        return Err(CanonicalError::NotAnObject);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_bytes_sort_keys() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonical_bytes(&a).unwrap(), canonical_bytes(&b).unwrap());
    }

    #[test]
    fn pad_round_trips_through_parse() {
        let plaintext = json!({"type": "message", "content": "hi"});
        let padded = padded_canonical(&plaintext).unwrap();
        assert_eq!(padded.len(), CANONICAL_LEN);
        assert_eq!(parse_padded(&padded).unwrap(), plaintext);
    }

    #[test]
    fn oversized_events_are_rejected() {
        let plaintext = json!({"content": "x".repeat(CANONICAL_LEN)});
        assert!(matches!(
            padded_canonical(&plaintext),
            Err(CanonicalError::TooLarge(_))
        ));
    }

    #[test]
    fn event_id_is_stable_and_signature_sensitive() {
        let unsigned = json!({"type": "message", "content": "hi"});
        let signed = json!({"type": "message", "content": "hi", "signature": "ab"});

        assert_eq!(
            compute_event_id(&unsigned).unwrap(),
            compute_event_id(&unsigned).unwrap()
        );
        assert_ne!(
            compute_event_id(&unsigned).unwrap(),
            compute_event_id(&signed).unwrap()
        );
    }

    #[test]
    fn signing_input_excludes_signature() {
        let signed = json!({"type": "message", "content": "hi", "signature": "ab"});
        let unsigned = json!({"type": "message", "content": "hi"});
        assert_eq!(
            signing_input(&signed).unwrap(),
            canonical_bytes(&unsigned).unwrap()
        );
    }

    #[test]
    fn non_objects_are_rejected() {
        assert!(canonical_bytes(&json!("just a string")).is_err());
        assert!(parse_padded(b"[1,2,3]").is_err());
    }
}
