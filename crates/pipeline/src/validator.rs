//! Per-type event validators.
//!
//! Validators are pure: they see the envelope and nothing else. The type
//! signature is the enforcement: there is no way to reach the database from
//! here. A `false` verdict purges the event (dedup-visible, never processed).

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::envelope::Envelope;

pub trait Validator: Send + Sync {
    /// The event type this validator owns.
    fn event_type(&self) -> &'static str;

    fn validate(&self, envelope: &Envelope) -> bool;
}

/// Validators by event type. Unknown types fail validation.
#[derive(Default, Clone)]
pub struct ValidatorRegistry {
    validators: BTreeMap<&'static str, Arc<dyn Validator>>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, validator: Arc<dyn Validator>) {
        self.validators.insert(validator.event_type(), validator);
    }

    pub fn get(&self, event_type: &str) -> Option<&Arc<dyn Validator>> {
        self.validators.get(event_type)
    }

    /// Validate an envelope by its event type; unregistered types are invalid.
    pub fn validate(&self, envelope: &Envelope) -> bool {
        match envelope.kind().and_then(|t| self.validators.get(t)) {
            Some(v) => v.validate(envelope),
            None => false,
        }
    }
}

impl std::fmt::Debug for ValidatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatorRegistry")
            .field("types", &self.validators.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct AlwaysOk;

    impl Validator for AlwaysOk {
        fn event_type(&self) -> &'static str {
            "message"
        }

        fn validate(&self, _: &Envelope) -> bool {
            true
        }
    }

    #[test]
    fn unknown_types_fail_validation() {
        let mut reg = ValidatorRegistry::new();
        reg.register(Arc::new(AlwaysOk));

        let known = Envelope {
            event_plaintext: Some(json!({"type": "message"})),
            ..Envelope::default()
        };
        let unknown = Envelope {
            event_plaintext: Some(json!({"type": "widget"})),
            ..Envelope::default()
        };

        assert!(reg.validate(&known));
        assert!(!reg.validate(&unknown));
    }
}
