//! Commands: pure envelope construction from typed params.

use serde_json::Value as JsonValue;

use coterie_pipeline::{Envelope, LocalMetadata};

use crate::events;
use crate::ops::{require_str, CommandCtx, CommandOp, OpError};

/// `identity.create {name}`: mints a local-only identity event carrying
/// its signing seed in local metadata. The keys handler persists the seed;
/// the send boundary never sees the envelope because it is local-only.
pub struct IdentityCreate;

impl CommandOp for IdentityCreate {
    fn name(&self) -> &'static str {
        "identity.create"
    }

    fn build(&self, params: JsonValue, ctx: &CommandCtx) -> Result<Vec<Envelope>, OpError> {
        let name = require_str(&params, "name")?;
        if name.len() > events::MAX_NAME_LEN {
            return Err(OpError::InvalidParams("name too long".into()));
        }

        let seed = ctx.crypto.generate_secret();
        let sign_pub = ctx.crypto.signing_public_key(&seed);
        let seal_pub = ctx.crypto.sealing_public_key(&seed);

        let plaintext = events::identity(name, &sign_pub, &seal_pub, ctx.now_ms);
        let mut envelope = Envelope::self_created(events::IDENTITY, plaintext, vec![], ctx.request_id);
        envelope.local_only = true;
        envelope.local_metadata = Some(LocalMetadata {
            private_key: Some(seed),
            ..LocalMetadata::default()
        });

        Ok(vec![envelope])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coterie_core::RequestId;
    use coterie_crypto::{CryptoCtx, CryptoMode};
    use serde_json::json;

    fn ctx() -> CommandCtx {
        CommandCtx {
            request_id: RequestId::new(),
            now_ms: 1_000,
            crypto: CryptoCtx::new(CryptoMode::Dummy),
        }
    }

    #[test]
    fn builds_a_local_only_identity_envelope() {
        let out = IdentityCreate.build(json!({"name": "alice"}), &ctx()).unwrap();
        assert_eq!(out.len(), 1);
        let env = &out[0];
        assert!(env.local_only);
        assert!(env.self_created);
        assert!(env.deps.is_empty());
        assert!(env
            .local_metadata
            .as_ref()
            .and_then(|lm| lm.private_key.as_ref())
            .is_some());
        assert_eq!(env.plaintext_str("name"), Some("alice"));
    }

    #[test]
    fn rejects_missing_or_oversized_names() {
        assert!(IdentityCreate.build(json!({}), &ctx()).is_err());
        assert!(IdentityCreate
            .build(json!({"name": "x".repeat(events::MAX_NAME_LEN + 1)}), &ctx())
            .is_err());
    }
}
