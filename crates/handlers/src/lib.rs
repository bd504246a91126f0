//! The pipeline handlers.
//!
//! Each module is one filter + transform per the stage map: `receive` parses
//! datagrams, `resolve_deps` parks and rewakes, the crypto handlers peel and
//! apply the two encryption layers, `signature` signs/verifies, `membership`
//! and `validate` gate storage, `keys` persists local secret material,
//! `project` applies read-model deltas, and `check_outgoing`/`send` drive
//! the outbound path. Filters are pairwise disjoint over the envelope stage
//! flags so registry order never shows in behavior.

pub mod canonical;
pub mod check_outgoing;
pub mod event_crypto;
pub mod keys;
pub mod membership;
pub mod project;
pub mod receive;
pub mod resolve_deps;
pub mod send;
pub mod signature;
pub mod transit_crypto;
pub mod validate;
pub mod wire;

use std::sync::Arc;

use coterie_crypto::CryptoCtx;
use coterie_pipeline::{HandlerRegistry, ProjectorRegistry, ValidatorRegistry};

/// Tombstone retention: 30 days.
pub const DEFAULT_TOMBSTONE_TTL_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// Shared handler configuration.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub crypto: CryptoCtx,
    pub tombstone_ttl_ms: i64,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            crypto: CryptoCtx::default(),
            tombstone_ttl_ms: DEFAULT_TOMBSTONE_TTL_MS,
        }
    }
}

/// Build the full registry with every pipeline handler loaded.
pub fn build_registry(
    config: HandlerConfig,
    validators: Arc<ValidatorRegistry>,
    projectors: Arc<ProjectorRegistry>,
) -> Result<HandlerRegistry, coterie_pipeline::registry::RegistryError> {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(receive::Receive))?;
    registry.register(Arc::new(resolve_deps::ResolveDeps))?;
    registry.register(Arc::new(transit_crypto::TransitCrypto::new(config.crypto)))?;
    registry.register(Arc::new(event_crypto::EventCrypto::new(config.crypto)))?;
    registry.register(Arc::new(signature::Signature::new(config.crypto)))?;
    registry.register(Arc::new(membership::Membership))?;
    registry.register(Arc::new(validate::Validate::new(
        validators,
        config.tombstone_ttl_ms,
    )))?;
    registry.register(Arc::new(keys::Keys))?;
    registry.register(Arc::new(project::Project::new(projectors)))?;
    registry.register(Arc::new(check_outgoing::CheckOutgoing))?;
    registry.register(Arc::new(send::Send))?;
    Ok(registry)
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Wrap a store failure for the handler error channel.
pub(crate) fn store_err(e: coterie_store::StoreError) -> coterie_pipeline::HandlerError {
    coterie_pipeline::HandlerError::Internal(e.into())
}
