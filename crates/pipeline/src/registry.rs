//! Handler registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::handler::Handler;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("duplicate handler name: {0}")]
    Duplicate(&'static str),
}

/// Holds the loaded handlers in stable name order.
///
/// Iteration order is the dispatch order. Because it is derived from names
/// rather than registration order, loading handlers in a different sequence
/// cannot change behavior.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: BTreeMap<&'static str, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn Handler>) -> Result<(), RegistryError> {
        let name = handler.name();
        if self.handlers.contains_key(name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Handlers in stable name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Handler>> {
        self.handlers.values()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}
