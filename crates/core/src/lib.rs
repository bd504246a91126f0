//! Shared domain types for the coterie messaging substrate.

pub mod deps;
pub mod error;
pub mod id;
pub mod secret;

pub use deps::{DepKind, DepRef};
pub use error::{CoreError, CoreResult};
pub use id::{EventId, KeyId, RequestId};
pub use secret::Secret;
