//! SQLite persistence for the coterie substrate.
//!
//! One database per node. Handler-private tables are written only through
//! the owning handler's module here; projected tables are written only by
//! the delta applier; readers go through the [`ReadOnlyDb`] facade.

pub mod addresses;
pub mod applier;
pub mod blocked;
pub mod db;
pub mod error;
pub mod event_store;
pub mod jobs;
pub mod outbox;
pub mod read_only;
pub mod secrets;

pub use db::{open, open_in_memory, run_migrations};
pub use error::StoreError;
pub use read_only::ReadOnlyDb;
