//! Substrate wiring: pipeline + store + protocol under one roof.
//!
//! `Substrate` is what the outer surfaces (HTTP, tests, the simulator)
//! hold: it executes operations, ingests datagrams, ticks jobs, and exposes
//! the outbox for the wire to drain.

pub mod config;
pub mod substrate;

pub use config::Config;
pub use substrate::{Substrate, SubstrateError};
