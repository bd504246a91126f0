//! The coterie event catalog.
//!
//! Concrete protocol on top of the pipeline engine: event plaintext shapes,
//! per-type validators and projectors, invite links, and the operations
//! (commands, queries, flows) the external API exposes. The engine treats
//! all of this as plug-in registries.

pub mod commands;
pub mod events;
pub mod flows;
pub mod invite;
pub mod jobs;
pub mod ops;
pub mod projectors;
pub mod queries;
pub mod reflectors;
pub mod validators;

use std::sync::Arc;

use coterie_pipeline::{ProjectorRegistry, ValidatorRegistry};

use crate::ops::{Job, Operation, Reflector};

/// Every validator in the catalog.
pub fn build_validators() -> Arc<ValidatorRegistry> {
    let mut registry = ValidatorRegistry::new();
    for validator in validators::all() {
        registry.register(validator);
    }
    Arc::new(registry)
}

/// Every projector in the catalog.
pub fn build_projectors() -> Arc<ProjectorRegistry> {
    let mut registry = ProjectorRegistry::new();
    for projector in projectors::all() {
        registry.register(projector);
    }
    Arc::new(registry)
}

/// Every operation the external API exposes.
pub fn operations() -> Vec<Operation> {
    let mut ops: Vec<Operation> = Vec::new();
    ops.push(Operation::Command(Arc::new(commands::IdentityCreate)));
    ops.push(Operation::Flow(Arc::new(flows::GroupCreate)));
    ops.push(Operation::Flow(Arc::new(flows::ChannelCreate)));
    ops.push(Operation::Flow(Arc::new(flows::MessageCreate)));
    ops.push(Operation::Flow(Arc::new(flows::InviteCreate)));
    ops.push(Operation::Flow(Arc::new(flows::JoinAsUser)));
    ops.push(Operation::Flow(Arc::new(flows::KeyCreate)));
    ops.push(Operation::Query(Arc::new(queries::MessageList)));
    ops.push(Operation::Query(Arc::new(queries::ChannelList)));
    ops.push(Operation::Query(Arc::new(queries::UserList)));
    ops.push(Operation::Query(Arc::new(queries::GroupMembers)));
    ops
}

/// Every job in the catalog.
pub fn jobs_catalog() -> Vec<Arc<dyn Job>> {
    vec![Arc::new(jobs::TombstoneGc::default())]
}

/// Every reflector in the catalog.
pub fn reflectors_catalog() -> Vec<Arc<dyn Reflector>> {
    vec![
        Arc::new(reflectors::BackfillOnPeer),
        Arc::new(reflectors::MessageReceipt),
    ]
}
