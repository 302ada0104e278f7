//! Directory Module
//!
//! Rendezvous service of the cluster: tracks registered data nodes,
//! assigns the primary role, and promotes a backup when the primary
//! stops heartbeating.

mod registry;
mod service;

pub use registry::{NodeKey, NodeRecord, NodeStatus, Registry, RegistrySnapshot, Sweep};
pub use service::{handle, DirectoryService, SharedRegistry};
