//! QuizCluster - Replicated Quiz Service
//!
//! A small primary/backup cluster coordinated by a directory service. The
//! directory tracks live data nodes and names exactly one primary; the
//! primary serves writes and multicasts every mutation to the backups,
//! which bootstrap from a full copy of its store and apply the stream in
//! version order.
//!
//! # Architecture
//!
//! - `directory`: registry of live nodes, liveness monitor, promotion
//! - `replication`: wire types, heartbeat sender, multicast listener and
//!   the version gate that keeps backups in step
//! - `node`: one data node (request server, bootstrap transfer, role)
//! - `client`: discovery and transparent reconnect with session replay
//! - `quiz`: the business layer (users, questions, answers)
//! - `store`: versioned SQLite store
//!
//! # Failover
//!
//! When the primary stops heartbeating the directory promotes the backup
//! with the highest version within one monitor tick. Clients rediscover the
//! primary and silently log in again.

pub mod api;
pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod network;
pub mod node;
pub mod quiz;
pub mod replication;
pub mod store;

pub use config::ClusterConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::client::{ClientEvent, Connector};
    pub use crate::config::ClusterConfig;
    pub use crate::directory::{DirectoryService, Registry};
    pub use crate::error::{Error, Result};
    pub use crate::node::{DataNode, NodeRole};
    pub use crate::quiz::{Request, Response, Role};
    pub use crate::replication::{HeartbeatMessage, PrimaryEndpoint, Version};
}
