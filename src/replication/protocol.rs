//! Cluster Wire Protocol
//!
//! Datagram messages exchanged between nodes, the directory and clients:
//! directory requests/responses and the heartbeat that doubles as the
//! replication carrier on the multicast group.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use super::Version;

/// Largest datagram we are prepared to receive
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// A bound parameter of a replicated statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Integer(v as i64)
    }
}

/// One parameterised statement of a committed write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl SqlStatement {
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Replayable representation of one committed write on the primary.
///
/// Replaying it executes `statements` and sets the local version to
/// `version` in a single transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaLogEntry {
    /// Version this entry produces
    pub version: Version,
    /// Statements in commit order
    pub statements: Vec<SqlStatement>,
}

/// Periodic liveness message; carries at most one pending mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    /// Reporting node's version counter
    pub version: Version,
    /// Reporting node's client-facing port
    pub client_port: u16,
    /// Reporting node's bootstrap transfer port
    pub transfer_port: u16,
    /// Mutation to replicate, if one was committed since the last tick
    pub mutation: Option<ReplicaLogEntry>,
}

impl HeartbeatMessage {
    /// Pure liveness ping (no mutation)
    pub fn is_liveness(&self) -> bool {
        self.mutation.is_none()
    }

    /// Serialize for a datagram
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from a datagram
    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Requests a directory understands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DirectoryRequest {
    /// Node registration (key = source address + client port)
    Register { client_port: u16, transfer_port: u16 },
    /// Node heartbeat
    Heartbeat(HeartbeatMessage),
    /// "Who is primary?"
    Discover,
}

impl DirectoryRequest {
    /// Get the request type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            DirectoryRequest::Register { .. } => "Register",
            DirectoryRequest::Heartbeat(_) => "Heartbeat",
            DirectoryRequest::Discover => "Discover",
        }
    }
}

/// Endpoint of the current primary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrimaryEndpoint {
    pub address: IpAddr,
    pub client_port: u16,
    pub transfer_port: u16,
}

impl PrimaryEndpoint {
    /// Address clients connect to
    pub fn client_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.client_port)
    }

    /// Address backups bootstrap from
    pub fn transfer_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.transfer_port)
    }
}

impl std::fmt::Display for PrimaryEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (transfer {})", self.client_addr(), self.transfer_port)
    }
}

/// Answer to every directory request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryResponse {
    /// Current primary, `None` = no server available
    pub primary: Option<PrimaryEndpoint>,
    /// False when a heartbeat came from a key the directory does not know
    pub registered: bool,
    /// Source address the directory saw for this request
    pub observed_address: IpAddr,
}

impl DirectoryResponse {
    /// Does this response name the node identified by (observed address, client port)?
    pub fn names(&self, client_port: u16) -> bool {
        self.primary
            .map(|p| p.address == self.observed_address && p.client_port == client_port)
            .unwrap_or(false)
    }
}

/// Request datagram with a sequence number for reply correlation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryEnvelope {
    pub seq: u64,
    pub request: DirectoryRequest,
}

/// Reply datagram echoing the request's sequence number
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryReply {
    pub seq: u64,
    pub response: DirectoryResponse,
}

impl DirectoryEnvelope {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

impl DirectoryReply {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
