//! Replication Module
//!
//! Primary-to-backup replication: the heartbeat sender that reports
//! liveness to the directory and broadcasts mutations, the multicast
//! listener that applies them on backups, and the strict version gate
//! between the two.

pub mod protocol;
pub mod gate;
mod mailbox;
mod heartbeat;
mod multicast;

pub use protocol::{
    DirectoryRequest, DirectoryResponse, HeartbeatMessage, PrimaryEndpoint, ReplicaLogEntry,
    SqlStatement, SqlValue,
};
pub use gate::{GateDecision, VersionGate};
pub use mailbox::ReplicationMailbox;
pub use heartbeat::{HeartbeatSender, Verdict};
pub use multicast::{join_group, sender_socket, MulticastListener};

use crate::error::Error;

/// Monotonic version counter of a node's store
pub type Version = u64;

/// Terminal conditions that end a node's participation in the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// A replicated entry did not continue the local version stream
    Desynchronized { local: Version, remote: Version },
    /// A primary learned that the directory promoted someone else
    Deposed { primary: PrimaryEndpoint },
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::Desynchronized { local, remote } => {
                write!(f, "desynchronized (local {}, remote {})", local, remote)
            }
            Fault::Deposed { primary } => write!(f, "deposed by {}", primary),
        }
    }
}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::Desynchronized { local, remote } => Error::Desynchronized { local, remote },
            Fault::Deposed { primary } => Error::Deposed {
                primary: primary.to_string(),
            },
        }
    }
}

/// The node side of the replication channel.
///
/// The heartbeat sender and the multicast listener only talk to the node
/// through this trait.
#[async_trait::async_trait]
pub trait ReplicaHost: Send + Sync {
    /// Client-facing port (half of the node's directory key)
    fn client_port(&self) -> u16;

    /// Bootstrap transfer port
    fn transfer_port(&self) -> u16;

    /// Does this node currently believe it is primary?
    fn is_primary(&self) -> bool;

    /// Current local version of the store
    async fn local_version(&self) -> crate::Result<Version>;

    /// Replay one entry; the gate has already checked its version
    async fn apply_replica(&self, entry: &ReplicaLogEntry) -> crate::Result<()>;

    /// Backup -> primary activation (idempotent)
    async fn promote(&self);

    /// Publish a terminal fault
    fn fault(&self, fault: Fault);
}
