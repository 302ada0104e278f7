//! Data Node
//!
//! One member of the replicated cluster. A node registers with the
//! directory, which makes it primary (accepts writes, produces the
//! replication stream) or backup (bootstraps from the primary, consumes
//! the stream, serves reads). Backups are promoted at runtime; a primary
//! never steps down.

mod bootstrap;
mod server;
mod shared;

pub use shared::NodeCore;
pub use bootstrap::{fetch_snapshot, send_snapshot};

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;

use shared::ListenerTask;
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::network::DirectoryClient;
use crate::quiz;
use crate::replication::{
    join_group, sender_socket, DirectoryRequest, DirectoryResponse, HeartbeatSender, MulticastListener,
    PrimaryEndpoint, ReplicaHost, ReplicationMailbox, VersionGate,
};
use crate::store::Store;

/// Lifecycle state of a data node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Unregistered,
    Registering,
    Backup,
    Primary,
    /// Desynchronized or deposed; the process must restart
    Faulted,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Unregistered => write!(f, "UNREGISTERED"),
            NodeRole::Registering => write!(f, "REGISTERING"),
            NodeRole::Backup => write!(f, "BACKUP"),
            NodeRole::Primary => write!(f, "PRIMARY"),
            NodeRole::Faulted => write!(f, "FAULTED"),
        }
    }
}

/// A data node with its listeners bound
pub struct DataNode {
    config: NodeConfig,
    core: Arc<NodeCore>,
    directory: Arc<DirectoryClient>,
    client_listener: TcpListener,
    transfer_listener: TcpListener,
    /// Outgoing replication broadcasts
    multicast_sender: UdpSocket,
}

impl DataNode {
    /// Open the store, bind the client and transfer listeners, resolve the directory
    pub async fn start(config: NodeConfig) -> Result<Self> {
        let store = Arc::new(Store::open(&config.store_path, quiz::SCHEMA)?);

        let client_listener = TcpListener::bind(&config.client_bind_address)
            .await
            .map_err(|e| Error::Network(format!("Failed to bind {}: {}", config.client_bind_address, e)))?;
        let transfer_listener = TcpListener::bind(&config.transfer_bind_address)
            .await
            .map_err(|e| Error::Network(format!("Failed to bind {}: {}", config.transfer_bind_address, e)))?;

        let directory = Arc::new(DirectoryClient::connect(&config.directory_address).await?);
        let multicast_sender = sender_socket(config.multicast_interface).await?;
        let version = store.version().await?;

        let core = Arc::new(NodeCore::new(
            store,
            Arc::new(ReplicationMailbox::new(version)),
            client_listener.local_addr()?.port(),
            transfer_listener.local_addr()?.port(),
            config.heartbeat_interval() * 3,
        ));

        tracing::info!(
            "Data node listening on {} (transfer {}), store at v{}",
            client_listener.local_addr()?,
            transfer_listener.local_addr()?,
            version
        );

        Ok(Self {
            config,
            core,
            directory,
            client_listener,
            transfer_listener,
            multicast_sender,
        })
    }

    /// Client-facing address
    pub fn client_addr(&self) -> Result<SocketAddr> {
        Ok(self.client_listener.local_addr()?)
    }

    /// Shared state, for observing role and faults
    pub fn core(&self) -> Arc<NodeCore> {
        Arc::clone(&self.core)
    }

    /// Run until shut down or a terminal fault
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let tasks = shutdown.child_token();
        let mut faults = self.core.subscribe_faults();

        tokio::spawn(server::serve_clients(
            Arc::clone(&self.core),
            self.client_listener,
            self.config.client_keepalive(),
            tasks.clone(),
        ));
        tokio::spawn(bootstrap::serve_transfers(
            Arc::clone(&self.core),
            self.transfer_listener,
            tasks.clone(),
        ));

        let joined = tokio::select! {
            _ = shutdown.cancelled() => None,
            result = join_cluster(&self.config, &self.core, &self.directory, &tasks) => Some(result),
        };

        let outcome = match joined {
            None => Ok(()),
            Some(Err(e)) => Err(e),
            Some(Ok(())) => {
                let sender = HeartbeatSender::new(
                    Arc::clone(&self.core),
                    Arc::clone(self.core.mailbox()),
                    Arc::clone(&self.directory),
                    self.multicast_sender,
                    self.config.multicast_target(),
                    self.config.heartbeat_interval(),
                    self.config.reply_timeout(),
                    tasks.clone(),
                );
                let mut heartbeat = tokio::spawn(sender.run());

                tokio::select! {
                    _ = shutdown.cancelled() => Ok(()),
                    raised = faults.wait_for(Option::is_some) => {
                        let fault = raised.ok().and_then(|f| (*f).clone());
                        Err(fault.map(Error::from).unwrap_or_else(|| Error::Internal("fault channel closed".into())))
                    }
                    finished = &mut heartbeat => match finished {
                        Ok(result) => result,
                        Err(e) => Err(Error::Internal(format!("heartbeat task failed: {}", e))),
                    },
                }
            }
        };

        tasks.cancel();
        match outcome {
            Ok(()) => tracing::info!("Data node stopped"),
            Err(ref e) => tracing::error!("Data node stopping: {}", e),
        }
        outcome
    }
}

/// Register, then take the role the directory assigns
async fn join_cluster(
    config: &NodeConfig,
    core: &Arc<NodeCore>,
    directory: &DirectoryClient,
    tasks: &CancellationToken,
) -> Result<()> {
    core.set_role(NodeRole::Registering);
    let (response, primary) = register(config, core, directory).await?;

    if response.names(core.client_port()) {
        return core.activate_primary().await;
    }

    // Join first: everything broadcast after the snapshot is already queued
    let socket = join_group(config.multicast_group, config.multicast_port, config.multicast_interface).await?;
    bootstrap(config, core, directory, primary).await?;

    let cancel = tasks.child_token();
    let listener = MulticastListener::new(
        Arc::clone(core),
        socket,
        own_address(config, &response),
        VersionGate::after_bootstrap(),
        cancel.clone(),
    );
    let task = tokio::spawn(listener.run());
    core.attach_listener(ListenerTask { cancel, task }).await;
    core.set_role(NodeRole::Backup);
    Ok(())
}

/// Source address of this node's own broadcasts: the configured interface,
/// or the address the directory saw when no interface is configured
fn own_address(config: &NodeConfig, registration: &DirectoryResponse) -> IpAddr {
    if config.multicast_interface.is_unspecified() {
        registration.observed_address
    } else {
        IpAddr::V4(config.multicast_interface)
    }
}

/// Register until the directory names a primary
async fn register(
    config: &NodeConfig,
    core: &NodeCore,
    directory: &DirectoryClient,
) -> Result<(DirectoryResponse, PrimaryEndpoint)> {
    let request = DirectoryRequest::Register {
        client_port: core.client_port(),
        transfer_port: core.transfer_port(),
    };

    loop {
        match directory.request(request.clone(), config.reply_timeout()).await {
            Ok(response) => {
                if let Some(primary) = response.primary {
                    tracing::info!("Registered with directory {}; primary is {}", directory.directory(), primary);
                    return Ok((response, primary));
                }
                tracing::warn!("Directory has no primary yet");
            }
            Err(e) => tracing::warn!("Registration with {} failed: {}", directory.directory(), e),
        }
        tokio::time::sleep(config.register_retry()).await;
    }
}

/// Copy the primary's store, rediscovering the primary between attempts
async fn bootstrap(
    config: &NodeConfig,
    core: &NodeCore,
    directory: &DirectoryClient,
    mut primary: PrimaryEndpoint,
) -> Result<()> {
    let attempts = config.bootstrap_attempts.max(1);

    for attempt in 1..=attempts {
        match fetch_snapshot(&primary, core.store(), config.reply_timeout()).await {
            Ok(version) => {
                tracing::info!("Bootstrapped from {} at v{}", primary, version);
                return Ok(());
            }
            Err(e) => tracing::warn!("Bootstrap attempt {}/{} from {} failed: {}", attempt, attempts, primary, e),
        }

        tokio::time::sleep(config.register_retry()).await;
        if let Ok(current) = directory.discover(config.reply_timeout()).await {
            primary = current;
        }
    }

    Err(Error::Bootstrap(format!("no snapshot after {} attempts", attempts)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DirectoryConfig;
    use crate::directory::DirectoryService;
    use crate::network::{read_frame, write_frame};
    use crate::quiz::{Request, Response, Role, ServerFrame};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::net::TcpStream;

    async fn directory() -> (SocketAddr, CancellationToken) {
        let config = DirectoryConfig {
            bind_address: "127.0.0.1:0".into(),
            node_timeout_ms: 17_000,
            monitor_interval_ms: 5_000,
        };
        let service = DirectoryService::bind(&config).await.unwrap();
        let addr = service.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(service.run(shutdown.clone()));
        (addr, shutdown)
    }

    fn node_config(dir: &TempDir, directory: SocketAddr) -> NodeConfig {
        NodeConfig {
            directory_address: directory.to_string(),
            store_path: dir.path().join("node.db"),
            client_bind_address: "127.0.0.1:0".into(),
            transfer_bind_address: "127.0.0.1:0".into(),
            heartbeat_interval_ms: 100,
            reply_timeout_ms: 500,
            register_retry_ms: 100,
            ..NodeConfig::default()
        }
    }

    async fn call(stream: &mut TcpStream, request: Request) -> Response {
        write_frame(stream, &request).await.unwrap();
        loop {
            match read_frame::<_, ServerFrame>(stream).await.unwrap() {
                ServerFrame::Response(response) => return response,
                ServerFrame::Notification(_) => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_first_node_serves_as_primary() {
        let (directory_addr, directory_shutdown) = directory().await;
        let dir = TempDir::new().unwrap();

        let node = DataNode::start(node_config(&dir, directory_addr)).await.unwrap();
        let client_addr = node.client_addr().unwrap();
        let core = node.core();
        let mut role = core.subscribe_role();

        let shutdown = CancellationToken::new();
        let run = tokio::spawn(node.run(shutdown.clone()));

        tokio::time::timeout(Duration::from_secs(5), role.wait_for(|r| *r == NodeRole::Primary))
            .await
            .unwrap()
            .unwrap();

        let mut stream = TcpStream::connect(client_addr).await.unwrap();
        let response = call(
            &mut stream,
            Request::SignUp {
                username: "ana".into(),
                password: "pw".into(),
                role: Role::Instructor,
            },
        )
        .await;
        assert_eq!(response, Response::SignedUp { user_id: 1 });

        // A second write waits for the heartbeat tick to drain the first
        let response = call(
            &mut stream,
            Request::SignUp {
                username: "bo".into(),
                password: "pw".into(),
                role: Role::Student,
            },
        )
        .await;
        assert_eq!(response, Response::SignedUp { user_id: 2 });
        assert_eq!(call(&mut stream, Request::Ping).await, Response::Pong { version: 2 });

        shutdown.cancel();
        assert!(run.await.unwrap().is_ok());
        directory_shutdown.cancel();
    }

    #[tokio::test]
    async fn test_backup_registers_and_copies_primary() {
        let (directory_addr, directory_shutdown) = directory().await;
        let primary_dir = TempDir::new().unwrap();

        let node = DataNode::start(node_config(&primary_dir, directory_addr)).await.unwrap();
        let client_addr = node.client_addr().unwrap();
        let mut role = node.core().subscribe_role();
        let shutdown = CancellationToken::new();
        let run = tokio::spawn(node.run(shutdown.clone()));

        tokio::time::timeout(Duration::from_secs(5), role.wait_for(|r| *r == NodeRole::Primary))
            .await
            .unwrap()
            .unwrap();

        let mut stream = TcpStream::connect(client_addr).await.unwrap();
        for username in ["ana", "bo"] {
            let response = call(
                &mut stream,
                Request::SignUp {
                    username: username.into(),
                    password: "pw".into(),
                    role: Role::Student,
                },
            )
            .await;
            assert!(matches!(response, Response::SignedUp { .. }));
        }

        // Second node, driven step by step up to the end of its bootstrap
        let backup_dir = TempDir::new().unwrap();
        let config = node_config(&backup_dir, directory_addr);
        let store = Arc::new(Store::open(&config.store_path, quiz::SCHEMA).unwrap());
        let backup = NodeCore::new(store, Arc::new(ReplicationMailbox::new(0)), 7950, 7951, Duration::from_secs(1));
        let directory_client = DirectoryClient::connect(&directory_addr.to_string()).await.unwrap();

        let (response, primary) = register(&config, &backup, &directory_client).await.unwrap();
        assert!(!response.names(7950));
        assert_eq!(primary.client_port, client_addr.port());

        bootstrap(&config, &backup, &directory_client, primary).await.unwrap();
        assert_eq!(backup.store().version().await.unwrap(), 2);
        assert_eq!(backup.local_version().await.unwrap(), 2);

        shutdown.cancel();
        assert!(run.await.unwrap().is_ok());
        directory_shutdown.cancel();
    }

    #[test]
    fn test_own_address_prefers_configured_interface() {
        let registration = DirectoryResponse {
            primary: None,
            registered: true,
            observed_address: IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 7)),
        };

        let mut config = NodeConfig::default();
        config.multicast_interface = std::net::Ipv4Addr::UNSPECIFIED;
        assert_eq!(own_address(&config, &registration), registration.observed_address);

        config.multicast_interface = std::net::Ipv4Addr::new(192, 168, 1, 4);
        assert_eq!(
            own_address(&config, &registration),
            IpAddr::V4(std::net::Ipv4Addr::new(192, 168, 1, 4))
        );
    }

    #[test]
    fn test_role_display() {
        assert_eq!(NodeRole::Primary.to_string(), "PRIMARY");
        assert_eq!(NodeRole::Faulted.to_string(), "FAULTED");
    }
}
