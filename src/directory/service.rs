//! Directory Service
//!
//! Datagram loop answering registrations, heartbeats and discovery
//! queries, plus the liveness monitor that expires silent nodes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::registry::{NodeKey, Registry};
use crate::config::DirectoryConfig;
use crate::error::{Error, Result};
use crate::replication::protocol::{DirectoryEnvelope, DirectoryReply, MAX_DATAGRAM};
use crate::replication::{DirectoryRequest, DirectoryResponse};

/// Registry shared by the datagram loop, the monitor and the status API
pub type SharedRegistry = Arc<Mutex<Registry>>;

/// Rendezvous point of the cluster
pub struct DirectoryService {
    socket: UdpSocket,
    registry: SharedRegistry,
    monitor_interval: Duration,
}

impl DirectoryService {
    /// Bind the directory socket
    pub async fn bind(config: &DirectoryConfig) -> Result<Self> {
        let socket = UdpSocket::bind(&config.bind_address)
            .await
            .map_err(|e| Error::Network(format!("Failed to bind directory on {}: {}", config.bind_address, e)))?;

        Ok(Self {
            socket,
            registry: Arc::new(Mutex::new(Registry::new(config.node_timeout()))),
            monitor_interval: config.monitor_interval(),
        })
    }

    /// Bound address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Handle to the registry
    pub fn registry(&self) -> SharedRegistry {
        Arc::clone(&self.registry)
    }

    /// Serve until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!("Directory listening on {}", self.local_addr()?);

        let monitor = tokio::spawn(monitor(
            Arc::clone(&self.registry),
            self.monitor_interval,
            shutdown.clone(),
        ));

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, src) = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(r) => r,
                    Err(e) => {
                        // ICMP errors from earlier replies show up here
                        tracing::debug!("Directory recv error: {}", e);
                        continue;
                    }
                },
            };

            let envelope = match DirectoryEnvelope::decode(&buf[..len]) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::debug!("Dropping undecodable datagram from {}: {}", src, e);
                    continue;
                }
            };

            let response = handle(&self.registry, src, envelope.request).await;
            let reply = DirectoryReply {
                seq: envelope.seq,
                response,
            };

            match reply.encode() {
                Ok(bytes) => {
                    if let Err(e) = self.socket.send_to(&bytes, src).await {
                        tracing::debug!("Failed to reply to {}: {}", src, e);
                    }
                }
                Err(e) => tracing::error!("Failed to encode directory reply: {}", e),
            }
        }

        let _ = monitor.await;
        tracing::info!("Directory stopped");
        Ok(())
    }
}

/// Apply one request to the registry
pub async fn handle(registry: &Mutex<Registry>, src: SocketAddr, request: DirectoryRequest) -> DirectoryResponse {
    let now = Instant::now();
    let mut registry = registry.lock().await;

    match request {
        DirectoryRequest::Register { client_port, transfer_port } => {
            let key = NodeKey {
                address: src.ip(),
                client_port,
            };
            registry.register(key, transfer_port, now)
        }
        DirectoryRequest::Heartbeat(message) => {
            let key = NodeKey {
                address: src.ip(),
                client_port: message.client_port,
            };
            registry.heartbeat(key, &message, now)
        }
        DirectoryRequest::Discover => registry.discover(src.ip()),
    }
}

async fn monitor(registry: SharedRegistry, period: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let sweep = registry.lock().await.sweep(Instant::now());
                if !sweep.removed.is_empty() {
                    tracing::info!(
                        "Liveness sweep removed {} node(s), promoted {:?}",
                        sweep.removed.len(),
                        sweep.promoted.map(|k| k.to_string())
                    );
                }
            }
        }
    }
}
