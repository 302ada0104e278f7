//! Directory Datagram Client
//!
//! Request/response over UDP with the directory. Every request carries a
//! sequence number; replies with another number (late answers to earlier
//! requests that timed out) are dropped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::replication::protocol::{DirectoryEnvelope, DirectoryReply, MAX_DATAGRAM};
use crate::replication::{DirectoryRequest, DirectoryResponse, PrimaryEndpoint};

/// UDP client for the directory protocol
pub struct DirectoryClient {
    /// Socket; held for the whole exchange so replies are not stolen
    socket: Mutex<UdpSocket>,
    /// Resolved directory address
    directory: SocketAddr,
    /// Request sequence
    seq: AtomicU64,
}

impl DirectoryClient {
    /// Resolve the directory and bind an ephemeral socket
    pub async fn connect(directory: &str) -> Result<Self> {
        let directory = tokio::net::lookup_host(directory)
            .await?
            .next()
            .ok_or_else(|| Error::Config(format!("cannot resolve directory address {}", directory)))?;

        let bind_addr = if directory.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| Error::Network(format!("Failed to bind directory socket: {}", e)))?;

        Ok(Self {
            socket: Mutex::new(socket),
            directory,
            seq: AtomicU64::new(0),
        })
    }

    /// Directory address in use
    pub fn directory(&self) -> SocketAddr {
        self.directory
    }

    /// Send one request and wait for its reply
    pub async fn request(&self, request: DirectoryRequest, timeout: Duration) -> Result<DirectoryResponse> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let envelope = DirectoryEnvelope { seq, request };
        let bytes = envelope.encode()?;

        let socket = self.socket.lock().await;
        socket.send_to(&bytes, self.directory).await?;
        tracing::trace!("Sent {} #{} to directory {}", envelope.request.type_name(), seq, self.directory);

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let (len, src) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Ok(Ok(received)) => received,
                Ok(Err(e)) => {
                    // ICMP port unreachable surfaces here on some platforms
                    return Err(Error::Network(format!("directory {} unreachable: {}", self.directory, e)));
                }
                Err(_) => return Err(Error::ConnectionTimeout(self.directory.to_string())),
            };

            if src != self.directory {
                tracing::debug!("Ignoring datagram from {} (expected directory {})", src, self.directory);
                continue;
            }

            match DirectoryReply::decode(&buf[..len]) {
                Ok(reply) if reply.seq == seq => return Ok(reply.response),
                Ok(reply) => {
                    tracing::debug!("Dropping stale directory reply #{} (waiting for #{})", reply.seq, seq);
                }
                Err(e) => {
                    tracing::debug!("Undecodable directory reply: {}", e);
                }
            }
        }
    }

    /// Ask who is primary
    pub async fn discover(&self, timeout: Duration) -> Result<PrimaryEndpoint> {
        self.request(DirectoryRequest::Discover, timeout)
            .await?
            .primary
            .ok_or(Error::NoServer)
    }
}
