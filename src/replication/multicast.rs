//! Multicast Listener
//!
//! Runs on backups only. Receives the primary's heartbeats from the cluster
//! multicast group and replays their mutations through the version gate.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::gate::{GateDecision, VersionGate};
use super::protocol::{HeartbeatMessage, MAX_DATAGRAM};
use super::{Fault, ReplicaHost};
use crate::error::{Error, Result};

/// Bind the group port and join the group on `interface`
pub async fn join_group(group: Ipv4Addr, port: u16, interface: Ipv4Addr) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
        .await
        .map_err(|e| Error::Network(format!("Failed to bind multicast port {}: {}", port, e)))?;

    socket
        .join_multicast_v4(group, interface)
        .map_err(|e| Error::Network(format!("Failed to join multicast group {}: {}", group, e)))?;

    tracing::info!("Joined multicast group {}:{} on {}", group, port, interface);
    Ok(socket)
}

/// Socket for sending to the group from `interface`
pub async fn sender_socket(interface: Ipv4Addr) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddr::from((interface, 0)))
        .await
        .map_err(|e| Error::Network(format!("Failed to bind multicast sender: {}", e)))?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(1)?;
    Ok(socket)
}

/// Consumer side of the replication channel
pub struct MulticastListener<H: ReplicaHost> {
    host: Arc<H>,
    socket: UdpSocket,
    /// Source address this node's own datagrams carry
    own_address: IpAddr,
    gate: VersionGate,
    cancel: CancellationToken,
}

impl<H: ReplicaHost> MulticastListener<H> {
    pub fn new(
        host: Arc<H>,
        socket: UdpSocket,
        own_address: IpAddr,
        gate: VersionGate,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            host,
            socket,
            own_address,
            gate,
            cancel,
        }
    }

    /// Receive until cancelled (promotion) or desynchronized
    pub async fn run(mut self) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        tracing::info!("Multicast listener started");

        loop {
            let (len, src) = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::info!("Multicast listener stopped");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::trace!("Multicast recv error: {}", e);
                        continue;
                    }
                },
            };

            let message = match HeartbeatMessage::decode(&buf[..len]) {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!("Ignoring undecodable multicast datagram from {}: {}", src, e);
                    continue;
                }
            };

            if self.is_own(src, &message) {
                continue;
            }

            self.handle(message).await?;
        }
    }

    /// Same source address and same ports; an unknown own address matches nothing
    fn is_own(&self, src: SocketAddr, message: &HeartbeatMessage) -> bool {
        !self.own_address.is_unspecified()
            && src.ip() == self.own_address
            && message.client_port == self.host.client_port()
            && message.transfer_port == self.host.transfer_port()
    }

    /// Run one heartbeat through the gate and apply it if it continues the stream
    pub async fn handle(&mut self, message: HeartbeatMessage) -> Result<GateDecision> {
        let local = self.host.local_version().await?;

        match self.gate.check(local, &message) {
            Ok(GateDecision::Apply) => {
                if let Some(ref entry) = message.mutation {
                    if let Err(e) = self.host.apply_replica(entry).await {
                        tracing::error!("Replay of v{} failed: {}", entry.version, e);
                        self.gate.fail();
                        let fault = Fault::Desynchronized {
                            local,
                            remote: message.version,
                        };
                        self.host.fault(fault.clone());
                        return Err(fault.into());
                    }
                    tracing::debug!("Applied replicated mutation v{}", entry.version);
                }
                Ok(GateDecision::Apply)
            }
            Ok(GateDecision::Stale) => {
                tracing::debug!("Skipping pre-snapshot heartbeat v{} (local v{})", message.version, local);
                Ok(GateDecision::Stale)
            }
            Ok(decision) => Ok(decision),
            Err(fault) => {
                tracing::error!("Replication {}; this node must be restarted and re-bootstrapped", fault);
                self.host.fault(fault.clone());
                Err(fault.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::protocol::ReplicaLogEntry;
    use crate::replication::Version;
    use std::sync::Mutex;

    /// In-memory host that records what the listener did
    struct FakeHost {
        version: Mutex<Version>,
        faults: Mutex<Vec<Fault>>,
        reject_replay: bool,
    }

    impl FakeHost {
        fn at(version: Version) -> Arc<Self> {
            Arc::new(Self {
                version: Mutex::new(version),
                faults: Mutex::new(Vec::new()),
                reject_replay: false,
            })
        }
    }

    #[async_trait::async_trait]
    impl ReplicaHost for FakeHost {
        fn client_port(&self) -> u16 {
            9000
        }

        fn transfer_port(&self) -> u16 {
            9001
        }

        fn is_primary(&self) -> bool {
            false
        }

        async fn local_version(&self) -> crate::Result<Version> {
            Ok(*self.version.lock().unwrap())
        }

        async fn apply_replica(&self, entry: &ReplicaLogEntry) -> crate::Result<()> {
            if self.reject_replay {
                return Err(Error::Store("constraint failed".into()));
            }
            *self.version.lock().unwrap() = entry.version;
            Ok(())
        }

        async fn promote(&self) {}

        fn fault(&self, fault: Fault) {
            self.faults.lock().unwrap().push(fault);
        }
    }

    fn heartbeat(version: Version, with_mutation: bool) -> HeartbeatMessage {
        HeartbeatMessage {
            version,
            client_port: 7000,
            transfer_port: 7001,
            mutation: with_mutation.then(|| ReplicaLogEntry {
                version,
                statements: Vec::new(),
            }),
        }
    }

    async fn listener(host: Arc<FakeHost>, gate: VersionGate) -> MulticastListener<FakeHost> {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        MulticastListener::new(host, socket, IpAddr::V4(Ipv4Addr::LOCALHOST), gate, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_applies_in_order() {
        let host = FakeHost::at(0);
        let mut l = listener(Arc::clone(&host), VersionGate::synchronized()).await;

        assert_eq!(l.handle(heartbeat(1, true)).await.unwrap(), GateDecision::Apply);
        assert_eq!(l.handle(heartbeat(1, false)).await.unwrap(), GateDecision::InSync);
        assert_eq!(l.handle(heartbeat(2, true)).await.unwrap(), GateDecision::Apply);
        assert_eq!(host.local_version().await.unwrap(), 2);
        assert!(host.faults.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_gap_raises_fault_once() {
        let host = FakeHost::at(1);
        let mut l = listener(Arc::clone(&host), VersionGate::synchronized()).await;

        let err = l.handle(heartbeat(3, true)).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(host.local_version().await.unwrap(), 1);

        // Later traffic is discarded without a second fault
        assert_eq!(l.handle(heartbeat(2, true)).await.unwrap(), GateDecision::Discard);
        assert_eq!(
            *host.faults.lock().unwrap(),
            vec![Fault::Desynchronized { local: 1, remote: 3 }]
        );
    }

    #[tokio::test]
    async fn test_failed_replay_is_desynchronization() {
        let host = Arc::new(FakeHost {
            version: Mutex::new(0),
            faults: Mutex::new(Vec::new()),
            reject_replay: true,
        });
        let mut l = listener(Arc::clone(&host), VersionGate::synchronized()).await;

        assert!(l.handle(heartbeat(1, true)).await.is_err());
        assert_eq!(host.faults.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_own_datagrams_are_recognized() {
        let host = FakeHost::at(0);
        let l = listener(host, VersionGate::synchronized()).await;

        let own = HeartbeatMessage {
            client_port: 9000,
            transfer_port: 9001,
            ..heartbeat(0, false)
        };
        let local: SocketAddr = "127.0.0.1:4446".parse().unwrap();
        let remote: SocketAddr = "10.9.9.9:4446".parse().unwrap();

        assert!(l.is_own(local, &own));
        assert!(!l.is_own(remote, &own));
        assert!(!l.is_own(local, &heartbeat(0, false)));
    }

    #[tokio::test]
    async fn test_same_ports_on_another_host_are_applied() {
        // Every host runs its node on the same fixed ports
        let host = FakeHost::at(0);
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let observed = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 6));
        let mut l = MulticastListener::new(
            Arc::clone(&host),
            socket,
            observed,
            VersionGate::synchronized(),
            CancellationToken::new(),
        );

        let primary = HeartbeatMessage {
            client_port: 9000,
            transfer_port: 9001,
            ..heartbeat(1, true)
        };
        let primary_src: SocketAddr = "10.0.0.5:4446".parse().unwrap();
        let own_src: SocketAddr = "10.0.0.6:4446".parse().unwrap();

        assert!(!l.is_own(primary_src, &primary));
        assert!(l.is_own(own_src, &primary));
        assert_eq!(l.handle(primary).await.unwrap(), GateDecision::Apply);
        assert_eq!(host.local_version().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_own_address_filters_nothing() {
        let host = FakeHost::at(0);
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let l = MulticastListener::new(
            host,
            socket,
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            VersionGate::synchronized(),
            CancellationToken::new(),
        );

        let message = HeartbeatMessage {
            client_port: 9000,
            transfer_port: 9001,
            ..heartbeat(0, false)
        };
        assert!(!l.is_own("10.0.0.5:4446".parse().unwrap(), &message));
    }

    #[tokio::test]
    async fn test_cancel_stops_listener() {
        let host = FakeHost::at(0);
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let cancel = CancellationToken::new();
        let l = MulticastListener::new(
            host,
            socket,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            VersionGate::synchronized(),
            cancel.clone(),
        );

        let task = tokio::spawn(l.run());
        cancel.cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(1), task).await;
        assert!(result.unwrap().unwrap().is_ok());
    }
}
