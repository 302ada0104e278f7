//! Heartbeat Sender
//!
//! Every tick a node reports its version to the directory. On the primary the
//! tick also drains the mailbox and re-broadcasts the heartbeat (with the
//! drained mutation, if any) to the cluster's multicast group.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::protocol::{DirectoryRequest, DirectoryResponse, HeartbeatMessage, PrimaryEndpoint};
use super::{Fault, ReplicaHost, ReplicationMailbox};
use crate::error::Result;
use crate::network::DirectoryClient;

/// What a directory response asks of the node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Nothing to do
    Continue,
    /// The directory forgot us; register again
    Reregister,
    /// We are a backup and the directory names us primary
    Promote,
    /// We are primary and the directory names someone else
    Deposed(PrimaryEndpoint),
}

impl Verdict {
    /// Interpret a directory response for a node in the given role
    pub fn assess(is_primary: bool, client_port: u16, response: &DirectoryResponse) -> Self {
        if !response.registered {
            return Verdict::Reregister;
        }

        match response.primary {
            Some(_) if response.names(client_port) => {
                if is_primary {
                    Verdict::Continue
                } else {
                    Verdict::Promote
                }
            }
            Some(other) if is_primary => Verdict::Deposed(other),
            _ => Verdict::Continue,
        }
    }
}

/// Periodic heartbeat task of one node
pub struct HeartbeatSender<H: ReplicaHost> {
    host: Arc<H>,
    mailbox: Arc<ReplicationMailbox>,
    directory: Arc<DirectoryClient>,
    /// Socket used for multicast sends
    multicast: UdpSocket,
    multicast_target: SocketAddr,
    interval: Duration,
    reply_timeout: Duration,
    shutdown: CancellationToken,
}

impl<H: ReplicaHost> HeartbeatSender<H> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host: Arc<H>,
        mailbox: Arc<ReplicationMailbox>,
        directory: Arc<DirectoryClient>,
        multicast: UdpSocket,
        multicast_target: SocketAddr,
        interval: Duration,
        reply_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            host,
            mailbox,
            directory,
            multicast,
            multicast_target,
            interval,
            reply_timeout,
            shutdown,
        }
    }

    /// Tick until shut down or a fatal fault
    pub async fn run(self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            "Heartbeat sender started (every {:?}, directory {})",
            self.interval,
            self.directory.directory()
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        tracing::warn!("Heartbeat tick failed: {}", e);
                    }
                }
            }
        }

        tracing::info!("Heartbeat sender stopped");
        Ok(())
    }

    /// One heartbeat: report, react to the response, broadcast if primary
    pub async fn tick(&self) -> Result<()> {
        let (mutation, version) = if self.host.is_primary() {
            self.mailbox.drain().await
        } else {
            (None, self.host.local_version().await?)
        };

        let message = HeartbeatMessage {
            version,
            client_port: self.host.client_port(),
            transfer_port: self.host.transfer_port(),
            mutation,
        };

        let reaction = match self
            .directory
            .request(DirectoryRequest::Heartbeat(message.clone()), self.reply_timeout)
            .await
        {
            Ok(response) => self.react(response).await,
            Err(e) => {
                tracing::warn!("No heartbeat reply from directory: {}", e);
                Ok(())
            }
        };

        // A drained mutation must still go out unless the node is finished
        if let Err(e) = reaction {
            if e.is_fatal() {
                return Err(e);
            }
            tracing::warn!("Directory exchange failed: {}", e);
        }

        if self.host.is_primary() {
            self.broadcast(&message).await;
        }

        Ok(())
    }

    async fn react(&self, response: DirectoryResponse) -> Result<()> {
        let mut verdict = Verdict::assess(self.host.is_primary(), self.host.client_port(), &response);

        if verdict == Verdict::Reregister {
            tracing::warn!("Directory does not know this node, registering again");
            let request = DirectoryRequest::Register {
                client_port: self.host.client_port(),
                transfer_port: self.host.transfer_port(),
            };
            let response = self.directory.request(request, self.reply_timeout).await?;
            verdict = Verdict::assess(self.host.is_primary(), self.host.client_port(), &response);
        }

        match verdict {
            Verdict::Continue | Verdict::Reregister => Ok(()),
            Verdict::Promote => {
                tracing::warn!("Directory names this node primary, activating");
                self.host.promote().await;
                Ok(())
            }
            Verdict::Deposed(primary) => {
                tracing::error!("Directory reports {} as primary while this node is primary", primary);
                let fault = Fault::Deposed { primary };
                self.host.fault(fault.clone());
                Err(fault.into())
            }
        }
    }

    async fn broadcast(&self, message: &HeartbeatMessage) {
        let bytes = match message.encode() {
            Ok(b) => b,
            Err(e) => {
                tracing::error!("Failed to encode heartbeat: {}", e);
                return;
            }
        };

        match self.multicast.send_to(&bytes, self.multicast_target).await {
            Ok(_) => {
                if let Some(ref entry) = message.mutation {
                    tracing::debug!("Broadcast mutation v{} to {}", entry.version, self.multicast_target);
                } else {
                    tracing::trace!("Broadcast liveness v{}", message.version);
                }
            }
            Err(e) => tracing::warn!("Multicast send to {} failed: {}", self.multicast_target, e),
        }
    }
}
