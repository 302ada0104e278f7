//! Client Connector
//!
//! Finds the primary through the directory, keeps one logical session with
//! it, and carries that session across failovers: on disconnect it
//! rediscovers, reconnects and silently replays the cached login.

mod session;

pub use session::{ClientSession, Credentials};

use std::time::Duration;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::network::{read_frame, write_frame, DirectoryClient};
use crate::quiz::{Notification, Request, Response, ServerFrame};
use crate::replication::PrimaryEndpoint;

/// Status and out-of-band messages for the interactive layer
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Pushed by the server
    Notification(Notification),
    /// Connection attempt failed; trying again after `delay`
    Retrying { reason: String, delay: Duration },
    /// Session restored on `primary`
    Reconnected { primary: PrimaryEndpoint, reauthenticated: bool },
}

/// Live transport to one primary
struct Connection {
    endpoint: PrimaryEndpoint,
    writer: OwnedWriteHalf,
    responses: mpsc::Receiver<Response>,
    reader: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Client side of the request protocol
pub struct Connector {
    config: ClientConfig,
    directory: DirectoryClient,
    session: ClientSession,
    connection: Option<Connection>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl Connector {
    /// Resolve the directory; no connection is made yet
    pub async fn new(config: ClientConfig, events: mpsc::UnboundedSender<ClientEvent>) -> Result<Self> {
        let directory = DirectoryClient::connect(&config.directory_address).await?;
        Ok(Self {
            config,
            directory,
            session: ClientSession::new(),
            connection: None,
            events,
        })
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Endpoint of the current connection
    pub fn endpoint(&self) -> Option<PrimaryEndpoint> {
        self.connection.as_ref().map(|c| c.endpoint)
    }

    /// Ask the directory for the primary once
    pub async fn discover(&self) -> Result<PrimaryEndpoint> {
        self.directory.discover(self.config.discovery_timeout()).await
    }

    /// Discover and connect, retrying until a primary accepts
    pub async fn connect(&mut self) -> Result<PrimaryEndpoint> {
        self.establish(None).await
    }

    /// Send one request and wait for its response.
    ///
    /// A broken transport yields `Error::Disconnected`; cached credentials
    /// survive so `recover` can restore the session.
    pub async fn call(&mut self, request: Request) -> Result<Response> {
        let connection = self.connection.as_mut().ok_or(Error::Disconnected)?;
        let endpoint = connection.endpoint;

        let exchange = async {
            write_frame(&mut connection.writer, &request)
                .await
                .map_err(|_| Error::Disconnected)?;
            connection.responses.recv().await.ok_or(Error::Disconnected)
        };

        let outcome = match tokio::time::timeout(self.config.request_timeout(), exchange).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionTimeout(endpoint.client_addr().to_string())),
        };

        match outcome {
            Ok(response) => {
                self.session.observe(&request, &response);
                Ok(response)
            }
            Err(e) => {
                tracing::debug!("Connection to {} lost: {}", endpoint, e);
                self.connection = None;
                Err(e)
            }
        }
    }

    /// Restore the session after a disconnect
    pub async fn recover(&mut self) -> Result<PrimaryEndpoint> {
        self.connection = None;
        let previous = self.session.primary();
        self.establish(previous).await
    }

    /// Explicit logout: also forgets the cached credentials
    pub async fn logout(&mut self) -> Result<Response> {
        let response = self.call(Request::Logout).await;
        self.session.forget();
        response
    }

    async fn establish(&mut self, previous: Option<PrimaryEndpoint>) -> Result<PrimaryEndpoint> {
        loop {
            let endpoint = self.discover_until_found().await;

            let connection = match self.open(endpoint).await {
                Ok(c) => c,
                Err(e) => {
                    // The same primary again: give it time before asking the directory
                    let delay = if Some(endpoint) == previous {
                        self.config.same_primary_backoff()
                    } else {
                        self.config.discovery_retry()
                    };
                    self.retrying(format!("cannot reach primary {}: {}", endpoint, e), delay).await;
                    continue;
                }
            };

            self.connection = Some(connection);
            self.session.set_primary(endpoint);

            match self.replay_login().await {
                Ok(reauthenticated) => {
                    if previous.is_some() {
                        let _ = self.events.send(ClientEvent::Reconnected {
                            primary: endpoint,
                            reauthenticated,
                        });
                    }
                    tracing::info!("Connected to primary {}", endpoint);
                    return Ok(endpoint);
                }
                Err(e) if e.is_retryable() => {
                    self.retrying(format!("lost {} while restoring session: {}", endpoint, e), self.config.discovery_retry())
                        .await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn discover_until_found(&self) -> PrimaryEndpoint {
        loop {
            match self.discover().await {
                Ok(endpoint) => return endpoint,
                Err(e) => self.retrying(e.to_string(), self.config.discovery_retry()).await,
            }
        }
    }

    async fn retrying(&self, reason: String, delay: Duration) {
        tracing::debug!("Retrying in {:?}: {}", delay, reason);
        let _ = self.events.send(ClientEvent::Retrying { reason, delay });
        tokio::time::sleep(delay).await;
    }

    /// Silently log in again with the cached credentials
    async fn replay_login(&mut self) -> Result<bool> {
        let credentials = match self.session.credentials() {
            Some(c) => c.clone(),
            None => return Ok(false),
        };

        match self.call(credentials.login_request()).await? {
            Response::LoggedIn { .. } => Ok(true),
            other => {
                tracing::warn!("Cached login for {} was rejected: {:?}", credentials.username, other);
                self.session.forget();
                Ok(false)
            }
        }
    }

    async fn open(&self, endpoint: PrimaryEndpoint) -> Result<Connection> {
        let address = endpoint.client_addr();
        let stream = tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect(address))
            .await
            .map_err(|_| Error::ConnectionTimeout(address.to_string()))?
            .map_err(|e| Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        let (mut reader, writer) = stream.into_split();
        let (tx, responses) = mpsc::channel(8);
        let events = self.events.clone();

        let reader = tokio::spawn(async move {
            loop {
                match read_frame::<_, ServerFrame>(&mut reader).await {
                    Ok(ServerFrame::Response(response)) => {
                        if tx.send(response).await.is_err() {
                            break;
                        }
                    }
                    Ok(ServerFrame::Notification(Notification::Keepalive)) => {
                        tracing::trace!("Keepalive from {}", address);
                    }
                    Ok(ServerFrame::Notification(notification)) => {
                        let _ = events.send(ClientEvent::Notification(notification));
                    }
                    Err(e) => {
                        tracing::debug!("Reader for {} stopped: {}", address, e);
                        break;
                    }
                }
            }
        });

        Ok(Connection {
            endpoint,
            writer,
            responses,
            reader,
        })
    }
}
