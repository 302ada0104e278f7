//! Request Server
//!
//! TCP server for client sessions. Each connection gets its own task that
//! reads framed requests and answers them in order; a writer task owns the
//! socket's write half so notifications can be interleaved between
//! responses.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::shared::NodeCore;
use crate::error::Result;
use crate::network::{is_disconnect, read_frame, write_frame};
use crate::quiz::{Notification, Request, ServerFrame, Session};

/// Accept client sessions until `shutdown` fires
pub async fn serve_clients(
    core: Arc<NodeCore>,
    listener: TcpListener,
    keepalive: Option<Duration>,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(a) => a,
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                    continue;
                }
            },
        };

        let core = Arc::clone(&core);
        let session_shutdown = shutdown.child_token();
        tokio::spawn(async move {
            let id = Uuid::new_v4();
            tracing::debug!("Session {} opened from {}", id, peer);
            if let Err(e) = serve_session(core, stream, peer, keepalive, session_shutdown).await {
                tracing::warn!("Session {} from {} ended: {}", id, peer, e);
            } else {
                tracing::debug!("Session {} closed", id);
            }
        });
    }

    tracing::info!("Request server stopped");
}

async fn serve_session(
    core: Arc<NodeCore>,
    stream: TcpStream,
    peer: SocketAddr,
    keepalive: Option<Duration>,
    shutdown: CancellationToken,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel::<ServerFrame>(64);

    let writer_task = tokio::spawn(write_frames(writer, rx));
    let notify_task = tokio::spawn(forward_notifications(
        core.subscribe_notifications(),
        tx.clone(),
        keepalive,
    ));

    let mut session = Session::default();
    let result = loop {
        let request: Request = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break Ok(()),
            frame = read_frame(&mut reader) => match frame {
                Ok(request) => request,
                Err(e) if is_disconnect(&e) => break Ok(()),
                Err(e) => break Err(e),
            },
        };

        tracing::trace!("{} from {}", request.type_name(), peer);
        let response = core.execute(&mut session, request).await;

        if tx.send(ServerFrame::Response(response)).await.is_err() {
            // Writer is gone, so is the peer
            break Ok(());
        }
    };

    notify_task.abort();
    drop(tx);
    let _ = writer_task.await;
    result
}

async fn write_frames(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<ServerFrame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            tracing::debug!("Session write failed: {}", e);
            break;
        }
    }
}

async fn forward_notifications(
    mut notifications: broadcast::Receiver<Notification>,
    tx: mpsc::Sender<ServerFrame>,
    keepalive: Option<Duration>,
) {
    let mut ticker = keepalive.map(|period| {
        let mut t = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        t
    });

    loop {
        let notification = tokio::select! {
            received = notifications.recv() => match received {
                Ok(n) => n,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            },
            _ = async {
                match ticker.as_mut() {
                    Some(t) => {
                        t.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => Notification::Keepalive,
        };

        if tx.send(ServerFrame::Notification(notification)).await.is_err() {
            return;
        }
    }
}
