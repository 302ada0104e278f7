//! Bootstrap Transfer
//!
//! Full-state copy of the primary's store to a joining backup. The primary
//! streams the raw database file until EOF while holding the store lock;
//! the backup writes it next to its own store and swaps it in.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::shared::NodeCore;
use super::NodeRole;
use crate::error::{Error, Result};
use crate::replication::{PrimaryEndpoint, Version};
use crate::store::Store;

const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Serve snapshot requests until `shutdown` fires
pub async fn serve_transfers(core: Arc<NodeCore>, listener: TcpListener, shutdown: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(a) => a,
                Err(e) => {
                    tracing::error!("Transfer accept error: {}", e);
                    continue;
                }
            },
        };

        let core = Arc::clone(&core);
        tokio::spawn(async move {
            match send_snapshot(&core, stream).await {
                Ok(bytes) => tracing::info!("Sent {} byte snapshot to {}", bytes, peer),
                Err(e) => tracing::warn!("Snapshot transfer to {} failed: {}", peer, e),
            }
        });
    }
}

/// Stream the store file to one backup
pub async fn send_snapshot(core: &NodeCore, mut stream: TcpStream) -> Result<u64> {
    if core.role() != NodeRole::Primary {
        return Err(Error::NotPrimary);
    }

    // Writers are blocked until the transfer is complete
    let guard = core.store().lock().await;
    core.mailbox().wait_vacant(core.write_wait()).await?;
    let version = guard.version()?;

    let mut file = tokio::fs::File::open(guard.snapshot_path()).await?;
    let bytes = tokio::io::copy(&mut file, &mut stream).await?;
    stream.shutdown().await?;
    drop(guard);

    tracing::debug!("Snapshot at v{} complete", version);
    Ok(bytes)
}

/// Download the primary's store and install it locally.
///
/// `timeout` bounds the connect and every read; a primary that goes quiet
/// mid-transfer fails the attempt.
pub async fn fetch_snapshot(primary: &PrimaryEndpoint, store: &Store, timeout: Duration) -> Result<Version> {
    let address = primary.transfer_addr();
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| Error::ConnectionTimeout(address.to_string()))?
        .map_err(|e| Error::ConnectionFailed {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

    let incoming = incoming_path(store);
    let received = match receive(stream, &incoming, timeout).await {
        Ok(bytes) => check_snapshot(&incoming, bytes).await.map(|_| bytes),
        Err(e) => Err(e),
    };
    let bytes = match received {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = tokio::fs::remove_file(&incoming).await;
            return Err(e);
        }
    };

    tracing::info!("Received {} byte snapshot from {}", bytes, address);
    let restored = store.restore_from(&incoming).await;
    if restored.is_err() && incoming.exists() {
        let _ = tokio::fs::remove_file(&incoming).await;
    }
    restored
}

/// Copy the stream into `path` until EOF, failing when a read stalls
async fn receive(mut stream: TcpStream, path: &Path, idle: Duration) -> Result<u64> {
    let peer = stream.peer_addr()?;
    let mut file = tokio::fs::File::create(path).await?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;

    loop {
        let n = tokio::time::timeout(idle, stream.read(&mut buf))
            .await
            .map_err(|_| Error::ConnectionTimeout(format!("{} (snapshot stalled after {} bytes)", peer, total)))??;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    file.sync_all().await?;
    Ok(total)
}

fn incoming_path(store: &Store) -> PathBuf {
    let mut name = store.path().as_os_str().to_os_string();
    name.push(".incoming");
    PathBuf::from(name)
}

async fn check_snapshot(path: &Path, bytes: u64) -> Result<()> {
    if bytes < SQLITE_MAGIC.len() as u64 {
        return Err(Error::Bootstrap(format!("snapshot of {} bytes is truncated", bytes)));
    }

    let mut header = [0u8; 16];
    tokio::fs::File::open(path).await?.read_exact(&mut header).await?;
    if &header != SQLITE_MAGIC {
        return Err(Error::Bootstrap("snapshot is not a database file".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quiz::{self, Request, Response, Role, Session};
    use crate::replication::ReplicationMailbox;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::TempDir;

    fn node(dir: &TempDir, name: &str) -> Arc<NodeCore> {
        let store = Arc::new(Store::open(dir.path().join(name), quiz::SCHEMA).unwrap());
        Arc::new(NodeCore::new(
            store,
            Arc::new(ReplicationMailbox::new(0)),
            0,
            0,
            Duration::from_secs(1),
        ))
    }

    async fn start_transfers(core: Arc<NodeCore>) -> (PrimaryEndpoint, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = PrimaryEndpoint {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            client_port: 0,
            transfer_port: listener.local_addr().unwrap().port(),
        };
        let shutdown = CancellationToken::new();
        tokio::spawn(serve_transfers(core, listener, shutdown.clone()));
        (endpoint, shutdown)
    }

    #[tokio::test]
    async fn test_backup_receives_primary_state() {
        let dir = TempDir::new().unwrap();
        let primary = node(&dir, "primary.db");
        primary.activate_primary().await.unwrap();

        let response = primary
            .execute(
                &mut Session::default(),
                Request::SignUp {
                    username: "ana".into(),
                    password: "pw".into(),
                    role: Role::Instructor,
                },
            )
            .await;
        assert!(!response.is_failure());
        // The heartbeat sender would normally drain this
        primary.mailbox().drain().await;

        let (endpoint, shutdown) = start_transfers(Arc::clone(&primary)).await;
        let backup = Store::open(dir.path().join("backup.db"), quiz::SCHEMA).unwrap();

        let version = fetch_snapshot(&endpoint, &backup, Duration::from_secs(2)).await.unwrap();
        assert_eq!(version, 1);

        let mut guard = backup.lock().await;
        let (response, _) = quiz::apply(
            &mut guard,
            &mut Session::default(),
            Request::Login {
                username: "ana".into(),
                password: "pw".into(),
            },
        );
        assert!(matches!(response, Response::LoggedIn { .. }));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_stalled_transfer_times_out() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = PrimaryEndpoint {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            client_port: 0,
            transfer_port: listener.local_addr().unwrap().port(),
        };

        // Sends the start of a file, then goes quiet with the socket open
        let stalled = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(&[0u8; 24]).await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let backup = Store::open(dir.path().join("backup.db"), quiz::SCHEMA).unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(3),
            fetch_snapshot(&endpoint, &backup, Duration::from_millis(500)),
        )
        .await
        .expect("transfer must not block past its timeout");

        match result {
            Err(e) => assert!(e.is_retryable(), "unexpected error {}", e),
            Ok(v) => panic!("stalled transfer produced v{}", v),
        }
        assert!(!incoming_path(&backup).exists());
        assert_eq!(backup.version().await.unwrap(), 0);

        stalled.abort();
    }

    #[tokio::test]
    async fn test_backup_refuses_to_serve_snapshots() {
        let dir = TempDir::new().unwrap();
        let not_primary = node(&dir, "other.db");
        not_primary.set_role(NodeRole::Backup);

        let (endpoint, shutdown) = start_transfers(not_primary).await;
        let backup = Store::open(dir.path().join("backup.db"), quiz::SCHEMA).unwrap();

        let result = fetch_snapshot(&endpoint, &backup, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(Error::Bootstrap(_))));
        assert_eq!(backup.version().await.unwrap(), 0);

        shutdown.cancel();
    }
}
