//! Node Core
//!
//! State shared by every task of a data node: the store, the replication
//! mailbox, the current role, and the fault and notification channels.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::NodeRole;
use crate::error::Result;
use crate::quiz::{self, FailureCode, Notification, Request, Response, Session};
use crate::replication::{Fault, ReplicaHost, ReplicaLogEntry, ReplicationMailbox, Version};
use crate::store::Store;

/// Running multicast listener of a backup
pub(crate) struct ListenerTask {
    pub cancel: CancellationToken,
    pub task: JoinHandle<Result<()>>,
}

/// Shared state of one data node
pub struct NodeCore {
    store: Arc<Store>,
    mailbox: Arc<ReplicationMailbox>,
    role: watch::Sender<NodeRole>,
    faults: watch::Sender<Option<Fault>>,
    notifications: broadcast::Sender<Notification>,
    /// Backup only; taken on promotion
    listener: Mutex<Option<ListenerTask>>,
    client_port: u16,
    transfer_port: u16,
    /// Longest a write waits for the mailbox to drain
    write_wait: Duration,
}

impl NodeCore {
    pub fn new(store: Arc<Store>, mailbox: Arc<ReplicationMailbox>, client_port: u16, transfer_port: u16, write_wait: Duration) -> Self {
        let (role, _) = watch::channel(NodeRole::Unregistered);
        let (faults, _) = watch::channel(None);
        let (notifications, _) = broadcast::channel(16);

        Self {
            store,
            mailbox,
            role,
            faults,
            notifications,
            listener: Mutex::new(None),
            client_port,
            transfer_port,
            write_wait,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn mailbox(&self) -> &Arc<ReplicationMailbox> {
        &self.mailbox
    }

    pub fn write_wait(&self) -> Duration {
        self.write_wait
    }

    /// Current role
    pub fn role(&self) -> NodeRole {
        *self.role.borrow()
    }

    /// Watch role changes
    pub fn subscribe_role(&self) -> watch::Receiver<NodeRole> {
        self.role.subscribe()
    }

    /// Watch for a terminal fault
    pub fn subscribe_faults(&self) -> watch::Receiver<Option<Fault>> {
        self.faults.subscribe()
    }

    /// Receive client notifications
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub(crate) fn set_role(&self, role: NodeRole) {
        let previous = self.role.send_replace(role);
        if previous != role {
            tracing::info!("Node role {} -> {}", previous, role);
        }
    }

    /// Become primary right after registration
    pub(crate) async fn activate_primary(&self) -> Result<()> {
        let guard = self.store.lock().await;
        let version = guard.version()?;
        self.mailbox.reset(version).await;
        self.set_role(NodeRole::Primary);
        tracing::info!("Serving as PRIMARY at v{}", version);
        Ok(())
    }

    pub(crate) async fn attach_listener(&self, listener: ListenerTask) {
        *self.listener.lock().await = Some(listener);
    }

    /// Handle one client request on this node
    pub async fn execute(&self, session: &mut Session, request: Request) -> Response {
        let kind = request.type_name();
        let mut guard = self.store.lock().await;

        if request.is_mutation() {
            match self.role() {
                NodeRole::Primary => {}
                role => {
                    return Response::failure(FailureCode::NotPrimary, format!("this node is {}", role));
                }
            }

            if let Err(e) = self.mailbox.wait_vacant(self.write_wait).await {
                tracing::warn!("{} rejected: {}", kind, e);
                return Response::failure(FailureCode::Unavailable, e.to_string());
            }
        }

        let (response, entry) = quiz::apply(&mut guard, session, request);

        if let Some(entry) = entry {
            let version = entry.version;
            if let Err(e) = self.mailbox.post(entry).await {
                // Committed but unpublishable: the stream can no longer be trusted
                tracing::error!("{} committed v{} but could not be published: {}", kind, version, e);
                let published = self.mailbox.published_version().await;
                self.fault(Fault::Desynchronized {
                    local: version,
                    remote: published,
                });
                return Response::failure(FailureCode::Internal, e.to_string());
            }
            tracing::debug!("{} committed v{}", kind, version);
        }

        response
    }
}

#[async_trait::async_trait]
impl ReplicaHost for NodeCore {
    fn client_port(&self) -> u16 {
        self.client_port
    }

    fn transfer_port(&self) -> u16 {
        self.transfer_port
    }

    fn is_primary(&self) -> bool {
        self.role() == NodeRole::Primary
    }

    async fn local_version(&self) -> Result<Version> {
        self.store.version().await
    }

    async fn apply_replica(&self, entry: &ReplicaLogEntry) -> Result<()> {
        self.store.replay(entry).await
    }

    async fn promote(&self) {
        let mut listener = self.listener.lock().await;
        if self.role() != NodeRole::Backup {
            return;
        }

        // No replicated entry may land after the version is read
        if let Some(running) = listener.take() {
            running.cancel.cancel();
            match running.task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Multicast listener ended with: {}", e),
                Err(e) => tracing::warn!("Multicast listener task failed: {}", e),
            }
        }

        let guard = self.store.lock().await;
        let version = match guard.version() {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Cannot promote, store unreadable: {}", e);
                return;
            }
        };
        self.mailbox.reset(version).await;
        self.set_role(NodeRole::Primary);
        drop(guard);

        tracing::warn!("Promoted to PRIMARY at v{}", version);
        let _ = self.notifications.send(Notification::PrimaryRestored);
    }

    fn fault(&self, fault: Fault) {
        let raised = self.faults.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(fault.clone());
            true
        });

        if raised {
            tracing::error!("Node fault: {}", fault);
            self.set_role(NodeRole::Faulted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quiz::Role;
    use tempfile::TempDir;

    fn core(dir: &TempDir) -> NodeCore {
        let store = Arc::new(Store::open(dir.path().join("node.db"), quiz::SCHEMA).unwrap());
        NodeCore::new(store, Arc::new(ReplicationMailbox::new(0)), 7000, 7001, Duration::from_millis(200))
    }

    fn sign_up(name: &str) -> Request {
        Request::SignUp {
            username: name.into(),
            password: "pw".into(),
            role: Role::Student,
        }
    }

    #[tokio::test]
    async fn test_backup_rejects_mutations() {
        let dir = TempDir::new().unwrap();
        let node = core(&dir);
        node.set_role(NodeRole::Backup);

        let response = node.execute(&mut Session::default(), sign_up("ana")).await;
        assert!(matches!(response, Response::Failure { code: FailureCode::NotPrimary, .. }));

        // Reads are still served
        let response = node.execute(&mut Session::default(), Request::Ping).await;
        assert_eq!(response, Response::Pong { version: 0 });
    }

    #[tokio::test]
    async fn test_primary_posts_committed_entry() {
        let dir = TempDir::new().unwrap();
        let node = core(&dir);
        node.activate_primary().await.unwrap();

        let response = node.execute(&mut Session::default(), sign_up("ana")).await;
        assert_eq!(response, Response::SignedUp { user_id: 1 });

        let (entry, version) = node.mailbox().drain().await;
        assert_eq!(entry.unwrap().version, 1);
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn test_undrained_mailbox_stalls_writes() {
        let dir = TempDir::new().unwrap();
        let node = core(&dir);
        node.activate_primary().await.unwrap();

        node.execute(&mut Session::default(), sign_up("ana")).await;
        let response = node.execute(&mut Session::default(), sign_up("bo")).await;
        assert!(matches!(response, Response::Failure { code: FailureCode::Unavailable, .. }));
        assert_eq!(node.store().version().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_promotion_stops_listener_and_notifies() {
        let dir = TempDir::new().unwrap();
        let node = Arc::new(core(&dir));
        node.set_role(NodeRole::Backup);
        node.store().lock().await.commit(vec![]).unwrap();

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            token.cancelled().await;
            Ok::<(), crate::Error>(())
        });
        node.attach_listener(ListenerTask { cancel: cancel.clone(), task }).await;

        let mut notifications = node.subscribe_notifications();
        node.promote().await;
        node.promote().await;

        assert!(cancel.is_cancelled());
        assert!(node.is_primary());
        assert_eq!(node.mailbox().published_version().await, 1);
        assert_eq!(notifications.recv().await.unwrap(), Notification::PrimaryRestored);
        assert!(notifications.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_first_fault_wins() {
        let dir = TempDir::new().unwrap();
        let node = core(&dir);
        let faults = node.subscribe_faults();

        node.fault(Fault::Desynchronized { local: 1, remote: 3 });
        node.fault(Fault::Desynchronized { local: 2, remote: 9 });

        assert_eq!(node.role(), NodeRole::Faulted);
        assert_eq!(*faults.borrow(), Some(Fault::Desynchronized { local: 1, remote: 3 }));
    }
}
