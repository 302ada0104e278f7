//! Replication Mailbox
//!
//! One-slot hand-off between the primary's write path and the heartbeat
//! sender. The write path posts the entry of the mutation it just committed;
//! the next heartbeat tick drains it and broadcasts it.

use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use super::protocol::ReplicaLogEntry;
use super::Version;
use crate::error::{Error, Result};

struct Slot {
    pending: Option<ReplicaLogEntry>,
    /// Version of the last entry handed to the heartbeat sender
    published: Version,
}

/// One-slot mailbox for the next pending mutation
pub struct ReplicationMailbox {
    slot: Mutex<Slot>,
    drained: Notify,
}

impl ReplicationMailbox {
    /// Create an empty mailbox whose stream starts after `version`
    pub fn new(version: Version) -> Self {
        Self {
            slot: Mutex::new(Slot {
                pending: None,
                published: version,
            }),
            drained: Notify::new(),
        }
    }

    /// Restart the stream at `version` (on promotion); drops any stale entry
    pub async fn reset(&self, version: Version) {
        let mut slot = self.slot.lock().await;
        slot.pending = None;
        slot.published = version;
        self.drained.notify_waiters();
    }

    /// Version of the newest entry handed out (or the reset point)
    pub async fn published_version(&self) -> Version {
        self.slot.lock().await.published
    }

    /// Is a mutation waiting for the next tick?
    pub async fn is_occupied(&self) -> bool {
        self.slot.lock().await.pending.is_some()
    }

    /// Wait until the slot is empty, at most `limit`
    pub async fn wait_vacant(&self, limit: Duration) -> Result<()> {
        let wait = async {
            loop {
                let notified = self.drained.notified();
                if self.slot.lock().await.pending.is_none() {
                    return;
                }
                notified.await;
            }
        };

        tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| Error::Replication("replication stalled: pending mutation was not drained".into()))
    }

    /// Post the entry of a freshly committed mutation.
    ///
    /// The entry must continue the stream (`published + 1`) and the slot must
    /// be vacant; callers hold the node write lock and called `wait_vacant`.
    pub async fn post(&self, entry: ReplicaLogEntry) -> Result<()> {
        let mut slot = self.slot.lock().await;
        if let Some(ref pending) = slot.pending {
            return Err(Error::Replication(format!(
                "mailbox occupied by version {}, refusing version {}",
                pending.version, entry.version
            )));
        }
        if entry.version != slot.published + 1 {
            return Err(Error::Replication(format!(
                "entry version {} does not follow published version {}",
                entry.version, slot.published
            )));
        }
        slot.pending = Some(entry);
        Ok(())
    }

    /// Take the pending entry, if any, together with the version to report.
    pub async fn drain(&self) -> (Option<ReplicaLogEntry>, Version) {
        let mut slot = self.slot.lock().await;
        let entry = slot.pending.take();
        if let Some(ref e) = entry {
            slot.published = e.version;
        }
        let version = slot.published;
        drop(slot);

        if entry.is_some() {
            self.drained.notify_waiters();
        }
        (entry, version)
    }
}
