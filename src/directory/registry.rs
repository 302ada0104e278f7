//! Node Registry
//!
//! The directory's view of the cluster: one record per data node, keyed by
//! (source address, client port). At most one record is primary.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::replication::{DirectoryResponse, HeartbeatMessage, PrimaryEndpoint, Version};

/// Identity of a data node as seen by the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub address: IpAddr,
    pub client_port: u16,
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.address {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.client_port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.client_port),
        }
    }
}

/// Directory record of one data node
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub key: NodeKey,
    pub transfer_port: u16,
    /// Last registration or heartbeat
    pub last_heartbeat: Instant,
    /// Last version the node reported
    pub version: Version,
    pub is_primary: bool,
    /// Registration instant (promotion tie-break)
    pub registered: Instant,
    /// Registration wall-clock time (status display)
    pub registered_at: chrono::DateTime<chrono::Utc>,
}

impl NodeRecord {
    fn endpoint(&self) -> PrimaryEndpoint {
        PrimaryEndpoint {
            address: self.key.address,
            client_port: self.key.client_port,
            transfer_port: self.transfer_port,
        }
    }

    /// Has the node been silent for longer than `timeout`?
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat) > timeout
    }
}

/// Outcome of one liveness sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Sweep {
    /// Records removed for silence
    pub removed: Vec<NodeKey>,
    /// Backup promoted to replace a removed primary
    pub promoted: Option<NodeKey>,
}

/// Serializable view of one record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub address: IpAddr,
    pub client_port: u16,
    pub transfer_port: u16,
    pub version: Version,
    pub role: String,
    pub heartbeat_age_ms: u64,
    pub registered_at: chrono::DateTime<chrono::Utc>,
}

/// Serializable view of the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub primary: Option<PrimaryEndpoint>,
    pub nodes: Vec<NodeStatus>,
}

/// Registry of live data nodes
pub struct Registry {
    nodes: HashMap<NodeKey, NodeRecord>,
    timeout: Duration,
}

impl Registry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            nodes: HashMap::new(),
            timeout,
        }
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, key: &NodeKey) -> Option<&NodeRecord> {
        self.nodes.get(key)
    }

    /// Current primary endpoint
    pub fn primary(&self) -> Option<PrimaryEndpoint> {
        self.nodes.values().find(|r| r.is_primary).map(NodeRecord::endpoint)
    }

    fn response(&self, observed: IpAddr, registered: bool) -> DirectoryResponse {
        DirectoryResponse {
            primary: self.primary(),
            registered,
            observed_address: observed,
        }
    }

    /// Register a node. A known key only has its timestamp refreshed.
    pub fn register(&mut self, key: NodeKey, transfer_port: u16, now: Instant) -> DirectoryResponse {
        if let Some(record) = self.nodes.get_mut(&key) {
            record.last_heartbeat = now;
            tracing::debug!("Node {} re-registered", key);
            return self.response(key.address, true);
        }

        let is_primary = self.primary().is_none();
        self.nodes.insert(
            key,
            NodeRecord {
                key,
                transfer_port,
                last_heartbeat: now,
                version: 0,
                is_primary,
                registered: now,
                registered_at: chrono::Utc::now(),
            },
        );

        tracing::info!(
            "Registered node {} (transfer port {}) as {}",
            key,
            transfer_port,
            if is_primary { "PRIMARY" } else { "BACKUP" }
        );
        self.response(key.address, true)
    }

    /// Record a heartbeat. Heartbeats from unknown keys change nothing.
    pub fn heartbeat(&mut self, key: NodeKey, message: &HeartbeatMessage, now: Instant) -> DirectoryResponse {
        match self.nodes.get_mut(&key) {
            Some(record) => {
                record.last_heartbeat = now;
                record.version = message.version;
                tracing::trace!("Heartbeat from {} at v{}", key, message.version);
                self.response(key.address, true)
            }
            None => {
                tracing::debug!("Heartbeat from unknown node {}", key);
                self.response(key.address, false)
            }
        }
    }

    /// Answer a discovery query
    pub fn discover(&self, observed: IpAddr) -> DirectoryResponse {
        self.response(observed, false)
    }

    /// Remove silent nodes and make sure a primary exists if any node is left.
    ///
    /// The replacement is the backup with the highest reported version, then
    /// the earliest registration, then the lowest key.
    pub fn sweep(&mut self, now: Instant) -> Sweep {
        let timeout = self.timeout;
        let mut removed: Vec<NodeKey> = self
            .nodes
            .values()
            .filter(|r| r.is_expired(now, timeout))
            .map(|r| r.key)
            .collect();
        removed.sort();

        for key in &removed {
            if let Some(record) = self.nodes.remove(key) {
                tracing::warn!(
                    "Node {} timed out at v{}{}",
                    key,
                    record.version,
                    if record.is_primary { " (was PRIMARY)" } else { "" }
                );
            }
        }

        let mut promoted = None;
        if self.primary().is_none() {
            let best = self
                .nodes
                .values_mut()
                .min_by(|a, b| {
                    b.version
                        .cmp(&a.version)
                        .then(a.registered.cmp(&b.registered))
                        .then(a.key.cmp(&b.key))
                });

            if let Some(record) = best {
                record.is_primary = true;
                tracing::warn!("Promoted {} to PRIMARY at v{}", record.key, record.version);
                promoted = Some(record.key);
            } else if !removed.is_empty() {
                tracing::warn!("No backup left; no server available until a node registers");
            }
        }

        Sweep { removed, promoted }
    }

    /// Status view ordered by key
    pub fn snapshot(&self, now: Instant) -> RegistrySnapshot {
        let mut nodes: Vec<NodeStatus> = self
            .nodes
            .values()
            .map(|r| NodeStatus {
                address: r.key.address,
                client_port: r.key.client_port,
                transfer_port: r.transfer_port,
                version: r.version,
                role: if r.is_primary { "PRIMARY" } else { "BACKUP" }.to_string(),
                heartbeat_age_ms: now.saturating_duration_since(r.last_heartbeat).as_millis() as u64,
                registered_at: r.registered_at,
            })
            .collect();
        nodes.sort_by_key(|n| (n.address, n.client_port));

        RegistrySnapshot {
            primary: self.primary(),
            nodes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::net::Ipv4Addr;

    const TIMEOUT: Duration = Duration::from_secs(17);

    fn key(host: u8, port: u16) -> NodeKey {
        NodeKey {
            address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, host)),
            client_port: port,
        }
    }

    fn beat(version: Version) -> HeartbeatMessage {
        HeartbeatMessage {
            version,
            client_port: 0,
            transfer_port: 0,
            mutation: None,
        }
    }

    fn primaries(registry: &Registry) -> usize {
        registry.nodes.values().filter(|r| r.is_primary).count()
    }

    #[test]
    fn test_first_node_is_primary() {
        let mut registry = Registry::new(TIMEOUT);
        let now = Instant::now();

        let a = registry.register(key(1, 5000), 5001, now);
        assert_eq!(a.primary.unwrap().client_port, 5000);
        assert!(a.names(5000));

        let b = registry.register(key(2, 5000), 5001, now);
        assert_eq!(b.primary.unwrap().address, key(1, 5000).address);
        assert!(!b.names(5000));
        assert_eq!(primaries(&registry), 1);
    }

    #[test]
    fn test_reregistration_only_refreshes() {
        let mut registry = Registry::new(TIMEOUT);
        let t0 = Instant::now();
        registry.register(key(1, 5000), 5001, t0);
        registry.heartbeat(key(1, 5000), &beat(4), t0);

        let later = t0 + Duration::from_secs(10);
        registry.register(key(1, 5000), 6001, later);

        let record = registry.get(&key(1, 5000)).unwrap();
        assert_eq!(record.transfer_port, 5001);
        assert_eq!(record.version, 4);
        assert_eq!(record.last_heartbeat, later);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_heartbeat_is_ignored() {
        let mut registry = Registry::new(TIMEOUT);
        let response = registry.heartbeat(key(9, 1), &beat(3), Instant::now());
        assert!(!response.registered);
        assert!(response.primary.is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_timeout_promotes_highest_version() {
        let mut registry = Registry::new(TIMEOUT);
        let t0 = Instant::now();
        registry.register(key(1, 5000), 5001, t0);
        registry.register(key(2, 5000), 5001, t0);
        registry.register(key(3, 5000), 5001, t0);

        let t1 = t0 + Duration::from_secs(10);
        registry.heartbeat(key(2, 5000), &beat(6), t1);
        registry.heartbeat(key(3, 5000), &beat(7), t1);

        let sweep = registry.sweep(t0 + Duration::from_secs(18));
        assert_eq!(sweep.removed, vec![key(1, 5000)]);
        assert_eq!(sweep.promoted, Some(key(3, 5000)));
        assert_eq!(registry.primary().unwrap().address, key(3, 5000).address);
    }

    #[test]
    fn test_tie_break_prefers_earliest_registration() {
        let mut registry = Registry::new(TIMEOUT);
        let t0 = Instant::now();
        registry.register(key(1, 5000), 5001, t0);
        registry.register(key(3, 5000), 5001, t0 + Duration::from_secs(1));
        registry.register(key(2, 5000), 5001, t0 + Duration::from_secs(2));

        let t1 = t0 + Duration::from_secs(10);
        registry.heartbeat(key(2, 5000), &beat(5), t1);
        registry.heartbeat(key(3, 5000), &beat(5), t1);

        let sweep = registry.sweep(t0 + Duration::from_secs(20));
        assert_eq!(sweep.promoted, Some(key(3, 5000)));
    }

    #[test]
    fn test_tie_break_falls_back_to_lowest_key() {
        let mut registry = Registry::new(TIMEOUT);
        let t0 = Instant::now();
        registry.register(key(1, 5000), 5001, t0);
        registry.register(key(4, 5000), 5001, t0);
        registry.register(key(4, 4000), 4001, t0);

        let t1 = t0 + Duration::from_secs(10);
        registry.heartbeat(key(4, 5000), &beat(2), t1);
        registry.heartbeat(key(4, 4000), &beat(2), t1);

        let sweep = registry.sweep(t0 + Duration::from_secs(20));
        assert_eq!(sweep.promoted, Some(key(4, 4000)));
    }

    #[test]
    fn test_no_backup_means_no_server() {
        let mut registry = Registry::new(TIMEOUT);
        let t0 = Instant::now();
        registry.register(key(1, 5000), 5001, t0);

        let sweep = registry.sweep(t0 + Duration::from_secs(18));
        assert_eq!(sweep.promoted, None);
        assert!(registry.discover(key(7, 1).address).primary.is_none());

        // The next registrant becomes primary
        let response = registry.register(key(2, 5000), 5001, t0 + Duration::from_secs(19));
        assert!(response.names(5000));
    }

    #[test]
    fn test_snapshot_lists_roles() {
        let mut registry = Registry::new(TIMEOUT);
        let now = Instant::now();
        registry.register(key(2, 5000), 5001, now);
        registry.register(key(1, 5000), 5001, now);

        let snapshot = registry.snapshot(now);
        assert_eq!(snapshot.nodes.len(), 2);
        assert_eq!(snapshot.nodes[0].role, "BACKUP");
        assert_eq!(snapshot.nodes[1].role, "PRIMARY");
        assert_eq!(snapshot.primary.unwrap().address, key(2, 5000).address);
    }

    #[test]
    fn test_single_primary_over_random_operations() {
        let mut rng = rand::thread_rng();

        for _ in 0..100 {
            let mut registry = Registry::new(TIMEOUT);
            let mut now = Instant::now();

            for _ in 0..200 {
                let k = key(rng.gen_range(1..5), 5000 + rng.gen_range(0..2));
                match rng.gen_range(0..4) {
                    0 => {
                        registry.register(k, 1, now);
                    }
                    1 => {
                        registry.heartbeat(k, &beat(rng.gen_range(0..20)), now);
                    }
                    2 => now += Duration::from_secs(rng.gen_range(0..10)),
                    _ => {
                        let best = registry
                            .nodes
                            .values()
                            .filter(|r| !r.is_expired(now, TIMEOUT))
                            .map(|r| r.version)
                            .max();
                        let had_primary = registry
                            .nodes
                            .values()
                            .any(|r| r.is_primary && !r.is_expired(now, TIMEOUT));

                        let sweep = registry.sweep(now);
                        if let Some(promoted) = sweep.promoted {
                            assert!(!had_primary);
                            assert_eq!(Some(registry.get(&promoted).unwrap().version), best);
                        }
                        if !registry.is_empty() {
                            assert_eq!(primaries(&registry), 1);
                        }
                    }
                }
                assert!(primaries(&registry) <= 1);
            }
        }
    }
}
