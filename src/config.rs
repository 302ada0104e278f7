//! QuizCluster Configuration
//!
//! Configuration structures for the directory service, data nodes and the
//! client connector. A single TOML file carries all sections; every field
//! has a default so a process only needs the sections relevant to its role.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Main QuizCluster configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Directory service configuration
    #[serde(default)]
    pub directory: DirectoryConfig,

    /// Data node configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Client connector configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Directory status API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Directory (rendezvous) service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// UDP address the directory listens on
    #[serde(default = "default_directory_bind")]
    pub bind_address: String,

    /// A node is dropped when its last heartbeat is older than this
    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,

    /// Liveness monitor period
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
}

/// Data node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Directory address (host:port)
    #[serde(default = "default_directory_address")]
    pub directory_address: String,

    /// SQLite store file
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Client-facing request listener
    #[serde(default = "default_client_bind")]
    pub client_bind_address: String,

    /// Bootstrap transfer listener
    #[serde(default = "default_transfer_bind")]
    pub transfer_bind_address: String,

    /// Multicast group shared by the whole cluster
    #[serde(default = "default_multicast_group")]
    pub multicast_group: Ipv4Addr,

    /// Multicast port shared by the whole cluster
    #[serde(default = "default_multicast_port")]
    pub multicast_port: u16,

    /// Local interface used to join the multicast group
    #[serde(default = "default_multicast_interface")]
    pub multicast_interface: Ipv4Addr,

    /// Heartbeat tick
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// How long a heartbeat waits for the directory's reply
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,

    /// Delay between registration attempts
    #[serde(default = "default_register_retry_ms")]
    pub register_retry_ms: u64,

    /// Bootstrap transfer attempts before giving up
    #[serde(default = "default_bootstrap_attempts")]
    pub bootstrap_attempts: u32,

    /// Keepalive notification period for connected clients (0 = off)
    #[serde(default = "default_client_keepalive_ms")]
    pub client_keepalive_ms: u64,
}

/// Client connector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Directory address (host:port)
    #[serde(default = "default_directory_address")]
    pub directory_address: String,

    /// Discovery reply timeout
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,

    /// Delay before retrying discovery after no answer or "no server"
    #[serde(default = "default_discovery_retry_ms")]
    pub discovery_retry_ms: u64,

    /// Backoff when discovery keeps returning the same unreachable primary
    #[serde(default = "default_same_primary_backoff_ms")]
    pub same_primary_backoff_ms: u64,

    /// TCP connect timeout
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Upper bound for one request/response exchange
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Directory status API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP status API on the directory
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_directory_bind() -> String {
    "0.0.0.0:4545".to_string()
}

fn default_node_timeout_ms() -> u64 {
    17_000
}

fn default_monitor_interval_ms() -> u64 {
    5_000
}

fn default_directory_address() -> String {
    "127.0.0.1:4545".to_string()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/quizcluster/quiz.db")
}

fn default_client_bind() -> String {
    "0.0.0.0:0".to_string()
}

fn default_transfer_bind() -> String {
    "0.0.0.0:0".to_string()
}

fn default_multicast_group() -> Ipv4Addr {
    Ipv4Addr::new(230, 30, 30, 30)
}

fn default_multicast_port() -> u16 {
    4446
}

fn default_multicast_interface() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_reply_timeout_ms() -> u64 {
    3_000
}

fn default_register_retry_ms() -> u64 {
    2_000
}

fn default_bootstrap_attempts() -> u32 {
    5
}

fn default_client_keepalive_ms() -> u64 {
    10_000
}

fn default_discovery_timeout_ms() -> u64 {
    5_000
}

fn default_discovery_retry_ms() -> u64 {
    2_000
}

fn default_same_primary_backoff_ms() -> u64 {
    20_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            bind_address: default_directory_bind(),
            node_timeout_ms: default_node_timeout_ms(),
            monitor_interval_ms: default_monitor_interval_ms(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            directory_address: default_directory_address(),
            store_path: default_store_path(),
            client_bind_address: default_client_bind(),
            transfer_bind_address: default_transfer_bind(),
            multicast_group: default_multicast_group(),
            multicast_port: default_multicast_port(),
            multicast_interface: default_multicast_interface(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            reply_timeout_ms: default_reply_timeout_ms(),
            register_retry_ms: default_register_retry_ms(),
            bootstrap_attempts: default_bootstrap_attempts(),
            client_keepalive_ms: default_client_keepalive_ms(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            directory_address: default_directory_address(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            discovery_retry_ms: default_discovery_retry_ms(),
            same_primary_backoff_ms: default_same_primary_backoff_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ClusterConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ClusterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: &std::path::Path) -> crate::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::debug!("No configuration at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.directory.node_timeout_ms == 0 {
            return Err(crate::Error::Config("directory.node_timeout_ms must be > 0".into()));
        }

        if self.directory.monitor_interval_ms == 0 {
            return Err(crate::Error::Config("directory.monitor_interval_ms must be > 0".into()));
        }

        if self.node.heartbeat_interval_ms == 0 {
            return Err(crate::Error::Config("node.heartbeat_interval_ms must be > 0".into()));
        }

        // A node must get at least two heartbeats in before it is considered dead
        if self.node.heartbeat_interval_ms * 2 > self.directory.node_timeout_ms {
            return Err(crate::Error::Config(format!(
                "node.heartbeat_interval_ms ({}) is too large for directory.node_timeout_ms ({})",
                self.node.heartbeat_interval_ms, self.directory.node_timeout_ms
            )));
        }

        if !self.node.multicast_group.is_multicast() {
            return Err(crate::Error::Config(format!(
                "node.multicast_group {} is not a multicast address",
                self.node.multicast_group
            )));
        }

        if self.node.store_path.as_os_str().is_empty() {
            return Err(crate::Error::Config("node.store_path cannot be empty".into()));
        }

        Ok(())
    }
}

impl DirectoryConfig {
    /// Get node timeout as Duration
    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    /// Get monitor period as Duration
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

impl NodeConfig {
    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Get directory reply timeout as Duration
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    /// Get registration retry delay as Duration
    pub fn register_retry(&self) -> Duration {
        Duration::from_millis(self.register_retry_ms)
    }

    /// Keepalive period for client sessions, if enabled
    pub fn client_keepalive(&self) -> Option<Duration> {
        (self.client_keepalive_ms > 0).then(|| Duration::from_millis(self.client_keepalive_ms))
    }

    /// Multicast destination for replication broadcasts
    pub fn multicast_target(&self) -> SocketAddr {
        SocketAddr::from((self.multicast_group, self.multicast_port))
    }
}

impl ClientConfig {
    /// Get discovery timeout as Duration
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    /// Get discovery retry delay as Duration
    pub fn discovery_retry(&self) -> Duration {
        Duration::from_millis(self.discovery_retry_ms)
    }

    /// Get same-primary backoff as Duration
    pub fn same_primary_backoff(&self) -> Duration {
        Duration::from_millis(self.same_primary_backoff_ms)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
