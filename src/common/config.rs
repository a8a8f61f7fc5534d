//! Configuration for minimeta components

use crate::common::identity::parse_peer_addr;
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server node config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,

    /// Client agent config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientConfig>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load from an optional TOML file, overridden by `MINIMETA__*` env vars
    /// (e.g. `MINIMETA__SERVER__BIND_ADDR=0.0.0.0:6000`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("MINIMETA")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("server.peers")
                    .with_list_parse_key("client.servers")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

/// Durability of consensus log writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalSyncPolicy {
    /// fsync after every write
    #[default]
    Always,
    /// flush to the OS, let it sync
    Interval,
    /// buffer only (tests)
    Never,
}

/// Where metadata reads are served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadPolicy {
    /// Any node answers from its local replica (may be stale)
    #[default]
    Local,
    /// Only the leader answers; followers redirect
    Leader,
}

/// Server node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the cluster RPC surface (port 0 picks a free port)
    pub bind_addr: SocketAddr,

    /// Host advertised to peers when binding an unspecified address
    #[serde(default)]
    pub advertise_host: Option<String>,

    /// Voting members (host:port). Empty means a single-node cluster.
    #[serde(default)]
    pub peers: Vec<String>,

    /// Directory for the consensus log, hard state and snapshots
    pub data_dir: PathBuf,

    /// Raft election timeout (randomized up to twice this)
    #[serde(default = "default_election_timeout")]
    pub election_timeout_ms: u64,

    /// Raft heartbeat interval
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Applied entries between snapshots
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,

    #[serde(default)]
    pub wal_sync: WalSyncPolicy,

    /// Budget for a proposal to commit
    #[serde(default = "default_propose_timeout")]
    pub propose_timeout_ms: u64,

    /// Timeout of a single peer RPC
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,

    /// Interval between publications of this node's SERVER_META entry
    #[serde(default = "default_publish_interval")]
    pub meta_publish_interval_ms: u64,

    /// Heartbeat staleness after which an entity is evicted
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,

    /// Interval between heartbeat monitor scans
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_ms: u64,

    #[serde(default)]
    pub read_policy: ReadPolicy,

    /// Bounded wait for read-after-write queries
    #[serde(default = "default_read_wait")]
    pub read_wait_ms: u64,

    /// Serve a stale read when the read-after-write wait expires
    #[serde(default = "default_stale_read_fallback")]
    pub stale_read_fallback: bool,
}

fn default_election_timeout() -> u64 {
    300
}
fn default_heartbeat_interval() -> u64 {
    50
}
fn default_snapshot_threshold() -> u64 {
    1_000
}
fn default_propose_timeout() -> u64 {
    3_000
}
fn default_rpc_timeout() -> u64 {
    250
}
fn default_publish_interval() -> u64 {
    3_000
}
fn default_heartbeat_timeout() -> u64 {
    20_000
}
fn default_monitor_interval() -> u64 {
    1_000
}
fn default_read_wait() -> u64 {
    1_000
}
fn default_stale_read_fallback() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 6000)),
            advertise_host: None,
            peers: Vec::new(),
            data_dir: PathBuf::from("./meta-data"),
            election_timeout_ms: default_election_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            snapshot_threshold: default_snapshot_threshold(),
            wal_sync: WalSyncPolicy::default(),
            propose_timeout_ms: default_propose_timeout(),
            rpc_timeout_ms: default_rpc_timeout(),
            meta_publish_interval_ms: default_publish_interval(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            monitor_interval_ms: default_monitor_interval(),
            read_policy: ReadPolicy::default(),
            read_wait_ms: default_read_wait(),
            stale_read_fallback: default_stale_read_fallback(),
        }
    }
}

impl ServerConfig {
    /// Reject settings the node cannot start with
    pub fn validate(&self) -> Result<()> {
        for peer in &self.peers {
            parse_peer_addr(peer)?;
        }
        if self.heartbeat_interval_ms == 0 || self.election_timeout_ms == 0 {
            return Err(Error::InvalidConfig("raft timers must be non-zero".into()));
        }
        if self.heartbeat_interval_ms >= self.election_timeout_ms {
            return Err(Error::InvalidConfig(format!(
                "heartbeat interval ({}ms) must be shorter than the election timeout ({}ms)",
                self.heartbeat_interval_ms, self.election_timeout_ms
            )));
        }
        if self.snapshot_threshold == 0 {
            return Err(Error::InvalidConfig("snapshot_threshold must be > 0".into()));
        }
        if self.heartbeat_timeout_ms <= self.meta_publish_interval_ms {
            return Err(Error::InvalidConfig(format!(
                "heartbeat timeout ({}ms) must exceed the publish interval ({}ms)",
                self.heartbeat_timeout_ms, self.meta_publish_interval_ms
            )));
        }
        Ok(())
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn propose_timeout(&self) -> Duration {
        Duration::from_millis(self.propose_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn meta_publish_interval(&self) -> Duration {
        Duration::from_millis(self.meta_publish_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn read_wait(&self) -> Duration {
        Duration::from_millis(self.read_wait_ms)
    }
}

/// Client agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server nodes to contact (host:port)
    pub servers: Vec<String>,

    /// Overall budget of one put/get call, retries included
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Attempts per call before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// First backoff delay; doubles per attempt
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Interval between heartbeats of a started agent
    #[serde(default = "default_client_heartbeat")]
    pub heartbeat_interval_ms: u64,
}

fn default_request_timeout() -> u64 {
    5_000
}
fn default_max_retries() -> usize {
    8
}
fn default_retry_backoff() -> u64 {
    50
}
fn default_client_heartbeat() -> u64 {
    3_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: vec!["127.0.0.1:6000".to_string()],
            request_timeout_ms: default_request_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
            heartbeat_interval_ms: default_client_heartbeat(),
        }
    }
}

impl ClientConfig {
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::InvalidConfig("no cluster servers configured".into()));
        }
        for server in &self.servers {
            parse_peer_addr(server)?;
        }
        if self.max_retries == 0 {
            return Err(Error::InvalidConfig("max_retries must be > 0".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}
