//! Cluster server node
//!
//! Components, leaves first:
//! - `raft_log`: durable log, hard state and snapshots
//! - `raft_node`: the consensus actor and its handle
//! - `metadata`: the replicated metadata store
//! - `heartbeat`: stale entry eviction on the leader
//! - `http`: the RPC surface
//! - `node`: wires everything into a running [`ClusterServer`]

pub mod heartbeat;
pub mod http;
#[cfg(any(test, feature = "test-util"))]
pub mod local_network;
pub mod metadata;
pub mod node;
pub mod raft_log;
pub mod raft_node;
pub mod raft_rpc_client;

pub use heartbeat::HeartbeatMonitor;
#[cfg(any(test, feature = "test-util"))]
pub use local_network::LocalNetwork;
pub use metadata::{MetaStateMachine, MetadataStore};
pub use node::ClusterServer;
pub use raft_node::{RaftHandle, RaftNode, RaftOptions, RaftRole, RaftStatus, StateMachine};
pub use raft_rpc_client::{HttpTransport, RaftTransport};
