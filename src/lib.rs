//! # minimeta
//!
//! Raft-replicated cluster metadata for notebook servers and the
//! interpreter processes they launch:
//! - Raft consensus log with durable hard state and snapshots
//! - Replicated SERVER_META / PROCESS_META maps
//! - Heartbeat monitor evicting stale entries
//! - JSON over HTTP for peer and client traffic
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │            Server Cluster                  │
//! │  (Raft consensus for metadata)             │
//! │   - Leader: orders writes, evicts stale    │
//! │   - Followers: replicate, serve reads      │
//! └───────────┬────────────────────────────────┘
//!             │ HTTP/JSON
//!   ┌─────────┴──────────┬──────────────┐
//!   │                    │              │
//! ┌─▼──────────┐   ┌─────▼──────┐   ┌───▼────────┐
//! │ Process A  │   │ Process B  │   │ Process C  │
//! │ (client    │   │ (client    │   │ (client    │
//! │  agent)    │   │  agent)    │   │  agent)    │
//! └────────────┘   └────────────┘   └────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a server node
//! ```bash
//! minimeta-server serve \
//!   --bind 0.0.0.0:6000 \
//!   --data ./meta-data \
//!   --peers node-a:6000,node-b:6000,node-c:6000
//! ```
//!
//! ### Use the CLI
//! ```bash
//! minimeta --server localhost:6000 put PROCESS_META W1 cpu_used=10
//! minimeta --server localhost:6000 get PROCESS_META W1
//! minimeta --server localhost:6000 status
//! ```

#![allow(clippy::result_large_err)]

pub mod client;
pub mod common;
pub mod server;

// Re-export commonly used types
pub use client::ClusterClient;
pub use common::{ClientConfig, Config, Error, MetaNamespace, Result, ServerConfig};
pub use server::ClusterServer;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
