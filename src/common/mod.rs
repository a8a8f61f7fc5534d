//! Common utilities and types shared across minimeta

pub mod api;
pub mod config;
pub mod error;
pub mod identity;
pub mod meta;
pub mod metrics;
pub mod raft;
pub mod resources;
pub mod tracing_middleware;
pub mod utils;

pub use config::{ClientConfig, Config, ReadPolicy, ServerConfig, WalSyncPolicy};
pub use error::{Error, ErrorBody, ErrorKind, Result};
pub use identity::ClusterNodeIdentity;
pub use meta::{attrs, keys, AttrMap, MetaEntries, MetaNamespace, MetaValue};
pub use utils::{crc32, find_available_port, timestamp_now_millis};
