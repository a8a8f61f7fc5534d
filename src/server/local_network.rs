//! In-process Raft network
//!
//! Routes RPCs directly to registered [`RaftHandle`]s. Links can be cut per
//! node to simulate partitions and crashes in cluster tests. Built only for
//! unit tests and with the `test-util` feature.

use crate::common::raft::{
    AppendRequest, AppendResponse, NodeId, SnapshotRequest, SnapshotResponse, VoteRequest,
    VoteResponse,
};
use crate::common::{Error, Result};
use crate::server::raft_node::RaftHandle;
use crate::server::raft_rpc_client::RaftTransport;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<NodeId, RaftHandle>,
    /// Nodes cut off from everybody else
    isolated: HashSet<NodeId>,
}

#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: impl Into<NodeId>, handle: RaftHandle) {
        self.write().nodes.insert(id.into(), handle);
    }

    pub fn unregister(&self, id: &str) {
        self.write().nodes.remove(id);
    }

    pub fn isolate(&self, id: &str) {
        tracing::info!("Isolating {}", id);
        self.write().isolated.insert(id.to_string());
    }

    pub fn heal(&self, id: &str) {
        tracing::info!("Healing {}", id);
        self.write().isolated.remove(id);
    }

    pub fn heal_all(&self) {
        self.write().isolated.clear();
    }

    /// Transport sending on behalf of `source`
    pub fn transport_for(&self, source: impl Into<NodeId>) -> Arc<dyn RaftTransport> {
        Arc::new(LocalTransport {
            source: source.into(),
            network: self.clone(),
        })
    }

    fn route(&self, source: &NodeId, target: &NodeId) -> Result<RaftHandle> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        if state.isolated.contains(source) || state.isolated.contains(target) {
            return Err(Error::ConnectionFailed(format!(
                "link {} -> {} is down",
                source, target
            )));
        }
        state
            .nodes
            .get(target)
            .cloned()
            .ok_or_else(|| Error::ConnectionFailed(format!("{} is not reachable", target)))
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, NetworkState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct LocalTransport {
    source: NodeId,
    network: LocalNetwork,
}

#[async_trait]
impl RaftTransport for LocalTransport {
    async fn request_vote(
        &self,
        target: &NodeId,
        _addr: &str,
        req: VoteRequest,
    ) -> Result<VoteResponse> {
        let handle = self.network.route(&self.source, target)?;
        handle.request_vote(req).await
    }

    async fn append_entries(
        &self,
        target: &NodeId,
        _addr: &str,
        req: AppendRequest,
    ) -> Result<AppendResponse> {
        let handle = self.network.route(&self.source, target)?;
        let resp = handle.append_entries(req).await?;
        // The reply crosses the same link
        self.network.route(&self.source, target)?;
        Ok(resp)
    }

    async fn install_snapshot(
        &self,
        target: &NodeId,
        _addr: &str,
        req: SnapshotRequest,
    ) -> Result<SnapshotResponse> {
        let handle = self.network.route(&self.source, target)?;
        handle.install_snapshot(req).await
    }
}
