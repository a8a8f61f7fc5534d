//! Raft peer transport
//!
//! [`RaftTransport`] is the seam between the consensus node and the network.
//! [`HttpTransport`] posts JSON to a peer's `/raft/*` endpoints; tests use the
//! in-process transport in `server::local_network` (feature `test-util`).

use crate::common::api::{post_json, send_json, url};
use crate::common::raft::{
    AppendRequest, AppendResponse, NodeId, SnapshotRequest, SnapshotResponse, VoteRequest,
    VoteResponse,
};
use crate::common::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Snapshots can be large; they get this many RPC timeouts to arrive
const SNAPSHOT_TIMEOUT_FACTOR: u32 = 20;

#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(
        &self,
        target: &NodeId,
        addr: &str,
        req: VoteRequest,
    ) -> Result<VoteResponse>;

    async fn append_entries(
        &self,
        target: &NodeId,
        addr: &str,
        req: AppendRequest,
    ) -> Result<AppendResponse>;

    async fn install_snapshot(
        &self,
        target: &NodeId,
        addr: &str,
        req: SnapshotRequest,
    ) -> Result<SnapshotResponse>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    rpc_timeout: Duration,
}

impl HttpTransport {
    pub fn new(rpc_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(rpc_timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            rpc_timeout,
        })
    }
}

#[async_trait]
impl RaftTransport for HttpTransport {
    async fn request_vote(
        &self,
        _target: &NodeId,
        addr: &str,
        req: VoteRequest,
    ) -> Result<VoteResponse> {
        post_json(&self.client, &url(addr, "/raft/vote"), &req).await
    }

    async fn append_entries(
        &self,
        _target: &NodeId,
        addr: &str,
        req: AppendRequest,
    ) -> Result<AppendResponse> {
        post_json(&self.client, &url(addr, "/raft/append"), &req).await
    }

    async fn install_snapshot(
        &self,
        _target: &NodeId,
        addr: &str,
        req: SnapshotRequest,
    ) -> Result<SnapshotResponse> {
        let request = self
            .client
            .post(url(addr, "/raft/snapshot"))
            .timeout(self.rpc_timeout * SNAPSHOT_TIMEOUT_FACTOR)
            .json(&req);
        send_json(request).await
    }
}
