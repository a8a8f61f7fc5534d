//! In-process cluster harness shared by the integration tests

#![allow(dead_code)]

use minimeta::common::raft::{Members, NodeId, Operation};
use minimeta::common::{attrs, AttrMap, MetaNamespace, WalSyncPolicy};
use minimeta::server::{LocalNetwork, MetaStateMachine, RaftHandle, RaftNode, RaftOptions};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

pub const WAIT: Duration = Duration::from_secs(10);

pub struct Node {
    pub handle: RaftHandle,
    pub sm: MetaStateMachine,
}

pub struct Cluster {
    pub net: LocalNetwork,
    pub members: Members,
    pub nodes: BTreeMap<NodeId, Node>,
    dirs: BTreeMap<NodeId, TempDir>,
    snapshot_threshold: u64,
}

impl Cluster {
    /// Start `n` voters named `n1..=n{n}`
    pub fn start(n: usize) -> Self {
        Self::start_with_threshold(n, 1000)
    }

    pub fn start_with_threshold(n: usize, snapshot_threshold: u64) -> Self {
        let members: Members = (1..=n)
            .map(|i| (format!("n{}", i), format!("n{}", i)))
            .collect();
        let mut cluster = Cluster {
            net: LocalNetwork::new(),
            members: members.clone(),
            nodes: BTreeMap::new(),
            dirs: BTreeMap::new(),
            snapshot_threshold,
        };
        for id in members.keys() {
            cluster.dirs.insert(id.clone(), TempDir::new().unwrap());
            cluster.boot(id, members.clone());
        }
        cluster
    }

    fn options(&self, id: &str) -> RaftOptions {
        RaftOptions {
            data_dir: self.dirs[id].path().to_path_buf(),
            election_timeout: Duration::from_millis(150),
            heartbeat_interval: Duration::from_millis(30),
            propose_timeout: Duration::from_secs(3),
            snapshot_threshold: self.snapshot_threshold,
            wal_sync: WalSyncPolicy::Never,
        }
    }

    fn boot(&mut self, id: &str, members: Members) {
        let sm = MetaStateMachine::new();
        let (handle, _task) = RaftNode::start(
            id.to_string(),
            id.to_string(),
            members,
            self.options(id),
            Arc::new(sm.clone()),
            self.net.transport_for(id),
        )
        .unwrap();
        self.net.register(id, handle.clone());
        self.nodes.insert(id.to_string(), Node { handle, sm });
    }

    /// Start a node outside the current membership; it waits to be added
    pub fn join(&mut self, id: &str) {
        self.dirs.insert(id.to_string(), TempDir::new().unwrap());
        let members = self.members.clone();
        self.boot(id, members);
    }

    pub async fn stop(&mut self, id: &str) {
        self.net.unregister(id);
        if let Some(node) = self.nodes.remove(id) {
            node.handle.shutdown().await;
        }
    }

    /// Stop and start again from the same data directory
    pub async fn restart(&mut self, id: &str) {
        self.stop(id).await;
        let members = self.members.clone();
        self.boot(id, members);
    }

    pub fn node(&self, id: &str) -> &Node {
        &self.nodes[id]
    }

    /// Wait until one running node, other than `except`, leads
    pub async fn leader_except(&self, except: &[&str]) -> NodeId {
        let deadline = Instant::now() + WAIT;
        loop {
            for (id, node) in &self.nodes {
                if except.contains(&id.as_str()) {
                    continue;
                }
                let status = node.handle.status();
                if status.is_leader() {
                    return id.clone();
                }
            }
            assert!(Instant::now() < deadline, "no leader elected");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn leader(&self) -> NodeId {
        self.leader_except(&[]).await
    }

    pub fn leaders(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.handle.is_leader())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Wait until every running node (or only `ids`) has applied `index`
    pub async fn wait_applied(&self, ids: &[&str], index: u64) {
        for (id, node) in &self.nodes {
            if !ids.is_empty() && !ids.contains(&id.as_str()) {
                continue;
            }
            node.handle
                .wait_for_applied(index, WAIT)
                .await
                .unwrap_or_else(|e| panic!("{} did not apply {}: {}", id, index, e));
        }
    }

    pub async fn put(&self, via: &str, key: &str, attrs: AttrMap) -> minimeta::Result<u64> {
        self.node(via)
            .handle
            .propose(Operation::Put {
                namespace: MetaNamespace::ProcessMeta,
                key: key.to_string(),
                attrs,
            })
            .await
    }

    pub fn cpu_used(&self, id: &str, key: &str) -> Option<i64> {
        self.node(id)
            .sm
            .read()
            .get(MetaNamespace::ProcessMeta, key)
            .and_then(|a| a.get("cpu_used"))
            .and_then(|v| v.as_i64())
    }
}

pub fn cpu(n: i64) -> AttrMap {
    attrs([("cpu_used", n)])
}
