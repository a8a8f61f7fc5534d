//! Cluster server node
//!
//! Binds the RPC listener, runs a Raft participant whose state machine is the
//! local metadata replica, and keeps two background tasks alive: the
//! SERVER_META publisher and, while leading, the heartbeat monitor.

use crate::common::api::{
    post_json, url, ClusterStatus, ProposeRequest, ProposeResponse, QueryRequest, QueryResponse,
};
use crate::common::meta::{keys, AttrMap, MetaEntries, MetaNamespace, MetaValue};
use crate::common::metrics::ClusterMetrics;
use crate::common::raft::{Members, NodeId, Operation};
use crate::common::resources::{ResourceProbe, SystemProbe};
use crate::common::{
    timestamp_now_millis, ClusterNodeIdentity, Error, ReadPolicy, Result, ServerConfig,
};
use crate::server::heartbeat::HeartbeatMonitor;
use crate::server::http::create_router;
use crate::server::metadata::MetaStateMachine;
use crate::server::raft_node::{RaftHandle, RaftNode, RaftOptions, RaftStatus};
use crate::server::raft_rpc_client::HttpTransport;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A running server node. Cheap to clone; all clones drive the same node.
#[derive(Clone)]
pub struct ClusterServer {
    inner: Arc<Inner>,
}

struct Inner {
    identity: ClusterNodeIdentity,
    config: ServerConfig,
    raft: RaftHandle,
    state_machine: MetaStateMachine,
    metrics: Arc<ClusterMetrics>,
    probe: Arc<dyn ResourceProbe>,
    /// Forwards this node's publications to the leader
    http: reqwest::Client,
    start_time: i64,
    /// Stops the publisher and monitor
    background_tx: watch::Sender<bool>,
    /// Stops the HTTP listener
    listener_tx: watch::Sender<bool>,
    tasks: Mutex<Tasks>,
}

#[derive(Default)]
struct Tasks {
    background: Vec<JoinHandle<()>>,
    http: Option<JoinHandle<()>>,
    raft: Option<JoinHandle<()>>,
}

impl ClusterServer {
    pub async fn start(config: ServerConfig) -> Result<Self> {
        Self::start_with_probe(config, Arc::new(SystemProbe::new())).await
    }

    /// Start with a custom resource sampler for SERVER_META publications
    pub async fn start_with_probe(
        config: ServerConfig,
        probe: Arc<dyn ResourceProbe>,
    ) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(config.bind_addr).await?;
        let identity =
            ClusterNodeIdentity::from_bound(listener.local_addr()?, config.advertise_host.as_deref());
        let id: NodeId = identity.name().to_string();

        let members: Members = if config.peers.is_empty() {
            Members::from([(id.clone(), identity.addr())])
        } else {
            config.peers.iter().map(|p| (p.clone(), p.clone())).collect()
        };
        if !members.contains_key(&id) {
            tracing::info!("{} is not in the voter list; starting as a joiner", id);
        }

        tracing::info!("Starting cluster server: {}", identity);
        tracing::info!("  RPC address: {}", identity.addr());
        tracing::info!("  Data dir: {}", config.data_dir.display());
        tracing::info!("  Voters: {:?}", members.keys().collect::<Vec<_>>());

        let state_machine = MetaStateMachine::new();
        let transport = Arc::new(HttpTransport::new(config.rpc_timeout())?);
        let (raft, raft_task) = RaftNode::start(
            id,
            identity.addr(),
            members,
            RaftOptions::from_config(&config),
            Arc::new(state_machine.clone()),
            transport,
        )?;

        let http = reqwest::Client::builder()
            .timeout(config.propose_timeout() + config.rpc_timeout())
            .build()?;
        let (background_tx, background_rx) = watch::channel(false);
        let (listener_tx, mut listener_rx) = watch::channel(false);

        let server = Self {
            inner: Arc::new(Inner {
                identity,
                config,
                raft,
                state_machine,
                metrics: Arc::new(ClusterMetrics::new()),
                probe,
                http,
                start_time: timestamp_now_millis(),
                background_tx,
                listener_tx,
                tasks: Mutex::new(Tasks::default()),
            }),
        };

        let router = create_router(server.clone());
        let http_task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = listener_rx.wait_for(|stop| *stop).await;
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!("HTTP server error: {}", e);
            }
        });

        let publisher = server.spawn_publisher(background_rx.clone());
        let monitor = HeartbeatMonitor::new(server.inner.config.heartbeat_timeout()).start(
            server.inner.raft.clone(),
            server.inner.state_machine.clone(),
            server.inner.metrics.clone(),
            server.inner.config.monitor_interval(),
            background_rx,
        );

        {
            let mut tasks = server.lock_tasks();
            tasks.background = vec![publisher, monitor];
            tasks.http = Some(http_task);
            tasks.raft = Some(raft_task);
        }

        tracing::info!("✓ Cluster server {} ready", server.inner.identity);
        Ok(server)
    }

    pub fn identity(&self) -> &ClusterNodeIdentity {
        &self.inner.identity
    }

    /// Name this node publishes its SERVER_META entry under
    pub fn cluster_node_name(&self) -> &str {
        self.inner.identity.name()
    }

    pub fn raft(&self) -> &RaftHandle {
        &self.inner.raft
    }

    pub fn status(&self) -> RaftStatus {
        self.inner.raft.status()
    }

    pub fn cluster_status(&self) -> ClusterStatus {
        ClusterStatus {
            node_name: self.cluster_node_name().to_string(),
            addr: self.inner.identity.addr(),
            raft: self.status(),
        }
    }

    pub fn is_cluster_leader(&self) -> bool {
        self.inner.raft.is_leader()
    }

    /// At least one leader has been seen since startup
    pub fn raft_initialized(&self) -> bool {
        self.inner.raft.status().initialized
    }

    /// Wait until a leader is known
    pub async fn wait_ready(&self, timeout: Duration) -> Result<RaftStatus> {
        self.inner
            .raft
            .wait_for(timeout, |s| s.initialized && s.leader_id.is_some())
            .await
    }

    /// Propose through this node; followers answer with a redirect
    pub async fn propose(&self, op: Operation) -> Result<u64> {
        if let Operation::Put {
            namespace, attrs, ..
        } = &op
        {
            namespace.validate(attrs)?;
        }
        self.inner.metrics.proposals_total.inc();
        let result = self.inner.raft.propose(op).await;
        if result.is_err() {
            self.inner.metrics.proposals_failed.inc();
        }
        result
    }

    /// Propose locally when leading, otherwise forward to the known leader
    pub async fn submit(&self, op: Operation) -> Result<u64> {
        let status = self.inner.raft.status();
        if status.is_leader() {
            return self.propose(op).await;
        }
        let leader = status
            .leader_addr
            .ok_or_else(|| Error::ConsensusUnavailable("no leader known".into()))?;
        let resp: ProposeResponse = post_json(
            &self.inner.http,
            &url(&leader, "/meta/propose"),
            &ProposeRequest { op },
        )
        .await?;
        Ok(resp.index)
    }

    /// Serve a read from the local replica, honoring the read policy
    pub async fn query(&self, req: QueryRequest) -> Result<QueryResponse> {
        self.inner.metrics.queries_total.inc();
        let config = &self.inner.config;
        if config.read_policy == ReadPolicy::Leader && !self.is_cluster_leader() {
            return Err(Error::not_leader(self.status().leader_addr));
        }

        if let Some(min_index) = req.min_index {
            if self.status().last_applied < min_index {
                match self
                    .inner
                    .raft
                    .wait_for_applied(min_index, config.read_wait())
                    .await
                {
                    Ok(_) => {}
                    Err(Error::Timeout(_)) if config.stale_read_fallback => {
                        self.inner.metrics.stale_reads.inc();
                        tracing::warn!(
                            "Index {} not applied within {:?}; serving a stale read",
                            min_index,
                            config.read_wait()
                        );
                    }
                    Err(Error::Timeout(_)) => {
                        return Err(Error::Timeout(format!(
                            "index {} not applied on {} within {:?}",
                            min_index,
                            self.cluster_node_name(),
                            config.read_wait()
                        )));
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let store = self.inner.state_machine.read();
        Ok(QueryResponse {
            entries: store.query(req.namespace, &req.key),
            applied_index: store.applied_index(),
            served_by: self.cluster_node_name().to_string(),
        })
    }

    /// Merge attributes into an entry through consensus
    pub async fn put_cluster_meta(
        &self,
        namespace: MetaNamespace,
        key: &str,
        attrs: AttrMap,
    ) -> Result<u64> {
        namespace.validate(&attrs)?;
        self.submit(Operation::Put {
            namespace,
            key: key.to_string(),
            attrs,
        })
        .await
    }

    /// Local read; an empty key returns the whole namespace
    pub async fn get_cluster_meta(&self, namespace: MetaNamespace, key: &str) -> Result<MetaEntries> {
        let resp = self
            .query(QueryRequest {
                namespace,
                key: key.to_string(),
                min_index: None,
            })
            .await?;
        Ok(resp.entries)
    }

    pub async fn delete_cluster_meta(&self, namespace: MetaNamespace, key: &str) -> Result<u64> {
        self.submit(Operation::Delete {
            namespace,
            key: key.to_string(),
        })
        .await
    }

    pub async fn add_voter(&self, id: NodeId, addr: String) -> Result<u64> {
        crate::common::identity::parse_peer_addr(&addr)?;
        self.inner.raft.add_voter(id, addr).await
    }

    pub async fn remove_voter(&self, id: NodeId) -> Result<u64> {
        self.inner.raft.remove_voter(id).await
    }

    pub fn render_metrics(&self) -> String {
        self.inner.metrics.render(&self.status())
    }

    /// This node's SERVER_META attributes as of now
    fn server_meta_attrs(&self) -> AttrMap {
        let identity = &self.inner.identity;
        let mut attrs = self.inner.probe.sample().to_attrs();
        attrs.insert(keys::NODE_NAME.into(), identity.name().into());
        attrs.insert(keys::SERVER_HOST.into(), identity.host().into());
        attrs.insert(keys::SERVER_PORT.into(), identity.port().into());
        attrs.insert(
            keys::SERVER_START_TIME.into(),
            MetaValue::Int(self.inner.start_time),
        );
        attrs.insert(
            keys::LATEST_HEARTBEAT.into(),
            MetaValue::Int(timestamp_now_millis()),
        );
        attrs.insert(keys::STATUS.into(), keys::ONLINE_STATUS.into());
        attrs
    }

    fn spawn_publisher(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let server = self.clone();
        let interval = self.inner.config.meta_publish_interval();
        tokio::spawn(async move {
            loop {
                let mut status = server.inner.raft.subscribe();
                tokio::select! {
                    leader_known = async { status.wait_for(|s| s.leader_id.is_some()).await.is_ok() } => {
                        if !leader_known {
                            break;
                        }
                    }
                    _ = shutdown.changed() => break,
                }

                let op = Operation::Put {
                    namespace: MetaNamespace::ServerMeta,
                    key: server.cluster_node_name().to_string(),
                    attrs: server.server_meta_attrs(),
                };
                tokio::select! {
                    res = server.submit(op) => match res {
                        Ok(index) => tracing::debug!("Published server metadata at index {}", index),
                        Err(e) => {
                            server.inner.metrics.publish_failures.inc();
                            tracing::warn!("Failed to publish server metadata: {}", e);
                        }
                    },
                    _ = shutdown.changed() => break,
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("Server metadata publisher stopped");
        })
    }

    /// Stop publishing, close the listener, then stop consensus and release
    /// the log. Idempotent.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down cluster server {}", self.inner.identity);
        let tasks = std::mem::take(&mut *self.lock_tasks());

        let _ = self.inner.background_tx.send(true);
        for task in tasks.background {
            let _ = task.await;
        }

        let _ = self.inner.listener_tx.send(true);
        if let Some(task) = tasks.http {
            let _ = task.await;
        }

        self.inner.raft.shutdown().await;
        if let Some(task) = tasks.raft {
            let _ = task.await;
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Tasks> {
        self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}
