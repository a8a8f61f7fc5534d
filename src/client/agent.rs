//! Cluster client agent
//!
//! Runs inside non-voting processes. Calls go to one attached server at a
//! time; `NotLeader` redirects are followed to the hinted leader and
//! connection failures rotate through the configured servers, with
//! exponential backoff bounded by `max_retries` and `request_timeout_ms`.
//! A write that timed out is never re-sent; the caller gets the error.

use crate::common::api::{
    send_json, url, ClusterStatus, MemberAction, MemberRequest, ProposeRequest, ProposeResponse,
    QueryRequest, QueryResponse,
};
use crate::common::meta::{idle_entry, keys, online_entries, AttrMap, MetaEntries, MetaNamespace};
use crate::common::raft::{NodeId, Operation};
use crate::common::resources::{ResourceProbe, SystemProbe};
use crate::common::utils::backoff_delay;
use crate::common::{timestamp_now_millis, ClientConfig, Error, MetaValue, Result};
use reqwest::Method;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Attributes the agent fills in unless the registration sets them
const AGENT_KEYS: [&str; 5] = [
    keys::CPU_CAPACITY,
    keys::CPU_USED,
    keys::MEMORY_CAPACITY,
    keys::MEMORY_USED,
    keys::STATUS,
];

/// Whether a failed call may be sent again without the caller's say
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retry {
    /// Reads: any transient failure
    Always,
    /// Writes: only when the server never took the request. A timeout leaves
    /// the outcome unknown and goes back to the caller.
    Unsent,
}

/// Handle to the cluster from a non-voting process. Cheap to clone.
#[derive(Clone)]
pub struct ClusterClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    http: reqwest::Client,
    probe: Arc<dyn ResourceProbe>,
    /// Server calls currently go to
    target: Mutex<String>,
    /// Rotation position in `config.servers`
    cursor: AtomicUsize,
    /// Highest index one of our writes committed at
    committed_index: AtomicU64,
    registration: Mutex<Option<Registration>>,
}

/// A started entity and its heartbeat loop
struct Registration {
    entity_key: String,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ClusterClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_probe(config, Arc::new(SystemProbe::new()))
    }

    pub fn with_probe(config: ClientConfig, probe: Arc<dyn ResourceProbe>) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;
        let target = config.servers[0].clone();
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                http,
                probe,
                target: Mutex::new(target),
                cursor: AtomicUsize::new(0),
                committed_index: AtomicU64::new(0),
                registration: Mutex::new(None),
            }),
        })
    }

    /// Register `entity_key` in PROCESS_META and keep it alive with heartbeats.
    ///
    /// `registration` holds the caller's attributes and always wins. The
    /// agent adds `latest_heartbeat`, plus status and resource usage for the
    /// keys the registration leaves out, and keeps refreshing only those.
    pub async fn start(&self, entity_key: &str, registration: AttrMap) -> Result<()> {
        MetaNamespace::ProcessMeta.validate(&registration)?;
        let owned: BTreeSet<&'static str> = AGENT_KEYS
            .into_iter()
            .filter(|key| !registration.contains_key(*key))
            .collect();
        let attrs: AttrMap = heartbeat_attrs(self.inner.probe.as_ref(), &owned)
            .into_iter()
            .chain(registration)
            .collect();
        self.put_cluster_meta(MetaNamespace::ProcessMeta, entity_key, attrs)
            .await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = spawn_heartbeat(
            Arc::downgrade(&self.inner),
            entity_key.to_string(),
            owned,
            self.inner.config.heartbeat_interval(),
            stop_rx,
        );
        let previous = self.lock_registration().replace(Registration {
            entity_key: entity_key.to_string(),
            stop_tx,
            task,
        });
        if let Some(previous) = previous {
            let _ = previous.stop_tx.send(true);
        }
        tracing::info!("Registered {} in {}", entity_key, MetaNamespace::ProcessMeta);
        Ok(())
    }

    /// Stop heartbeating and remove the registered entry (best effort)
    pub async fn shutdown(&self) {
        let Some(registration) = self.lock_registration().take() else {
            return;
        };
        let _ = registration.stop_tx.send(true);
        let _ = registration.task.await;

        if let Err(e) = self
            .delete_cluster_meta(MetaNamespace::ProcessMeta, &registration.entity_key)
            .await
        {
            tracing::warn!(
                "Could not deregister {}: {}",
                registration.entity_key,
                e
            );
        } else {
            tracing::info!("Deregistered {}", registration.entity_key);
        }
    }

    /// Merge attributes into an entry. A `ProposalTimeout` or `Timeout`
    /// means the outcome is unknown; re-query before retrying.
    pub async fn put_cluster_meta(
        &self,
        namespace: MetaNamespace,
        key: &str,
        attrs: AttrMap,
    ) -> Result<u64> {
        namespace.validate(&attrs)?;
        self.propose(Operation::Put {
            namespace,
            key: key.to_string(),
            attrs,
        })
        .await
    }

    /// Entries under `key`, or the whole namespace when `key` is empty.
    /// Reads wait for this agent's own writes to be visible.
    pub async fn get_cluster_meta(&self, namespace: MetaNamespace, key: &str) -> Result<MetaEntries> {
        let committed = self.inner.committed_index.load(Ordering::SeqCst);
        let req = QueryRequest {
            namespace,
            key: key.to_string(),
            min_index: (committed > 0).then_some(committed),
        };
        let resp: QueryResponse = self
            .request(Method::POST, "/meta/query", Some(&req), Retry::Always)
            .await?;
        Ok(resp.entries)
    }

    /// Remove a whole entry. Not retried on timeout: a delete that did
    /// commit would otherwise be applied again after a re-registration.
    pub async fn delete_cluster_meta(&self, namespace: MetaNamespace, key: &str) -> Result<u64> {
        self.propose(Operation::Delete {
            namespace,
            key: key.to_string(),
        })
        .await
    }

    async fn propose(&self, op: Operation) -> Result<u64> {
        let resp: ProposeResponse = self
            .request(
                Method::POST,
                "/meta/propose",
                Some(&ProposeRequest { op }),
                Retry::Unsent,
            )
            .await?;
        self.inner
            .committed_index
            .fetch_max(resp.index, Ordering::SeqCst);
        Ok(resp.index)
    }

    /// Status of the attached server
    pub async fn cluster_status(&self) -> Result<ClusterStatus> {
        self.request::<(), _>(Method::GET, "/cluster/status", None, Retry::Always)
            .await
    }

    /// The attached server currently leads the cluster
    pub async fn is_cluster_leader(&self) -> bool {
        self.cluster_status()
            .await
            .map(|s| s.raft.is_leader())
            .unwrap_or(false)
    }

    /// The attached server knows a leader
    pub async fn raft_initialized(&self) -> bool {
        self.cluster_status()
            .await
            .map(|s| s.raft.initialized && s.raft.leader_id.is_some())
            .unwrap_or(false)
    }

    /// Name the attached server publishes its SERVER_META entry under
    pub async fn cluster_node_name(&self) -> Result<String> {
        Ok(self.cluster_status().await?.node_name)
    }

    /// SERVER_META entries whose status is ONLINE
    pub async fn online_servers(&self) -> Result<MetaEntries> {
        let entries = self.get_cluster_meta(MetaNamespace::ServerMeta, "").await?;
        Ok(online_entries(&entries))
    }

    /// The online server with the lowest memory usage ratio
    pub async fn idle_server(&self) -> Result<Option<(String, AttrMap)>> {
        let entries = self.get_cluster_meta(MetaNamespace::ServerMeta, "").await?;
        Ok(idle_entry(&entries))
    }

    pub async fn add_voter(&self, id: NodeId, addr: String) -> Result<u64> {
        self.change_membership(MemberRequest {
            action: MemberAction::Add,
            id,
            addr: Some(addr),
        })
        .await
    }

    pub async fn remove_voter(&self, id: NodeId) -> Result<u64> {
        self.change_membership(MemberRequest {
            action: MemberAction::Remove,
            id,
            addr: None,
        })
        .await
    }

    async fn change_membership(&self, req: MemberRequest) -> Result<u64> {
        let resp: ProposeResponse = self
            .request(Method::POST, "/cluster/members", Some(&req), Retry::Unsent)
            .await?;
        self.inner
            .committed_index
            .fetch_max(resp.index, Ordering::SeqCst);
        Ok(resp.index)
    }

    /// Highest index this agent's writes committed at
    pub fn committed_index(&self) -> u64 {
        self.inner.committed_index.load(Ordering::SeqCst)
    }

    /// Server the next call goes to
    pub fn target(&self) -> String {
        self.lock_target().clone()
    }

    async fn request<Req, Resp>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Req>,
        retry: Retry,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let config = &self.inner.config;
        let deadline = Instant::now() + config.request_timeout();
        let mut target = self.target();
        let mut attempt = 0;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut builder = self
                .inner
                .http
                .request(method.clone(), url(&target, path))
                .timeout(remaining.max(Duration::from_millis(1)));
            if let Some(body) = body {
                builder = builder.json(body);
            }

            let err = match send_json(builder).await {
                Ok(resp) => {
                    *self.lock_target() = target;
                    return Ok(resp);
                }
                Err(e) => e,
            };

            attempt += 1;
            let redirect = err
                .leader_hint()
                .filter(|leader| *leader != target)
                .map(str::to_string);
            let outcome_unknown = matches!(err, Error::ProposalTimeout | Error::Timeout(_));
            let retryable = err.is_retryable() || matches!(err, Error::Shutdown | Error::Http(_));
            if !retryable || (retry == Retry::Unsent && outcome_unknown) {
                return Err(err);
            }
            if attempt >= config.max_retries || Instant::now() >= deadline {
                return Err(give_up(err, attempt));
            }

            match redirect {
                Some(leader) => {
                    tracing::debug!("{} redirected to leader {}", target, leader);
                    target = leader;
                }
                None => {
                    let next = self.next_server();
                    tracing::warn!(
                        "Request to {} failed ({}), retrying on {} (attempt {}/{})",
                        target,
                        err,
                        next,
                        attempt,
                        config.max_retries
                    );
                    target = next;
                    let delay = backoff_delay(config.retry_backoff(), attempt - 1, MAX_BACKOFF);
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    tokio::time::sleep(delay.min(remaining)).await;
                }
            }
        }
    }

    fn next_server(&self) -> String {
        let servers = &self.inner.config.servers;
        let cursor = self.inner.cursor.fetch_add(1, Ordering::SeqCst) + 1;
        servers[cursor % servers.len()].clone()
    }

    fn lock_target(&self) -> std::sync::MutexGuard<'_, String> {
        self.inner.target.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_registration(&self) -> std::sync::MutexGuard<'_, Option<Registration>> {
        self.inner
            .registration
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

/// Final error of a call that ran out of attempts or time
fn give_up(err: Error, attempts: usize) -> Error {
    match err {
        Error::NotLeader { leader: None } | Error::ConnectionFailed(_) | Error::Shutdown => {
            Error::ConsensusUnavailable(format!(
                "no leader reachable after {} attempts: {}",
                attempts, err
            ))
        }
        other => other,
    }
}

/// `latest_heartbeat` plus whichever of the agent's keys are in `owned`
fn heartbeat_attrs(probe: &dyn ResourceProbe, owned: &BTreeSet<&'static str>) -> AttrMap {
    let mut attrs = probe.sample().to_attrs();
    attrs.insert(keys::STATUS.into(), keys::ONLINE_STATUS.into());
    attrs.retain(|key, _| owned.contains(key.as_str()));
    attrs.insert(
        keys::LATEST_HEARTBEAT.into(),
        MetaValue::Int(timestamp_now_millis()),
    );
    attrs
}

fn spawn_heartbeat(
    inner: Weak<Inner>,
    entity_key: String,
    owned: BTreeSet<&'static str>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.changed() => break,
            }
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let client = ClusterClient { inner };
            let attrs = heartbeat_attrs(client.inner.probe.as_ref(), &owned);
            tokio::select! {
                res = client.put_cluster_meta(MetaNamespace::ProcessMeta, &entity_key, attrs) => {
                    if let Err(e) = res {
                        tracing::warn!("Heartbeat for {} failed: {}", entity_key, e);
                    }
                }
                _ = stop.changed() => break,
            }
        }
        tracing::debug!("Heartbeat for {} stopped", entity_key);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::find_available_port;

    #[test]
    fn test_rejects_empty_server_list() {
        assert!(ClusterClient::new(ClientConfig::new(Vec::new())).is_err());
    }

    #[tokio::test]
    async fn test_rotates_and_gives_up_when_nothing_listens() {
        let servers = vec![
            format!("127.0.0.1:{}", find_available_port().unwrap()),
            format!("127.0.0.1:{}", find_available_port().unwrap()),
        ];
        let config = ClientConfig {
            request_timeout_ms: 2_000,
            max_retries: 3,
            retry_backoff_ms: 1,
            ..ClientConfig::new(servers.clone())
        };
        let client = ClusterClient::new(config).unwrap();
        let err = client
            .get_cluster_meta(MetaNamespace::ProcessMeta, "")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConsensusUnavailable(_)), "{:?}", err);
        assert!(servers.contains(&client.target()));
        assert!(!client.is_cluster_leader().await);
    }

    #[tokio::test]
    async fn test_schema_checked_before_sending() {
        let client = ClusterClient::new(ClientConfig::new(vec!["127.0.0.1:1".into()])).unwrap();
        let err = client
            .put_cluster_meta(
                MetaNamespace::ProcessMeta,
                "W1",
                crate::common::attrs([("bogus", 1i64)]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    /// Server that times out every proposal and the first query
    async fn spawn_slow_server(proposals: Arc<AtomicUsize>, queries: Arc<AtomicUsize>) -> String {
        use axum::{extract::State, routing::post, Json, Router};

        type Counters = (Arc<AtomicUsize>, Arc<AtomicUsize>);

        async fn propose(
            State((proposals, _)): State<Counters>,
            Json(_): Json<ProposeRequest>,
        ) -> Result<Json<ProposeResponse>> {
            proposals.fetch_add(1, Ordering::SeqCst);
            Err(Error::ProposalTimeout)
        }

        async fn query(
            State((_, queries)): State<Counters>,
            Json(_): Json<QueryRequest>,
        ) -> Result<Json<QueryResponse>> {
            if queries.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(Error::Timeout("apply wait".into()));
            }
            Ok(Json(QueryResponse {
                entries: MetaEntries::new(),
                applied_index: 1,
                served_by: "stub".into(),
            }))
        }

        let app = Router::new()
            .route("/meta/propose", post(propose))
            .route("/meta/query", post(query))
            .with_state((proposals, queries));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr.to_string()
    }

    #[tokio::test]
    async fn test_write_timeout_returned_without_resending() {
        let proposals = Arc::new(AtomicUsize::new(0));
        let queries = Arc::new(AtomicUsize::new(0));
        let addr = spawn_slow_server(proposals.clone(), queries.clone()).await;
        let config = ClientConfig {
            retry_backoff_ms: 1,
            ..ClientConfig::new(vec![addr])
        };
        let client = ClusterClient::new(config).unwrap();

        let err = client
            .delete_cluster_meta(MetaNamespace::ProcessMeta, "W1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProposalTimeout), "{:?}", err);
        assert_eq!(proposals.load(Ordering::SeqCst), 1);

        // Reads are safe to send again
        let entries = client
            .get_cluster_meta(MetaNamespace::ProcessMeta, "W1")
            .await
            .unwrap();
        assert!(entries.is_empty());
        assert_eq!(queries.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_heartbeat_attrs_skip_caller_keys() {
        let probe = crate::common::resources::FixedProbe(crate::common::resources::ResourceUsage {
            cpu_capacity: 8.0,
            cpu_used: 2.0,
            memory_capacity: 16 << 30,
            memory_used: 4 << 30,
        });
        let owned: BTreeSet<&'static str> = [keys::MEMORY_USED].into_iter().collect();
        let attrs = heartbeat_attrs(&probe, &owned);
        assert!(attrs.contains_key(keys::LATEST_HEARTBEAT));
        assert!(attrs.contains_key(keys::MEMORY_USED));
        assert!(!attrs.contains_key(keys::CPU_USED));
        assert!(!attrs.contains_key(keys::STATUS));
    }

    #[tokio::test]
    async fn test_shutdown_without_start_is_noop() {
        let client = ClusterClient::new(ClientConfig::new(vec!["127.0.0.1:1".into()])).unwrap();
        client.shutdown().await;
        assert_eq!(client.committed_index(), 0);
    }
}
