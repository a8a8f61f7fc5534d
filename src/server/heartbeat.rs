//! Heartbeat monitor
//!
//! Runs on the leader and evicts metadata entries whose publisher stopped
//! heartbeating. Staleness is measured on the leader's monotonic clock from
//! the moment it first saw an entry's current `latest_heartbeat` value, so
//! publishers' wall clocks never have to agree with the leader's.

use crate::common::meta::{attrs, keys, MetaNamespace, MetaValue};
use crate::common::metrics::ClusterMetrics;
use crate::common::raft::{Members, Operation};
use crate::server::metadata::{MetaStateMachine, MetadataStore};
use crate::server::raft_node::RaftHandle;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

struct Observation {
    heartbeat: i64,
    since: Instant,
}

pub struct HeartbeatMonitor {
    timeout: Duration,
    observed: HashMap<(MetaNamespace, String), Observation>,
}

impl HeartbeatMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            observed: HashMap::new(),
        }
    }

    /// Forget all observations; called when leadership is lost
    pub fn reset(&mut self) {
        self.observed.clear();
    }

    /// Operations that evict the entries gone stale as of `now`.
    ///
    /// Entries without a heartbeat attribute are ignored. SERVER_META
    /// entries of voting members are marked OFFLINE instead of deleted.
    pub fn scan(&mut self, store: &MetadataStore, voters: &Members, now: Instant) -> Vec<Operation> {
        let mut ops = Vec::new();
        let mut seen = HashSet::new();

        for namespace in MetaNamespace::ALL {
            for (key, entry) in store.entries(namespace) {
                let Some(heartbeat) = entry.get(keys::LATEST_HEARTBEAT).and_then(MetaValue::as_i64)
                else {
                    continue;
                };
                let id = (namespace, key.clone());
                seen.insert(id.clone());

                let observation = self.observed.entry(id).or_insert(Observation {
                    heartbeat,
                    since: now,
                });
                if observation.heartbeat != heartbeat {
                    observation.heartbeat = heartbeat;
                    observation.since = now;
                    continue;
                }
                if now.duration_since(observation.since) <= self.timeout {
                    continue;
                }

                if namespace == MetaNamespace::ServerMeta && voters.contains_key(key) {
                    let offline = entry.get(keys::STATUS).and_then(MetaValue::as_str)
                        == Some(keys::OFFLINE_STATUS);
                    if !offline {
                        ops.push(Operation::Put {
                            namespace,
                            key: key.clone(),
                            attrs: attrs([(keys::STATUS, keys::OFFLINE_STATUS)]),
                        });
                    }
                } else {
                    ops.push(Operation::Delete {
                        namespace,
                        key: key.clone(),
                    });
                }
            }
        }

        self.observed.retain(|id, _| seen.contains(id));
        ops
    }

    /// Scan every `interval` while this node leads, until `shutdown` flips
    pub fn start(
        mut self,
        raft: RaftHandle,
        state_machine: MetaStateMachine,
        metrics: Arc<ClusterMetrics>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                let status = raft.status();
                if !status.is_leader() {
                    self.reset();
                    continue;
                }

                let ops = {
                    let store = state_machine.read();
                    self.scan(&store, &status.members, Instant::now())
                };
                for op in ops {
                    match &op {
                        Operation::Delete { namespace, key } => {
                            tracing::info!("Evicting stale {} entry {}", namespace, key)
                        }
                        Operation::Put { namespace, key, .. } => {
                            tracing::info!("Marking {} entry {} offline", namespace, key)
                        }
                        _ => {}
                    }
                    match raft.propose(op).await {
                        Ok(_) => metrics.evictions_total.inc(),
                        Err(e) => {
                            tracing::warn!("Eviction proposal failed: {}", e);
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Heartbeat monitor stopped");
        })
    }
}
