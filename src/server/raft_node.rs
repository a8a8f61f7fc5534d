//! Raft consensus node
//!
//! A single task owns all consensus state and reacts to two inputs: a
//! periodic tick and an inbox of [`Event`]s. Inbound RPCs, proposals and the
//! results of outbound RPCs all arrive through the inbox, so no consensus
//! state is ever shared behind a lock. Outbound RPCs run in spawned tasks
//! and post their outcome back as events.
//!
//! Beyond the core algorithm the node implements:
//!
//! - check-quorum: a leader that has not heard from a majority within one
//!   election timeout steps down
//! - leader stickiness: vote requests are ignored while a live leader is known
//! - single-server membership changes that take effect once committed
//! - log compaction into snapshots, with snapshot transfer to lagging peers
//! - a storage fault mode in which the node stops voting and campaigning

use crate::common::raft::{
    AppendRequest, AppendResponse, LogEntry, Members, NodeId, Operation, SnapshotRequest,
    SnapshotResponse, VoteRequest, VoteResponse,
};
use crate::common::utils::randomized_timeout;
use crate::common::{Error, Result, ServerConfig, WalSyncPolicy};
use crate::server::raft_log::{HardState, RaftLog, Snapshot};
use crate::server::raft_rpc_client::RaftTransport;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Upper bound on entries carried by one AppendEntries request
const MAX_APPEND_ENTRIES: usize = 128;

const INBOX_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Observable consensus state, published on every change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaftStatus {
    pub node_id: NodeId,
    pub role: RaftRole,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    /// Client-facing address of the leader
    pub leader_addr: Option<String>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub snapshot_index: u64,
    pub members: Members,
    /// A leader has been known since this node started
    pub initialized: bool,
    /// Storage failed; the node no longer takes part in consensus
    pub faulted: bool,
}

impl RaftStatus {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            role: RaftRole::Follower,
            term: 0,
            leader_id: None,
            leader_addr: None,
            commit_index: 0,
            last_applied: 0,
            last_log_index: 0,
            snapshot_index: 0,
            members: Members::new(),
            initialized: false,
            faulted: false,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }
}

/// Replicated state machine driven by committed entries
pub trait StateMachine: Send + Sync {
    /// Apply a committed entry. Called exactly once per index, in order.
    fn apply(&self, entry: &LogEntry);

    fn snapshot(&self) -> Result<Vec<u8>>;

    fn restore(&self, data: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct RaftOptions {
    pub data_dir: PathBuf,
    pub election_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub propose_timeout: Duration,
    /// Applied entries accumulated before compacting into a snapshot
    pub snapshot_threshold: u64,
    pub wal_sync: WalSyncPolicy,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./meta-data"),
            election_timeout: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            propose_timeout: Duration::from_secs(3),
            snapshot_threshold: 1000,
            wal_sync: WalSyncPolicy::Always,
        }
    }
}

impl RaftOptions {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            election_timeout: config.election_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            propose_timeout: config.propose_timeout(),
            snapshot_threshold: config.snapshot_threshold,
            wal_sync: config.wal_sync,
        }
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Event {
    Vote {
        req: VoteRequest,
        reply: Reply<VoteResponse>,
    },
    Append {
        req: AppendRequest,
        reply: Reply<AppendResponse>,
    },
    Snapshot {
        req: SnapshotRequest,
        reply: Reply<SnapshotResponse>,
    },
    Propose {
        op: Operation,
        reply: Reply<Result<u64>>,
    },
    VoteResult {
        peer: NodeId,
        term: u64,
        resp: Result<VoteResponse>,
    },
    AppendResult {
        peer: NodeId,
        term: u64,
        prev_log_index: u64,
        sent: u64,
        resp: Result<AppendResponse>,
    },
    SnapshotResult {
        peer: NodeId,
        term: u64,
        last_included_index: u64,
        resp: Result<SnapshotResponse>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Leader's view of one follower
struct Progress {
    next_index: u64,
    match_index: u64,
    /// Set while a request carrying entries or a snapshot is outstanding
    in_flight: Option<Instant>,
    last_ack: Instant,
}

/// Cloneable handle to a running [`RaftNode`]
#[derive(Clone)]
pub struct RaftHandle {
    id: NodeId,
    tx: mpsc::Sender<Event>,
    status: watch::Receiver<RaftStatus>,
    propose_timeout: Duration,
}

impl RaftHandle {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Replicate an operation, resolving with its log index once applied locally
    pub async fn propose(&self, op: Operation) -> Result<u64> {
        self.propose_with_timeout(op, self.propose_timeout).await
    }

    pub async fn propose_with_timeout(&self, op: Operation, timeout: Duration) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Propose { op, reply }).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Shutdown),
            Err(_) => Err(Error::ProposalTimeout),
        }
    }

    pub async fn request_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Vote { req, reply }).await?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    pub async fn append_entries(&self, req: AppendRequest) -> Result<AppendResponse> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Append { req, reply }).await?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    pub async fn install_snapshot(&self, req: SnapshotRequest) -> Result<SnapshotResponse> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Snapshot { req, reply }).await?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    pub fn status(&self) -> RaftStatus {
        self.status.borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.status.borrow().is_leader()
    }

    pub fn subscribe(&self) -> watch::Receiver<RaftStatus> {
        self.status.clone()
    }

    /// Wait until the published status satisfies `pred`
    pub async fn wait_for<F>(&self, timeout: Duration, pred: F) -> Result<RaftStatus>
    where
        F: FnMut(&RaftStatus) -> bool,
    {
        let mut rx = self.status.clone();
        let wait = async move { rx.wait_for(pred).await.map(|status| status.clone()) };
        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => Err(Error::Shutdown),
            Err(_) => Err(Error::Timeout(format!(
                "raft status condition not met within {:?}",
                timeout
            ))),
        }
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<RaftStatus> {
        self.wait_for(timeout, |s| s.leader_id.is_some()).await
    }

    pub async fn wait_for_applied(&self, index: u64, timeout: Duration) -> Result<RaftStatus> {
        self.wait_for(timeout, |s| s.last_applied >= index).await
    }

    pub async fn add_voter(&self, id: NodeId, addr: String) -> Result<u64> {
        self.propose(Operation::AddVoter { id, addr }).await
    }

    pub async fn remove_voter(&self, id: NodeId) -> Result<u64> {
        self.propose(Operation::RemoveVoter { id }).await
    }

    /// Stop the node; pending proposals fail with [`Error::Shutdown`]
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Event::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn send(&self, event: Event) -> Result<()> {
        self.tx.send(event).await.map_err(|_| Error::Shutdown)
    }
}

pub struct RaftNode {
    id: NodeId,
    addr: String,
    options: RaftOptions,
    log: RaftLog,
    state_machine: Arc<dyn StateMachine>,
    transport: Arc<dyn RaftTransport>,
    self_tx: mpsc::Sender<Event>,
    status_tx: watch::Sender<RaftStatus>,

    role: RaftRole,
    term: u64,
    voted_for: Option<NodeId>,
    leader_id: Option<NodeId>,
    leader_addr: Option<String>,
    commit_index: u64,
    last_applied: u64,
    members: Members,
    initialized: bool,
    faulted: bool,

    election_deadline: Instant,
    last_leader_contact: Option<Instant>,
    votes: BTreeSet<NodeId>,
    progress: HashMap<NodeId, Progress>,
    pending: HashMap<u64, Reply<Result<u64>>>,
    /// Index of an appended but not yet applied membership change
    pending_config: Option<u64>,
}

impl RaftNode {
    /// Recover persisted state and spawn the node's event loop.
    ///
    /// `members` seeds the voter set when no snapshot exists; membership
    /// entries in the log are then re-applied on top of it.
    pub fn start(
        id: NodeId,
        addr: String,
        members: Members,
        options: RaftOptions,
        state_machine: Arc<dyn StateMachine>,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<(RaftHandle, JoinHandle<()>)> {
        let (log, hard_state) = RaftLog::open(&options.data_dir, options.wal_sync)?;

        let mut members = members;
        let mut last_applied = 0;
        if let Some(snapshot) = log.snapshot() {
            state_machine.restore(&snapshot.data)?;
            members = snapshot.members.clone();
            last_applied = snapshot.last_included_index;
        }
        let commit_index = hard_state
            .commit_index
            .clamp(log.snapshot_index(), log.last_index());

        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let (status_tx, status_rx) = watch::channel(RaftStatus::new(id.clone()));

        // A sole voter has nobody to wait for
        let sole_voter = members.len() == 1 && members.contains_key(&id);
        let election_deadline = if sole_voter {
            Instant::now()
        } else {
            Instant::now() + randomized_timeout(options.election_timeout)
        };

        let mut node = Self {
            id: id.clone(),
            addr,
            log,
            state_machine,
            transport,
            self_tx: tx.clone(),
            status_tx,
            role: RaftRole::Follower,
            term: hard_state.term,
            voted_for: hard_state.voted_for,
            leader_id: None,
            leader_addr: None,
            commit_index,
            last_applied,
            members,
            initialized: false,
            faulted: false,
            election_deadline,
            last_leader_contact: None,
            votes: BTreeSet::new(),
            progress: HashMap::new(),
            pending: HashMap::new(),
            pending_config: None,
            options,
        };

        // Everything committed before the restart is applied before any election
        node.apply_committed();
        node.publish_status();

        tracing::info!(
            "Raft node {} started: term={}, commit={}, last_index={}, members={:?}",
            node.id,
            node.term,
            node.commit_index,
            node.log.last_index(),
            node.members.keys().collect::<Vec<_>>()
        );

        let propose_timeout = node.options.propose_timeout;
        // Log writes inside the actor block in place (see raft_log)
        let task = tokio::spawn(node.run(rx));
        let handle = RaftHandle {
            id,
            tx,
            status: status_rx,
            propose_timeout,
        };
        Ok((handle, task))
    }

    async fn run(mut self, mut inbox: mpsc::Receiver<Event>) {
        let mut ticker = tokio::time::interval(self.options.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(),
                event = inbox.recv() => match event {
                    Some(Event::Shutdown { reply }) => {
                        self.stop();
                        let _ = reply.send(());
                        break;
                    }
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
            self.publish_status();
        }
        tracing::info!("Raft node {} stopped", self.id);
    }

    fn tick(&mut self) {
        let now = Instant::now();
        match self.role {
            RaftRole::Leader => {
                if !self.has_quorum_contact(now) {
                    tracing::warn!(
                        "Leader {} lost contact with a majority, stepping down in term {}",
                        self.id,
                        self.term
                    );
                    self.become_follower(self.term, None, None);
                    return;
                }
                self.broadcast_append();
            }
            RaftRole::Follower | RaftRole::Candidate => {
                if now >= self.election_deadline {
                    self.campaign();
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Vote { req, reply } => {
                let _ = reply.send(self.handle_vote(req));
            }
            Event::Append { req, reply } => {
                let _ = reply.send(self.handle_append(req));
            }
            Event::Snapshot { req, reply } => {
                let _ = reply.send(self.handle_snapshot(req));
            }
            Event::Propose { op, reply } => self.handle_propose(op, reply),
            Event::VoteResult { peer, term, resp } => self.handle_vote_result(peer, term, resp),
            Event::AppendResult {
                peer,
                term,
                prev_log_index,
                sent,
                resp,
            } => self.handle_append_result(peer, term, prev_log_index, sent, resp),
            Event::SnapshotResult {
                peer,
                term,
                last_included_index,
                resp,
            } => self.handle_snapshot_result(peer, term, last_included_index, resp),
            Event::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    // ---------------------------------------------------------------------
    // Elections
    // ---------------------------------------------------------------------

    fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    fn reset_election_deadline(&mut self) {
        self.election_deadline = Instant::now() + randomized_timeout(self.options.election_timeout);
    }

    fn campaign(&mut self) {
        self.reset_election_deadline();
        if self.faulted || !self.members.contains_key(&self.id) {
            return;
        }

        self.role = RaftRole::Candidate;
        self.term += 1;
        self.voted_for = Some(self.id.clone());
        self.leader_id = None;
        self.leader_addr = None;
        self.votes.clear();
        self.votes.insert(self.id.clone());
        if !self.persist_hard_state() {
            return;
        }

        tracing::info!("Node {} starting election for term {}", self.id, self.term);

        if self.votes.len() >= self.quorum() {
            self.become_leader();
            return;
        }

        let req = VoteRequest {
            term: self.term,
            candidate_id: self.id.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for (peer, addr) in self.peers() {
            let transport = self.transport.clone();
            let tx = self.self_tx.clone();
            let req = req.clone();
            let term = self.term;
            tokio::spawn(async move {
                let resp = transport.request_vote(&peer, &addr, req).await;
                let _ = tx.send(Event::VoteResult { peer, term, resp }).await;
            });
        }
    }

    fn handle_vote(&mut self, req: VoteRequest) -> VoteResponse {
        if req.term > self.term && self.leader_is_live() {
            tracing::debug!(
                "Ignoring vote request from {} for term {}: leader {:?} is live",
                req.candidate_id,
                req.term,
                self.leader_id
            );
            return VoteResponse {
                term: self.term,
                vote_granted: false,
            };
        }
        if req.term > self.term {
            self.become_follower(req.term, None, None);
        }

        let log_ok = req.last_log_term > self.log.last_term()
            || (req.last_log_term == self.log.last_term()
                && req.last_log_index >= self.log.last_index());
        let can_vote = self.voted_for.is_none() || self.voted_for.as_ref() == Some(&req.candidate_id);

        let mut vote_granted = false;
        if !self.faulted && req.term == self.term && can_vote && log_ok {
            self.voted_for = Some(req.candidate_id.clone());
            if self.persist_hard_state() {
                vote_granted = true;
                self.reset_election_deadline();
                tracing::debug!("Voted for {} in term {}", req.candidate_id, self.term);
            }
        }
        VoteResponse {
            term: self.term,
            vote_granted,
        }
    }

    fn handle_vote_result(&mut self, peer: NodeId, term: u64, resp: Result<VoteResponse>) {
        let resp = match resp {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!("RequestVote to {} failed: {}", peer, e);
                return;
            }
        };
        if resp.term > self.term {
            self.become_follower(resp.term, None, None);
            return;
        }
        if self.role != RaftRole::Candidate || term != self.term || !resp.vote_granted {
            return;
        }
        if self.members.contains_key(&peer) {
            self.votes.insert(peer);
        }
        if self.votes.len() >= self.quorum() {
            self.become_leader();
        }
    }

    /// A leader is known and was heard from within the election timeout
    fn leader_is_live(&self) -> bool {
        if self.role == RaftRole::Leader {
            return true;
        }
        match (&self.leader_id, self.last_leader_contact) {
            (Some(_), Some(at)) => at.elapsed() < self.options.election_timeout,
            _ => false,
        }
    }

    fn become_leader(&mut self) {
        tracing::info!("Node {} became leader for term {}", self.id, self.term);
        self.role = RaftRole::Leader;
        self.leader_id = Some(self.id.clone());
        self.leader_addr = Some(self.addr.clone());
        self.initialized = true;

        let now = Instant::now();
        let next_index = self.log.last_index() + 1;
        self.progress = self
            .peers()
            .into_iter()
            .map(|(peer, _)| {
                (
                    peer,
                    Progress {
                        next_index,
                        match_index: 0,
                        in_flight: None,
                        last_ack: now,
                    },
                )
            })
            .collect();

        // An uncommitted membership change from an earlier term is still pending
        self.pending_config = self
            .log
            .entries_from(self.commit_index + 1, usize::MAX)
            .iter()
            .rev()
            .find(|e| e.op.is_membership_change())
            .map(|e| e.index);

        // Entries from earlier terms only commit behind one from this term
        if self.append_local(Operation::Noop).is_none() {
            return;
        }
        self.advance_commit();
        self.broadcast_append();
    }

    fn become_follower(
        &mut self,
        term: u64,
        leader_id: Option<NodeId>,
        leader_addr: Option<String>,
    ) {
        let was_leader = self.role == RaftRole::Leader;
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            self.persist_hard_state();
        }
        self.role = RaftRole::Follower;
        self.leader_id = leader_id;
        self.leader_addr = leader_addr;
        self.votes.clear();
        self.progress.clear();
        self.pending_config = None;
        self.reset_election_deadline();

        if was_leader {
            tracing::info!("Node {} stepped down in term {}", self.id, self.term);
            let hint = self.leader_addr.clone();
            self.fail_pending(|| Error::not_leader(hint.clone()));
        }
    }

    fn has_quorum_contact(&self, now: Instant) -> bool {
        let window = self.options.election_timeout;
        let mut acked = usize::from(self.members.contains_key(&self.id));
        for (peer, progress) in &self.progress {
            if self.members.contains_key(peer) && now.duration_since(progress.last_ack) < window {
                acked += 1;
            }
        }
        acked >= self.quorum()
    }

    // ---------------------------------------------------------------------
    // Replication
    // ---------------------------------------------------------------------

    fn peers(&self) -> Vec<(NodeId, String)> {
        self.members
            .iter()
            .filter(|(id, _)| **id != self.id)
            .map(|(id, addr)| (id.clone(), addr.clone()))
            .collect()
    }

    fn broadcast_append(&mut self) {
        for (peer, addr) in self.peers() {
            self.send_append(&peer, &addr);
        }
    }

    fn send_append(&mut self, peer: &NodeId, addr: &str) {
        let now = Instant::now();
        let in_flight_window = self.options.election_timeout;
        let snapshot_index = self.log.snapshot_index();
        let last_index = self.log.last_index();

        let Some(progress) = self.progress.get_mut(peer) else {
            return;
        };
        let busy = progress
            .in_flight
            .is_some_and(|at| now.duration_since(at) < in_flight_window);

        if progress.next_index <= snapshot_index {
            if busy {
                return;
            }
            let Some(snapshot) = self.log.snapshot() else {
                return;
            };
            progress.in_flight = Some(now);
            let req = SnapshotRequest {
                term: self.term,
                leader_id: self.id.clone(),
                leader_addr: self.addr.clone(),
                last_included_index: snapshot.last_included_index,
                last_included_term: snapshot.last_included_term,
                members: snapshot.members.clone(),
                data: snapshot.data.clone(),
            };
            tracing::info!(
                "Sending snapshot at index {} to {}",
                req.last_included_index,
                peer
            );
            let transport = self.transport.clone();
            let tx = self.self_tx.clone();
            let (peer, addr, term) = (peer.clone(), addr.to_string(), self.term);
            tokio::spawn(async move {
                let last_included_index = req.last_included_index;
                let resp = transport.install_snapshot(&peer, &addr, req).await;
                let _ = tx
                    .send(Event::SnapshotResult {
                        peer,
                        term,
                        last_included_index,
                        resp,
                    })
                    .await;
            });
            return;
        }

        progress.next_index = progress.next_index.min(last_index + 1);
        let prev_log_index = progress.next_index - 1;
        let Some(prev_log_term) = self.log.term_at(prev_log_index) else {
            return;
        };
        let entries = if busy {
            Vec::new()
        } else {
            self.log.entries_from(progress.next_index, MAX_APPEND_ENTRIES)
        };
        if !entries.is_empty() {
            progress.in_flight = Some(now);
        }

        let sent = entries.len() as u64;
        let req = AppendRequest {
            term: self.term,
            leader_id: self.id.clone(),
            leader_addr: self.addr.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        };
        let transport = self.transport.clone();
        let tx = self.self_tx.clone();
        let (peer, addr, term) = (peer.clone(), addr.to_string(), self.term);
        tokio::spawn(async move {
            let resp = transport.append_entries(&peer, &addr, req).await;
            let _ = tx
                .send(Event::AppendResult {
                    peer,
                    term,
                    prev_log_index,
                    sent,
                    resp,
                })
                .await;
        });
    }

    fn handle_append(&mut self, req: AppendRequest) -> AppendResponse {
        let reject = |term: u64, conflict_index: u64| AppendResponse {
            term,
            success: false,
            conflict_index,
        };

        if req.term < self.term {
            return reject(self.term, 0);
        }
        if req.term > self.term || self.role != RaftRole::Follower {
            self.become_follower(req.term, None, None);
        }
        if self.leader_id.as_ref() != Some(&req.leader_id) {
            tracing::info!("Following leader {} in term {}", req.leader_id, self.term);
        }
        self.leader_id = Some(req.leader_id.clone());
        self.leader_addr = Some(req.leader_addr.clone());
        self.last_leader_contact = Some(Instant::now());
        self.initialized = true;
        self.reset_election_deadline();

        if self.faulted {
            return reject(self.term, self.log.last_index() + 1);
        }

        let snapshot_index = self.log.snapshot_index();
        if req.prev_log_index > self.log.last_index() {
            return reject(self.term, self.log.last_index() + 1);
        }
        if req.prev_log_index >= snapshot_index
            && self.log.term_at(req.prev_log_index) != Some(req.prev_log_term)
        {
            let conflict_index = self.log.first_index_of_term(req.prev_log_index);
            return reject(self.term, conflict_index);
        }

        // Entries at or below the snapshot are committed and already match
        let mut new_entries: Vec<LogEntry> = Vec::new();
        for entry in req.entries.iter().filter(|e| e.index > snapshot_index) {
            if !new_entries.is_empty() {
                new_entries.push(entry.clone());
                continue;
            }
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if entry.index <= self.commit_index {
                        tracing::error!(
                            "Leader {} conflicts with committed entry {}",
                            req.leader_id,
                            entry.index
                        );
                        return reject(self.term, self.commit_index + 1);
                    }
                    if let Err(e) = self.log.truncate_from(entry.index) {
                        self.fault(e);
                        return reject(self.term, self.log.last_index() + 1);
                    }
                    self.on_truncated(entry.index);
                    new_entries.push(entry.clone());
                }
                None => new_entries.push(entry.clone()),
            }
        }
        if let Err(e) = self.log.append(&new_entries) {
            self.fault(e);
            return reject(self.term, self.log.last_index() + 1);
        }

        let last_new_index = req.prev_log_index + req.entries.len() as u64;
        if req.leader_commit > self.commit_index {
            let commit = req.leader_commit.min(last_new_index);
            if commit > self.commit_index {
                self.commit_index = commit;
                self.persist_hard_state();
                self.apply_committed();
            }
        }

        AppendResponse {
            term: self.term,
            success: true,
            conflict_index: 0,
        }
    }

    fn handle_append_result(
        &mut self,
        peer: NodeId,
        term: u64,
        prev_log_index: u64,
        sent: u64,
        resp: Result<AppendResponse>,
    ) {
        if term != self.term || self.role != RaftRole::Leader {
            if let Ok(resp) = &resp {
                if resp.term > self.term {
                    self.become_follower(resp.term, None, None);
                }
            }
            return;
        }
        if sent > 0 {
            if let Some(progress) = self.progress.get_mut(&peer) {
                progress.in_flight = None;
            }
        }
        let resp = match resp {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!("AppendEntries to {} failed: {}", peer, e);
                return;
            }
        };
        if resp.term > self.term {
            self.become_follower(resp.term, None, None);
            return;
        }

        let last_index = self.log.last_index();
        let Some(progress) = self.progress.get_mut(&peer) else {
            return;
        };
        progress.last_ack = Instant::now();

        if resp.success {
            progress.match_index = progress.match_index.max(prev_log_index + sent);
            progress.next_index = progress.next_index.max(progress.match_index + 1);
            let behind = progress.next_index <= last_index && progress.in_flight.is_none();
            self.advance_commit();
            if behind {
                if let Some(addr) = self.members.get(&peer).cloned() {
                    self.send_append(&peer, &addr);
                }
            }
        } else {
            progress.next_index = resp
                .conflict_index
                .clamp(progress.match_index + 1, last_index + 1);
            tracing::debug!(
                "AppendEntries rejected by {}, retrying from {}",
                peer,
                progress.next_index
            );
        }
    }

    fn handle_snapshot(&mut self, req: SnapshotRequest) -> SnapshotResponse {
        if req.term < self.term {
            return SnapshotResponse { term: self.term };
        }
        if req.term > self.term || self.role != RaftRole::Follower {
            self.become_follower(req.term, None, None);
        }
        self.leader_id = Some(req.leader_id.clone());
        self.leader_addr = Some(req.leader_addr.clone());
        self.last_leader_contact = Some(Instant::now());
        self.initialized = true;
        self.reset_election_deadline();

        if self.faulted || req.last_included_index <= self.last_applied {
            return SnapshotResponse { term: self.term };
        }

        tracing::info!(
            "Installing snapshot from {} at index {}",
            req.leader_id,
            req.last_included_index
        );
        if let Err(e) = self.state_machine.restore(&req.data) {
            self.fault(e);
            return SnapshotResponse { term: self.term };
        }
        let snapshot = Snapshot {
            last_included_index: req.last_included_index,
            last_included_term: req.last_included_term,
            members: req.members,
            data: req.data,
        };
        self.members = snapshot.members.clone();
        if let Err(e) = self.log.install_snapshot(snapshot) {
            self.fault(e);
            return SnapshotResponse { term: self.term };
        }
        self.last_applied = req.last_included_index;
        self.commit_index = self.commit_index.max(req.last_included_index);
        self.persist_hard_state();
        SnapshotResponse { term: self.term }
    }

    fn handle_snapshot_result(
        &mut self,
        peer: NodeId,
        term: u64,
        last_included_index: u64,
        resp: Result<SnapshotResponse>,
    ) {
        if let Some(progress) = self.progress.get_mut(&peer) {
            progress.in_flight = None;
        }
        let resp = match resp {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!("InstallSnapshot to {} failed: {}", peer, e);
                return;
            }
        };
        if resp.term > self.term {
            self.become_follower(resp.term, None, None);
            return;
        }
        if term != self.term || self.role != RaftRole::Leader {
            return;
        }
        if let Some(progress) = self.progress.get_mut(&peer) {
            progress.last_ack = Instant::now();
            progress.match_index = progress.match_index.max(last_included_index);
            progress.next_index = progress.next_index.max(progress.match_index + 1);
        }
        self.advance_commit();
    }

    fn advance_commit(&mut self) {
        if self.role != RaftRole::Leader {
            return;
        }
        let quorum = self.quorum();
        let mut new_commit = self.commit_index;
        for index in (self.commit_index + 1..=self.log.last_index()).rev() {
            // Only entries from the current term are committed by counting
            if self.log.term_at(index) != Some(self.term) {
                break;
            }
            let mut count = usize::from(self.members.contains_key(&self.id));
            for (peer, progress) in &self.progress {
                if self.members.contains_key(peer) && progress.match_index >= index {
                    count += 1;
                }
            }
            if count >= quorum {
                new_commit = index;
                break;
            }
        }
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            self.persist_hard_state();
            self.apply_committed();
        }
    }

    // ---------------------------------------------------------------------
    // Proposals and application
    // ---------------------------------------------------------------------

    fn handle_propose(&mut self, op: Operation, reply: Reply<Result<u64>>) {
        if self.faulted {
            let _ = reply.send(Err(Error::Storage("node storage is faulted".into())));
            return;
        }
        if self.role != RaftRole::Leader {
            let _ = reply.send(Err(Error::not_leader(self.leader_addr.clone())));
            return;
        }
        if op.is_membership_change() {
            if let Err(e) = self.check_membership_change(&op) {
                let _ = reply.send(Err(e));
                return;
            }
        }

        let is_config = op.is_membership_change();
        let Some(index) = self.append_local(op) else {
            let _ = reply.send(Err(Error::Storage("failed to append to raft log".into())));
            return;
        };
        if is_config {
            self.pending_config = Some(index);
        }
        self.pending.insert(index, reply);
        self.advance_commit();
        self.broadcast_append();
    }

    fn check_membership_change(&self, op: &Operation) -> Result<()> {
        if let Some(index) = self.pending_config {
            return Err(Error::MembershipMismatch(format!(
                "membership change at index {} is still in progress",
                index
            )));
        }
        match op {
            Operation::AddVoter { id, .. } if self.members.contains_key(id) => Err(
                Error::MembershipMismatch(format!("{} is already a voter", id)),
            ),
            Operation::RemoveVoter { id } if !self.members.contains_key(id) => Err(
                Error::MembershipMismatch(format!("{} is not a voter", id)),
            ),
            Operation::RemoveVoter { .. } if self.members.len() == 1 => Err(
                Error::MembershipMismatch("cannot remove the last voter".into()),
            ),
            _ => Ok(()),
        }
    }

    /// Append an entry in the current term; None if storage failed
    fn append_local(&mut self, op: Operation) -> Option<u64> {
        let entry = LogEntry {
            term: self.term,
            index: self.log.last_index() + 1,
            op,
        };
        let index = entry.index;
        match self.log.append(std::slice::from_ref(&entry)) {
            Ok(()) => Some(index),
            Err(e) => {
                self.fault(e);
                None
            }
        }
    }

    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.log.entry(index).cloned() else {
                tracing::error!("Committed entry {} missing from the log", index);
                break;
            };
            self.state_machine.apply(&entry);
            self.last_applied = index;

            if self.pending_config == Some(index) {
                self.pending_config = None;
            }
            // Acknowledge before a self-removal steps this node down
            if let Some(reply) = self.pending.remove(&index) {
                let _ = reply.send(Ok(index));
            }
            match &entry.op {
                Operation::AddVoter { id, addr } => self.apply_add_voter(id, addr),
                Operation::RemoveVoter { id } => self.apply_remove_voter(id),
                _ => {}
            }
        }
        self.maybe_snapshot();
    }

    fn apply_add_voter(&mut self, id: &NodeId, addr: &str) {
        tracing::info!("Adding voter {} at {}", id, addr);
        self.members.insert(id.clone(), addr.to_string());
        if self.role == RaftRole::Leader && *id != self.id {
            self.progress.insert(
                id.clone(),
                Progress {
                    next_index: self.log.last_index() + 1,
                    match_index: 0,
                    in_flight: None,
                    last_ack: Instant::now(),
                },
            );
        }
    }

    fn apply_remove_voter(&mut self, id: &NodeId) {
        tracing::info!("Removing voter {}", id);
        self.members.remove(id);
        self.progress.remove(id);
        if *id == self.id && self.role == RaftRole::Leader {
            self.become_follower(self.term, None, None);
        }
    }

    fn maybe_snapshot(&mut self) {
        if self.last_applied < self.log.snapshot_index() + self.options.snapshot_threshold {
            return;
        }
        let Some(last_included_term) = self.log.term_at(self.last_applied) else {
            return;
        };
        let data = match self.state_machine.snapshot() {
            Ok(data) => data,
            Err(e) => {
                tracing::error!("Failed to capture state machine snapshot: {}", e);
                return;
            }
        };
        let snapshot = Snapshot {
            last_included_index: self.last_applied,
            last_included_term,
            members: self.members.clone(),
            data,
        };
        match self.log.install_snapshot(snapshot) {
            Ok(()) => tracing::info!("Compacted raft log through index {}", self.last_applied),
            Err(e) => self.fault(e),
        }
    }

    /// Proposals at or after `index` were overwritten by another leader
    fn on_truncated(&mut self, index: u64) {
        let hint = self.leader_addr.clone();
        let lost: Vec<u64> = self.pending.keys().copied().filter(|i| *i >= index).collect();
        for i in lost {
            if let Some(reply) = self.pending.remove(&i) {
                let _ = reply.send(Err(Error::not_leader(hint.clone())));
            }
        }
        if self.pending_config.is_some_and(|i| i >= index) {
            self.pending_config = None;
        }
    }

    fn fail_pending<F: Fn() -> Error>(&mut self, err: F) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(err()));
        }
    }

    // ---------------------------------------------------------------------
    // Persistence and status
    // ---------------------------------------------------------------------

    /// Returns false if the node faulted
    fn persist_hard_state(&mut self) -> bool {
        let state = HardState {
            term: self.term,
            voted_for: self.voted_for.clone(),
            commit_index: self.commit_index,
        };
        match self.log.save_hard_state(&state) {
            Ok(()) => true,
            Err(e) => {
                self.fault(e);
                false
            }
        }
    }

    fn fault(&mut self, err: Error) {
        if self.faulted {
            return;
        }
        tracing::error!("Raft storage failure on {}: {}", self.id, err);
        self.faulted = true;
        if self.role != RaftRole::Follower {
            self.role = RaftRole::Follower;
            self.leader_id = None;
            self.leader_addr = None;
            self.progress.clear();
        }
        self.fail_pending(|| Error::Storage("node storage is faulted".into()));
    }

    fn stop(&mut self) {
        self.fail_pending(|| Error::Shutdown);
        self.role = RaftRole::Follower;
        self.leader_id = None;
        self.leader_addr = None;
        self.publish_status();
    }

    fn publish_status(&self) {
        let status = RaftStatus {
            node_id: self.id.clone(),
            role: self.role,
            term: self.term,
            leader_id: self.leader_id.clone(),
            leader_addr: self.leader_addr.clone(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.log.last_index(),
            snapshot_index: self.log.snapshot_index(),
            members: self.members.clone(),
            initialized: self.initialized,
            faulted: self.faulted,
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}
