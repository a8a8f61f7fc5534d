//! Raft messages exchanged between cluster nodes

use crate::common::meta::{AttrMap, MetaNamespace};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Node identifier inside the consensus group (the node's `host:port` name)
pub type NodeId = String;

/// Voting members: node id → RPC address
pub type Members = BTreeMap<NodeId, String>;

/// State-changing operation carried by a log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Merge attributes into an entry, creating it if absent
    Put {
        namespace: MetaNamespace,
        key: String,
        attrs: AttrMap,
    },
    /// Remove a whole entry
    Delete { namespace: MetaNamespace, key: String },
    /// Appended by every new leader to commit entries from earlier terms
    Noop,
    AddVoter { id: NodeId, addr: String },
    RemoveVoter { id: NodeId },
}

impl Operation {
    pub fn is_membership_change(&self) -> bool {
        matches!(self, Operation::AddVoter { .. } | Operation::RemoveVoter { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub op: Operation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: u64,
    pub leader_id: NodeId,
    /// Address clients are redirected to
    pub leader_addr: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: u64,
    pub success: bool,
    /// On rejection, the index the leader should retry from
    pub conflict_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub leader_addr: String,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub members: Members,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub term: u64,
}
