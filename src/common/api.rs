//! Request and response bodies of the cluster RPC surface

use crate::common::meta::{MetaEntries, MetaNamespace};
use crate::common::raft::{NodeId, Operation};
use crate::common::{Error, ErrorBody, Result};
use crate::server::raft_node::RaftStatus;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// ProposeEntry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeRequest {
    pub op: Operation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeResponse {
    /// Log index the operation committed at
    pub index: u64,
}

/// QueryMeta
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub namespace: MetaNamespace,
    /// Entity key; empty means every entry in the namespace
    #[serde(default)]
    pub key: String,
    /// Wait until this index is applied before reading
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_index: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub entries: MetaEntries,
    pub applied_index: u64,
    pub served_by: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberRequest {
    pub action: MemberAction,
    pub id: NodeId,
    /// Required when adding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub node_name: String,
    pub addr: String,
    pub raft: RaftStatus,
}

/// `http://{addr}{path}`
pub fn url(addr: &str, path: &str) -> String {
    format!("http://{}{}", addr, path)
}

pub async fn post_json<Req, Resp>(client: &reqwest::Client, url: &str, body: &Req) -> Result<Resp>
where
    Req: Serialize + ?Sized,
    Resp: DeserializeOwned,
{
    send_json(client.post(url).json(body)).await
}

/// Send a request and decode its JSON reply; error bodies map back to [`Error`]
pub async fn send_json<Resp: DeserializeOwned>(request: reqwest::RequestBuilder) -> Result<Resp> {
    let resp = request.send().await?;
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let url = resp.url().to_string();
    let text = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => Err(body.into()),
        Err(_) => Err(Error::Http(format!("{} returned {}: {}", url, status, text))),
    }
}
