//! Error types for minimeta

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Consensus Errors ===
    #[error("Not leader: current leader is {}", .leader.as_deref().unwrap_or("unknown"))]
    NotLeader { leader: Option<String> },

    #[error("Consensus unavailable: {0}")]
    ConsensusUnavailable(String),

    #[error("Proposal timeout: commit not observed, outcome unknown")]
    ProposalTimeout,

    #[error("Membership mismatch: {0}")]
    MembershipMismatch(String),

    #[error("Raft error: {0}")]
    Raft(String),

    // === Storage Errors ===
    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    // === Metadata Errors ===
    #[error("Schema violation: {0}")]
    Schema(String),

    // === Network Errors ===
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("HTTP error: {0}")]
    Http(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Node is shutting down")]
    Shutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_leader(leader: Option<String>) -> Self {
        Error::NotLeader { leader }
    }

    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotLeader { .. }
                | Error::ConsensusUnavailable(_)
                | Error::ProposalTimeout
                | Error::ConnectionFailed(_)
                | Error::Timeout(_)
        )
    }

    /// Leader hint carried by a redirect, if any
    pub fn leader_hint(&self) -> Option<&str> {
        match self {
            Error::NotLeader { leader } => leader.as_deref(),
            _ => None,
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotLeader { .. } => StatusCode::MISDIRECTED_REQUEST,
            Error::ConsensusUnavailable(_) | Error::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            Error::ProposalTimeout | Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::MembershipMismatch(_) => StatusCode::CONFLICT,
            Error::Schema(_) | Error::InvalidConfig(_) | Error::Serialization(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::ConnectionFailed(_) | Error::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Wire representation used in RPC error responses
    pub fn to_body(&self) -> ErrorBody {
        let kind = match self {
            Error::NotLeader { .. } => ErrorKind::NotLeader,
            Error::ConsensusUnavailable(_) => ErrorKind::ConsensusUnavailable,
            Error::ProposalTimeout => ErrorKind::ProposalTimeout,
            Error::MembershipMismatch(_) => ErrorKind::MembershipMismatch,
            Error::Storage(_) | Error::Corrupted(_) | Error::Io(_) => ErrorKind::Storage,
            Error::Schema(_) => ErrorKind::Schema,
            Error::InvalidConfig(_) | Error::Serialization(_) => ErrorKind::InvalidRequest,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Shutdown => ErrorKind::Shutdown,
            _ => ErrorKind::Internal,
        };
        ErrorBody {
            kind,
            message: self.to_string(),
            leader: self.leader_hint().map(str::to_string),
        }
    }
}

/// Error categories carried over the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotLeader,
    ConsensusUnavailable,
    ProposalTimeout,
    MembershipMismatch,
    Storage,
    Schema,
    InvalidRequest,
    Timeout,
    Shutdown,
    Internal,
}

/// JSON error body returned by the RPC surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
}

impl From<ErrorBody> for Error {
    fn from(body: ErrorBody) -> Self {
        match body.kind {
            ErrorKind::NotLeader => Error::NotLeader {
                leader: body.leader,
            },
            ErrorKind::ConsensusUnavailable => Error::ConsensusUnavailable(body.message),
            ErrorKind::ProposalTimeout => Error::ProposalTimeout,
            ErrorKind::MembershipMismatch => Error::MembershipMismatch(body.message),
            ErrorKind::Storage => Error::Storage(body.message),
            ErrorKind::Schema => Error::Schema(body.message),
            ErrorKind::InvalidRequest => Error::InvalidConfig(body.message),
            ErrorKind::Timeout => Error::Timeout(body.message),
            ErrorKind::Shutdown => Error::Shutdown,
            ErrorKind::Internal => Error::Internal(body.message),
        }
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        (self.to_http_status(), axum::Json(self.to_body())).into_response()
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() || e.is_request() {
            Error::ConnectionFailed(e.to_string())
        } else if e.is_decode() {
            Error::Serialization(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
