//! Cluster node identity

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Identity of a cluster node: where it can be reached and what it is called.
///
/// Assigned once at startup from the bound address and never changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterNodeIdentity {
    host: String,
    port: u16,
    name: String,
}

impl ClusterNodeIdentity {
    /// Identity named `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let name = format!("{}:{}", host, port);
        Self { host, port, name }
    }

    /// Derive the identity from the address a listener actually bound to.
    ///
    /// Unspecified bind addresses (0.0.0.0 / ::) advertise `advertise_host`,
    /// falling back to loopback.
    pub fn from_bound(bound: SocketAddr, advertise_host: Option<&str>) -> Self {
        let host = match advertise_host {
            Some(host) => host.to_string(),
            None if bound.ip().is_unspecified() => "127.0.0.1".to_string(),
            None => bound.ip().to_string(),
        };
        Self::new(host, bound.port())
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `host:port` address peers use to reach this node
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ClusterNodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Validate a `host:port` peer address
pub fn parse_peer_addr(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidConfig(format!("peer address '{}' is not host:port", addr)))?;
    if host.is_empty() {
        return Err(Error::InvalidConfig(format!(
            "peer address '{}' has an empty host",
            addr
        )));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("peer address '{}' has a bad port", addr)))?;
    if port == 0 {
        return Err(Error::InvalidConfig(format!(
            "peer address '{}' must name a concrete port",
            addr
        )));
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_from_bound() {
        let id = ClusterNodeIdentity::from_bound("0.0.0.0:6123".parse().unwrap(), None);
        assert_eq!(id.name(), "127.0.0.1:6123");
        assert_eq!(id.port(), 6123);

        let id = ClusterNodeIdentity::from_bound("0.0.0.0:6123".parse().unwrap(), Some("node-a"));
        assert_eq!(id.addr(), "node-a:6123");

        let id = ClusterNodeIdentity::from_bound("10.1.2.3:7000".parse().unwrap(), None);
        assert_eq!(id.to_string(), "10.1.2.3:7000");
    }

    #[test]
    fn test_parse_peer_addr() {
        assert_eq!(
            parse_peer_addr("coord-1:6000").unwrap(),
            ("coord-1".to_string(), 6000)
        );
        assert!(parse_peer_addr("coord-1").is_err());
        assert!(parse_peer_addr(":6000").is_err());
        assert!(parse_peer_addr("coord-1:http").is_err());
        assert!(parse_peer_addr("coord-1:0").is_err());
    }
}
