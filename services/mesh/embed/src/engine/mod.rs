//! Contract between the runtime and the networking engine that joins the mesh.
//!
//! The runtime never speaks the mesh protocol itself. It hands a
//! [`NodeConfig`] to an [`Engine`], then drives the resulting
//! [`EngineSession`] through `up`, `listen`, `dial` and `close`.

pub mod mesh;

pub use mesh::{EngineSettings, MeshEngine};

use crate::error::MeshError;
use async_trait::async_trait;
use mesh_session::MeshStream;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Engine failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Could not reach or join the mesh
    #[error("join failed: {0}")]
    Join(String),

    /// Control plane refused the node's credentials
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Outbound stream could not be opened
    #[error("connect failed: {0}")]
    Connect(String),

    /// Virtual port already bound
    #[error("address in use: {0}")]
    AddrInUse(String),

    /// Malformed address, or not one of the node's addresses
    #[error("invalid address: {0}")]
    InvalidAddr(String),

    /// Session already closed or not up
    #[error("session closed")]
    Closed,
}

impl EngineError {
    /// Error reported for a failed `listen`
    pub fn into_listen_error(self) -> MeshError {
        match self {
            EngineError::AddrInUse(_) | EngineError::InvalidAddr(_) => {
                MeshError::Listen(self.to_string())
            }
            other => MeshError::Network(other.to_string()),
        }
    }
}

impl From<EngineError> for MeshError {
    fn from(e: EngineError) -> Self {
        MeshError::Network(e.to_string())
    }
}

/// Network kinds accepted by `listen` and `dial`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    /// Stream, either family
    Tcp,
    /// Stream, IPv4 only
    Tcp4,
    /// Stream, IPv6 only
    Tcp6,
    /// Datagram, either family
    Udp,
    /// Datagram, IPv4 only
    Udp4,
    /// Datagram, IPv6 only
    Udp6,
}

impl Network {
    /// Name as written by callers
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Udp => "udp",
            Network::Udp4 => "udp4",
            Network::Udp6 => "udp6",
        }
    }

    /// Whether the datagram port namespace is used
    pub fn is_datagram(self) -> bool {
        matches!(self, Network::Udp | Network::Udp4 | Network::Udp6)
    }

    /// Whether the kind is restricted to IPv6
    pub fn is_v6_only(self) -> bool {
        matches!(self, Network::Tcp6 | Network::Udp6)
    }

    /// Whether an address family may be used with this kind
    pub fn allows(self, ip: IpAddr) -> bool {
        match self {
            Network::Tcp4 | Network::Udp4 => ip.is_ipv4(),
            Network::Tcp6 | Network::Udp6 => ip.is_ipv6(),
            Network::Tcp | Network::Udp => true,
        }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            "udp" => Ok(Network::Udp),
            "udp4" => Ok(Network::Udp4),
            "udp6" => Ok(Network::Udp6),
            other => Err(format!("unsupported network {:?}", other)),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Node settings handed to the engine at start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// State directory
    pub dir: Option<PathBuf>,
    /// Requested hostname
    pub hostname: String,
    /// Auth key presented to the control plane
    pub auth_key: Option<String>,
    /// Control plane URL
    pub control_url: String,
    /// Leave no membership behind on close
    pub ephemeral: bool,
}

/// Identity of a node that is up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    /// Node ID assigned by the control plane
    pub node_id: u64,
    /// Hostname after de-duplication
    pub hostname: String,
    /// Mesh IPv4 address
    pub ipv4: Ipv4Addr,
    /// Mesh IPv6 address
    pub ipv6: Ipv6Addr,
}

/// A stream opened by `dial` or delivered to a listener
#[derive(Debug)]
pub struct OpenedStream {
    /// Stream bytes
    pub stream: MeshStream,
    /// Mesh address of this end
    pub local_addr: String,
    /// Mesh address of the other end
    pub remote_addr: String,
}

/// Factory for node sessions
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Prepare a node; nothing is announced to the mesh yet
    async fn start(&self, config: NodeConfig) -> Result<Arc<dyn EngineSession>, EngineError>;
}

/// One started node
#[async_trait]
pub trait EngineSession: Send + Sync {
    /// Join and authenticate; resolves once the node is routable
    async fn up(&self) -> Result<NodeStatus, EngineError>;

    /// Bind a virtual port; inbound streams are pushed into `queue`
    async fn listen(
        &self,
        network: Network,
        addr: &str,
        queue: mpsc::Sender<OpenedStream>,
    ) -> Result<Box<dyn EngineBinding>, EngineError>;

    /// Open a stream to `addr`
    async fn dial(&self, network: Network, addr: &str) -> Result<OpenedStream, EngineError>;

    /// Leave the mesh and release every binding
    async fn close(&self);
}

/// A bound virtual port; dropping it releases the port
pub trait EngineBinding: Send + Sync {
    /// Address actually bound
    fn local_addr(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_names() {
        for name in ["tcp", "tcp4", "tcp6", "udp", "udp4", "udp6"] {
            let network: Network = name.parse().unwrap();
            assert_eq!(network.as_str(), name);
        }
        assert!("sctp".parse::<Network>().is_err());
        assert!("TCP".parse::<Network>().is_err());
        assert!(Network::Udp6.is_datagram());
        assert!(!Network::Tcp.is_datagram());
        assert!(!Network::Tcp4.allows("fd7a:115c:a1e0::1".parse().unwrap()));
        assert!(Network::Tcp.allows("100.64.0.1".parse().unwrap()));
    }

    #[test]
    fn test_engine_error_mapping() {
        let in_use = EngineError::AddrInUse("tcp port 80".to_string()).into_listen_error();
        assert!(matches!(in_use, MeshError::Listen(_)));

        let closed = EngineError::Closed.into_listen_error();
        assert!(matches!(closed, MeshError::Network(_)));

        let auth: MeshError = EngineError::Auth("invalid auth key".to_string()).into();
        assert_eq!(auth.to_string(), "authentication failed: invalid auth key");
    }
}
