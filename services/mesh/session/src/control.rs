//! Control plane for the embedded mesh.
//!
//! The control plane keeps mesh membership: it checks auth keys, hands out
//! node ids and mesh addresses, de-duplicates hostnames and answers lookups by
//! hostname or mesh address. Nodes reach it either in-process
//! (`local://<name>`) or over TCP (`tcp://host:port`), one request per
//! connection.

use crate::handshake::{read_frame, write_frame, FrameError};
use crate::transport::connect_tcp;
use bytes::Bytes;
use mesh_wire::{
    get_meta_str, parse_meta, FastHeader, FrameBuilder, FrameDecoder, FrameType, StatusCode,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// First address of the mesh IPv4 range (100.64.0.0/10)
const MESH_V4_BASE: u32 = 0x6440_0000;
/// Number of usable indexes in the IPv4 range
const MESH_V4_CAPACITY: u32 = (1 << 22) - 2;
/// Mesh IPv6 prefix (fd7a:115c:a1e0::/48)
const MESH_V6_PREFIX: [u16; 3] = [0xfd7a, 0x115c, 0xa1e0];

/// Control plane errors
#[derive(Error, Debug)]
pub enum ControlError {
    /// Missing or rejected auth key
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Unknown node or name
    #[error("not found: {0}")]
    NotFound(String),

    /// Address space exhausted
    #[error("mesh address space exhausted")]
    Exhausted,

    /// Malformed control URL or request
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Control server reported a failure it did not classify
    #[error("control plane error: {0}")]
    Remote(String),

    /// Transport failure
    #[error("control transport: {0}")]
    Frame(#[from] FrameError),

    /// Body encoding failure
    #[error("control body: {0}")]
    Body(#[from] serde_json::Error),
}

impl ControlError {
    fn status_code(&self) -> StatusCode {
        match self {
            ControlError::Unauthorized(_) => StatusCode::Unauthorized,
            ControlError::NotFound(_) => StatusCode::NotFound,
            ControlError::Exhausted => StatusCode::Busy,
            ControlError::Invalid(_) => StatusCode::Unsupported,
            ControlError::Remote(_) | ControlError::Body(_) => StatusCode::Fatal,
            ControlError::Frame(_) => StatusCode::Retryable,
        }
    }

    fn from_reply(code: StatusCode, reason: String) -> Self {
        match code {
            StatusCode::Unauthorized => ControlError::Unauthorized(reason),
            StatusCode::NotFound => ControlError::NotFound(reason),
            StatusCode::Busy => ControlError::Exhausted,
            StatusCode::Unsupported => ControlError::Invalid(reason),
            _ => ControlError::Remote(reason),
        }
    }
}

/// Registration sent by a node joining the mesh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Requested hostname
    pub hostname: String,
    /// Auth key, required for node keys the plane has not seen
    pub auth_key: Option<String>,
    /// Stable node identity
    pub node_key: String,
    /// Remove the node from membership when it leaves
    pub ephemeral: bool,
    /// Where peers reach this node's underlay listener
    pub underlay_addr: SocketAddr,
}

/// Addresses assigned to a registered node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// Node ID
    pub node_id: u64,
    /// Hostname after de-duplication
    pub hostname: String,
    /// Mesh IPv4 address
    pub ipv4: Ipv4Addr,
    /// Mesh IPv6 address
    pub ipv6: Ipv6Addr,
}

/// Lookup answer for a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Node ID
    pub node_id: u64,
    /// Hostname
    pub hostname: String,
    /// Mesh IPv4 address
    pub ipv4: Ipv4Addr,
    /// Mesh IPv6 address
    pub ipv6: Ipv6Addr,
    /// Underlay socket of the peer
    pub underlay_addr: SocketAddr,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResolveRequest {
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct DeregisterRequest {
    node_key: String,
}

#[derive(Debug, Clone)]
struct Member {
    node_id: u64,
    hostname: String,
    ipv4: Ipv4Addr,
    ipv6: Ipv6Addr,
    underlay_addr: SocketAddr,
    ephemeral: bool,
    online: bool,
}

impl Member {
    fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            node_id: self.node_id,
            hostname: self.hostname.clone(),
            ipv4: self.ipv4,
            ipv6: self.ipv6,
            underlay_addr: self.underlay_addr,
        }
    }

    fn matches(&self, name: &str, ip: Option<IpAddr>) -> bool {
        match ip {
            Some(IpAddr::V4(v4)) => self.ipv4 == v4,
            Some(IpAddr::V6(v6)) => self.ipv6 == v6,
            None => self.hostname.eq_ignore_ascii_case(name),
        }
    }
}

#[derive(Debug, Default)]
struct PlaneState {
    /// Members by node key
    members: HashMap<String, Member>,
    /// Last allocated address index
    last_index: u32,
}

/// Mesh membership and address allocation
#[derive(Debug, Default)]
pub struct ControlPlane {
    auth_keys: HashSet<String>,
    state: RwLock<PlaneState>,
}

impl ControlPlane {
    /// Create a control plane that admits any node
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a control plane that requires one of the given auth keys
    pub fn with_auth_keys<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self {
            auth_keys: keys.into_iter().map(Into::into).collect(),
            state: RwLock::new(PlaneState::default()),
        }
    }

    /// Register a node, re-admitting known node keys without an auth key
    pub async fn register(&self, req: RegisterRequest) -> Result<RegisterResponse, ControlError> {
        let mut state = self.state.write().await;

        let known = state.members.contains_key(&req.node_key);
        if !known && !self.auth_keys.is_empty() {
            match req.auth_key.as_deref() {
                Some(key) if self.auth_keys.contains(key) => {}
                Some(_) => {
                    return Err(ControlError::Unauthorized("invalid auth key".to_string()));
                }
                None => {
                    return Err(ControlError::Unauthorized(
                        "auth key required to join this mesh".to_string(),
                    ));
                }
            }
        }

        let hostname = unique_hostname(&state, &req.node_key, &req.hostname);

        if !known {
            if state.last_index >= MESH_V4_CAPACITY {
                return Err(ControlError::Exhausted);
            }
            state.last_index += 1;
            let index = state.last_index;
            let member = Member {
                node_id: u64::from(index),
                hostname: hostname.clone(),
                ipv4: mesh_ipv4(index),
                ipv6: mesh_ipv6(index),
                underlay_addr: req.underlay_addr,
                ephemeral: req.ephemeral,
                online: true,
            };
            state.members.insert(req.node_key.clone(), member);
        }

        let member = state
            .members
            .get_mut(&req.node_key)
            .ok_or_else(|| ControlError::NotFound(req.node_key.clone()))?;
        member.hostname = hostname;
        member.underlay_addr = req.underlay_addr;
        member.ephemeral = req.ephemeral;
        member.online = true;

        info!(
            "Node {} registered as {} ({}, {})",
            member.node_id, member.hostname, member.ipv4, member.ipv6
        );

        Ok(RegisterResponse {
            node_id: member.node_id,
            hostname: member.hostname.clone(),
            ipv4: member.ipv4,
            ipv6: member.ipv6,
        })
    }

    /// Look up an online member by hostname or mesh address
    pub async fn resolve(&self, name: &str) -> Result<PeerInfo, ControlError> {
        let trimmed = name.trim_start_matches('[').trim_end_matches(']');
        let ip = trimmed.parse::<IpAddr>().ok();

        let state = self.state.read().await;
        state
            .members
            .values()
            .find(|m| m.online && m.matches(trimmed, ip))
            .map(Member::peer_info)
            .ok_or_else(|| ControlError::NotFound(format!("no online node named {}", name)))
    }

    /// Take a node offline; ephemeral nodes are forgotten
    pub async fn deregister(&self, node_key: &str) -> Result<(), ControlError> {
        let mut state = self.state.write().await;

        let ephemeral = match state.members.get_mut(node_key) {
            Some(member) => {
                member.online = false;
                member.ephemeral
            }
            None => return Err(ControlError::NotFound("unknown node key".to_string())),
        };

        if ephemeral {
            if let Some(member) = state.members.remove(node_key) {
                info!("Ephemeral node {} ({}) removed", member.node_id, member.hostname);
            }
        } else {
            debug!("Node key {} went offline", node_key);
        }
        Ok(())
    }

    /// Number of members currently online
    pub async fn online_count(&self) -> usize {
        let state = self.state.read().await;
        state.members.values().filter(|m| m.online).count()
    }

    /// Number of members known, online or not
    pub async fn member_count(&self) -> usize {
        self.state.read().await.members.len()
    }
}

fn unique_hostname(state: &PlaneState, node_key: &str, requested: &str) -> String {
    let taken = |candidate: &str| {
        state
            .members
            .iter()
            .any(|(key, m)| key != node_key && m.online && m.hostname.eq_ignore_ascii_case(candidate))
    };

    if !taken(requested) {
        return requested.to_string();
    }
    (1u32..)
        .map(|n| format!("{}-{}", requested, n))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| requested.to_string())
}

fn mesh_ipv4(index: u32) -> Ipv4Addr {
    Ipv4Addr::from(MESH_V4_BASE + index)
}

fn mesh_ipv6(index: u32) -> Ipv6Addr {
    let [a, b, c] = MESH_V6_PREFIX;
    Ipv6Addr::new(a, b, c, 0, 0, 0, (index >> 16) as u16, index as u16)
}

/// Where a control plane lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEndpoint {
    /// In-process plane identified by name
    Local(String),
    /// Remote plane at `host:port`
    Tcp(String),
}

impl ControlEndpoint {
    /// Parse a control URL (`local://name` or `tcp://host:port`)
    pub fn parse(url: &str) -> Result<Self, ControlError> {
        if let Some(name) = url.strip_prefix("local://") {
            if name.is_empty() {
                return Err(ControlError::Invalid("local control URL needs a name".to_string()));
            }
            return Ok(ControlEndpoint::Local(name.to_string()));
        }

        if let Some(addr) = url.strip_prefix("tcp://") {
            let addr = addr.trim_end_matches('/');
            match addr.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                    return Ok(ControlEndpoint::Tcp(addr.to_string()));
                }
                _ => {
                    return Err(ControlError::Invalid(format!(
                        "control URL {} must be tcp://host:port",
                        url
                    )));
                }
            }
        }

        Err(ControlError::Invalid(format!(
            "unsupported control URL scheme: {}",
            url
        )))
    }
}

/// Client side of the control plane
#[derive(Debug, Clone)]
pub enum ControlClient {
    /// Plane living in this process
    Local(Arc<ControlPlane>),
    /// Plane reached over TCP at `host:port`
    Remote(String),
}

impl ControlClient {
    /// Register this node
    pub async fn register(&self, req: RegisterRequest) -> Result<RegisterResponse, ControlError> {
        match self {
            ControlClient::Local(plane) => plane.register(req).await,
            ControlClient::Remote(addr) => remote_call(addr, FrameType::Register, &req).await,
        }
    }

    /// Resolve a hostname or mesh address
    pub async fn resolve(&self, name: &str) -> Result<PeerInfo, ControlError> {
        match self {
            ControlClient::Local(plane) => plane.resolve(name).await,
            ControlClient::Remote(addr) => {
                let req = ResolveRequest {
                    name: name.to_string(),
                };
                remote_call(addr, FrameType::Resolve, &req).await
            }
        }
    }

    /// Leave the mesh
    pub async fn deregister(&self, node_key: &str) -> Result<(), ControlError> {
        match self {
            ControlClient::Local(plane) => plane.deregister(node_key).await,
            ControlClient::Remote(addr) => {
                let req = DeregisterRequest {
                    node_key: node_key.to_string(),
                };
                remote_call(addr, FrameType::Deregister, &req).await
            }
        }
    }
}

async fn remote_call<Req, Resp>(addr: &str, typ: FrameType, req: &Req) -> Result<Resp, ControlError>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let decoder = FrameDecoder::new();
    let mut stream = connect_tcp(addr).await.map_err(FrameError::Io)?;

    let body = serde_json::to_vec(req)?;
    let request = FrameBuilder::new(FastHeader::new(typ, 0, 0))
        .payload(body)
        .build(decoder.max_frame_size())
        .map_err(FrameError::Codec)?;
    write_frame(&mut stream, &request).await?;

    let reply = read_frame(&mut stream, &decoder).await?;
    if reply.fast.typ != FrameType::ControlReply {
        return Err(FrameError::Unexpected(reply.fast.typ).into());
    }

    if reply.fast.code != StatusCode::Ok {
        let meta = parse_meta(&reply.meta_raw).map_err(FrameError::Codec)?;
        let reason = get_meta_str(&meta, "error")
            .unwrap_or("control request failed")
            .to_string();
        return Err(ControlError::from_reply(reply.fast.code, reason));
    }

    Ok(serde_json::from_slice(&reply.payload)?)
}

/// Pause after a failed accept before polling the listener again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// TCP front end for a control plane
pub struct ControlServer;

impl ControlServer {
    /// Serve control requests until the shutdown flag turns true
    pub async fn serve(
        listener: TcpListener,
        plane: Arc<ControlPlane>,
        mut shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        info!("Control plane listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                biased;

                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                    info!("Control plane shutting down");
                    return Ok(());
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let plane = plane.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_control_conn(stream, plane).await {
                                warn!("Control request from {} failed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Control accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }
    }
}

async fn handle_control_conn(mut stream: TcpStream, plane: Arc<ControlPlane>) -> Result<(), FrameError> {
    let decoder = FrameDecoder::new();
    let frame = read_frame(&mut stream, &decoder).await?;
    debug!("Control request {:?}", frame.fast.typ);

    let result = match frame.fast.typ {
        FrameType::Register => match decode_body::<RegisterRequest>(&frame.payload) {
            Ok(req) => plane.register(req).await.and_then(encode_body),
            Err(e) => Err(e),
        },
        FrameType::Resolve => match decode_body::<ResolveRequest>(&frame.payload) {
            Ok(req) => plane.resolve(&req.name).await.and_then(encode_body),
            Err(e) => Err(e),
        },
        FrameType::Deregister => match decode_body::<DeregisterRequest>(&frame.payload) {
            Ok(req) => plane.deregister(&req.node_key).await.and_then(encode_body),
            Err(e) => Err(e),
        },
        other => Err(ControlError::Invalid(format!("{:?} is not a control request", other))),
    };

    let reply = match result {
        Ok(body) => FrameBuilder::new(frame.fast.reply(FrameType::ControlReply, StatusCode::Ok))
            .payload(body)
            .build(decoder.max_frame_size())?,
        Err(e) => FrameBuilder::new(frame.fast.reply(FrameType::ControlReply, e.status_code()))
            .meta_insert_str("error", &e.to_string())
            .build(decoder.max_frame_size())?,
    };
    write_frame(&mut stream, &reply).await
}

fn decode_body<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ControlError> {
    serde_json::from_slice(payload).map_err(|e| ControlError::Invalid(e.to_string()))
}

fn encode_body<T: Serialize>(value: T) -> Result<Bytes, ControlError> {
    Ok(Bytes::from(serde_json::to_vec(&value)?))
}
