//! Reference mesh engine.
//!
//! Nodes join through a control plane (in-process or TCP), carry streams on a
//! per-node underlay TCP listener and route each inbound stream to a listener
//! queue by `(transport, port)`. There is no NAT traversal, relaying or
//! packet encryption.

use super::{
    Engine, EngineBinding, EngineError, EngineSession, Network, NodeConfig, NodeStatus,
    OpenedStream,
};
use crate::config::RuntimeConfig;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mesh_session::{
    answer_open, connect_tcp, listen_tcp, read_frame, send_open, ControlClient, ControlEndpoint,
    ControlError, ControlPlane, FrameError, MeshStream, OpenOutcome, OpenRequest, RegisterRequest,
};
use mesh_wire::{FrameDecoder, StatusCode};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::instrument::WithSubscriber;
use tracing::{debug, info, warn};

/// File holding a persistent node's identity inside its state directory
pub const STATE_FILE: &str = "mesh-state.json";

const EPHEMERAL_PORT_FIRST: u16 = 49152;
const EPHEMERAL_PORT_COUNT: u16 = u16::MAX - EPHEMERAL_PORT_FIRST + 1;

/// Engine-wide settings taken from the runtime configuration
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Time an inbound connection has to send its `Open` frame
    pub handshake_timeout: Duration,
    /// Local address each node's underlay listener binds
    pub underlay_bind: SocketAddr,
    /// Largest frame accepted on the wire
    pub max_frame_size: usize,
}

impl From<&RuntimeConfig> for EngineSettings {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout,
            underlay_bind: config.underlay_bind,
            max_frame_size: config.max_frame_size,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

/// Engine joining nodes through `local://` or `tcp://` control planes
pub struct MeshEngine {
    settings: EngineSettings,
    planes: DashMap<String, Arc<ControlPlane>>,
}

impl MeshEngine {
    /// Create an engine with the given settings
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            planes: DashMap::new(),
        }
    }

    /// Create an engine from the runtime configuration
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(EngineSettings::from(config))
    }

    /// Serve `local://<name>` from the given plane
    pub fn with_control(self, name: impl Into<String>, plane: Arc<ControlPlane>) -> Self {
        self.planes.insert(name.into(), plane);
        self
    }

    /// In-process plane for `local://<name>`, created open on first use
    pub fn control_plane(&self, name: &str) -> Arc<ControlPlane> {
        self.planes
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ControlPlane::new()))
            .clone()
    }

    fn control_client(&self, url: &str) -> Result<ControlClient, EngineError> {
        match ControlEndpoint::parse(url).map_err(|e| EngineError::Join(e.to_string()))? {
            ControlEndpoint::Local(name) => Ok(ControlClient::Local(self.control_plane(&name))),
            ControlEndpoint::Tcp(addr) => Ok(ControlClient::Remote(addr)),
        }
    }
}

impl Default for MeshEngine {
    fn default() -> Self {
        Self::new(EngineSettings::default())
    }
}

#[async_trait]
impl Engine for MeshEngine {
    async fn start(&self, config: NodeConfig) -> Result<Arc<dyn EngineSession>, EngineError> {
        let control = self.control_client(&config.control_url)?;
        let node_key = load_or_create_node_key(config.dir.as_deref(), config.ephemeral).await?;

        let listener = listen_tcp(self.settings.underlay_bind).await.map_err(|e| {
            EngineError::Join(format!("underlay bind {}: {}", self.settings.underlay_bind, e))
        })?;
        let underlay_addr = listener
            .local_addr()
            .map_err(|e| EngineError::Join(format!("underlay address: {}", e)))?;

        info!(
            component = "engine",
            "Node {} started, underlay on {}", config.hostname, underlay_addr
        );

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(MeshSession {
            settings: self.settings.clone(),
            control,
            hostname: config.hostname,
            auth_key: config.auth_key,
            ephemeral: config.ephemeral,
            node_key,
            underlay_addr,
            underlay: Mutex::new(Some(listener)),
            node: RwLock::new(None),
            ports: Arc::new(PortTable::default()),
            shutdown,
            accept_task: Mutex::new(None),
            next_source_port: AtomicU16::new(0),
        }))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedNode {
    node_key: String,
}

async fn load_or_create_node_key(dir: Option<&Path>, ephemeral: bool) -> Result<String, EngineError> {
    let dir = match dir {
        Some(dir) if !ephemeral => dir,
        _ => return Ok(uuid::Uuid::new_v4().to_string()),
    };
    let path = dir.join(STATE_FILE);

    match tokio::fs::read(&path).await {
        Ok(raw) => {
            let state: PersistedNode = serde_json::from_slice(&raw)
                .map_err(|e| EngineError::Join(format!("corrupt node state {:?}: {}", path, e)))?;
            debug!(component = "engine", "Loaded node key from {:?}", path);
            return Ok(state.node_key);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(EngineError::Join(format!("read {:?}: {}", path, e))),
    }

    let state = PersistedNode {
        node_key: uuid::Uuid::new_v4().to_string(),
    };
    let body = serde_json::to_vec_pretty(&state)
        .map_err(|e| EngineError::Join(format!("encode node state: {}", e)))?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| EngineError::Join(format!("create {:?}: {}", dir, e)))?;
    tokio::fs::write(&path, body)
        .await
        .map_err(|e| EngineError::Join(format!("write {:?}: {}", path, e)))?;
    info!(component = "engine", "Created node state at {:?}", path);
    Ok(state.node_key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Transport {
    Stream,
    Datagram,
}

impl Transport {
    fn of(datagram: bool) -> Self {
        if datagram {
            Transport::Datagram
        } else {
            Transport::Stream
        }
    }

    fn name(self) -> &'static str {
        match self {
            Transport::Stream => "tcp",
            Transport::Datagram => "udp",
        }
    }
}

type PortKey = (Transport, u16);

struct PortEntry {
    id: u64,
    queue: mpsc::Sender<OpenedStream>,
    local_addr: String,
}

#[derive(Default)]
struct PortTable {
    entries: DashMap<PortKey, PortEntry>,
    next_id: AtomicU64,
    next_ephemeral: AtomicU16,
}

impl PortTable {
    fn bind(
        &self,
        transport: Transport,
        port: u16,
        queue: mpsc::Sender<OpenedStream>,
        local_addr: impl Fn(u16) -> String,
    ) -> Result<(u64, u16, String), EngineError> {
        if port != 0 {
            return self.try_bind((transport, port), queue, &local_addr);
        }

        for _ in 0..EPHEMERAL_PORT_COUNT {
            let offset = self.next_ephemeral.fetch_add(1, Ordering::Relaxed) % EPHEMERAL_PORT_COUNT;
            let candidate = EPHEMERAL_PORT_FIRST + offset;
            if let Ok(bound) = self.try_bind((transport, candidate), queue.clone(), &local_addr) {
                return Ok(bound);
            }
        }
        Err(EngineError::AddrInUse(format!(
            "no free ephemeral {} port",
            transport.name()
        )))
    }

    fn try_bind(
        &self,
        key: PortKey,
        queue: mpsc::Sender<OpenedStream>,
        local_addr: &impl Fn(u16) -> String,
    ) -> Result<(u64, u16, String), EngineError> {
        match self.entries.entry(key) {
            Entry::Occupied(_) => Err(EngineError::AddrInUse(format!(
                "{} port {}",
                key.0.name(),
                key.1
            ))),
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let addr = local_addr(key.1);
                slot.insert(PortEntry {
                    id,
                    queue,
                    local_addr: addr.clone(),
                });
                Ok((id, key.1, addr))
            }
        }
    }

    /// Reserve a queue slot on a bound port
    fn reserve(&self, key: PortKey) -> Result<(mpsc::OwnedPermit<OpenedStream>, String), OpenOutcome> {
        let (queue, local_addr) = match self.entries.get(&key) {
            Some(entry) => (entry.queue.clone(), entry.local_addr.clone()),
            None => return Err(not_listening(key)),
        };

        match queue.try_reserve_owned() {
            Ok(permit) => Ok((permit, local_addr)),
            Err(TrySendError::Full(_)) => Err(OpenOutcome::Rejected {
                code: StatusCode::Busy,
                reason: format!("accept backlog full on {} port {}", key.0.name(), key.1),
            }),
            Err(TrySendError::Closed(_)) => Err(not_listening(key)),
        }
    }

    fn unbind(&self, key: PortKey, id: u64) {
        self.entries.remove_if(&key, |_, entry| entry.id == id);
    }
}

fn not_listening(key: PortKey) -> OpenOutcome {
    OpenOutcome::Rejected {
        code: StatusCode::NotFound,
        reason: format!("no listener on {} port {}", key.0.name(), key.1),
    }
}

/// Port bound by `listen`; released when dropped
struct PortBinding {
    ports: Arc<PortTable>,
    key: PortKey,
    id: u64,
    local_addr: String,
}

impl EngineBinding for PortBinding {
    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }
}

impl Drop for PortBinding {
    fn drop(&mut self) {
        self.ports.unbind(self.key, self.id);
        debug!(
            component = "engine",
            "Released {} port {}",
            self.key.0.name(),
            self.key.1
        );
    }
}

struct MeshSession {
    settings: EngineSettings,
    control: ControlClient,
    hostname: String,
    auth_key: Option<String>,
    ephemeral: bool,
    node_key: String,
    underlay_addr: SocketAddr,
    underlay: Mutex<Option<TcpListener>>,
    node: RwLock<Option<NodeStatus>>,
    ports: Arc<PortTable>,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    next_source_port: AtomicU16,
}

impl MeshSession {
    fn status(&self) -> Result<NodeStatus, EngineError> {
        if *self.shutdown.borrow() {
            return Err(EngineError::Closed);
        }
        self.node.read().clone().ok_or(EngineError::Closed)
    }

    fn source_addr(&self, node: &NodeStatus, network: Network) -> String {
        let offset = self.next_source_port.fetch_add(1, Ordering::Relaxed) % EPHEMERAL_PORT_COUNT;
        let port = EPHEMERAL_PORT_FIRST + offset;
        if network.is_v6_only() {
            format_addr(IpAddr::V6(node.ipv6), port)
        } else {
            format_addr(IpAddr::V4(node.ipv4), port)
        }
    }

    fn dial_local(
        &self,
        key: PortKey,
        addr: &str,
        src_addr: String,
    ) -> Result<OpenedStream, EngineError> {
        let (permit, local_addr) = self.ports.reserve(key).map_err(|refused| refusal(addr, refused))?;
        let (near, far) = MeshStream::memory_pair();
        permit.send(OpenedStream {
            stream: far,
            local_addr,
            remote_addr: src_addr.clone(),
        });
        debug!(component = "engine", "Dialed own port {} in memory", addr);
        Ok(OpenedStream {
            stream: near,
            local_addr: src_addr,
            remote_addr: addr.to_string(),
        })
    }
}

#[async_trait]
impl EngineSession for MeshSession {
    async fn up(&self) -> Result<NodeStatus, EngineError> {
        if *self.shutdown.borrow() {
            return Err(EngineError::Closed);
        }
        if let Some(status) = self.node.read().clone() {
            return Ok(status);
        }

        let joined = self
            .control
            .register(RegisterRequest {
                hostname: self.hostname.clone(),
                auth_key: self.auth_key.clone(),
                node_key: self.node_key.clone(),
                ephemeral: self.ephemeral,
                underlay_addr: self.underlay_addr,
            })
            .await
            .map_err(|e| match e {
                ControlError::Unauthorized(reason) => EngineError::Auth(reason),
                other => EngineError::Join(other.to_string()),
            })?;

        let status = NodeStatus {
            node_id: joined.node_id,
            hostname: joined.hostname,
            ipv4: joined.ipv4,
            ipv6: joined.ipv6,
        };
        *self.node.write() = Some(status.clone());

        let listener = self.underlay.lock().take();
        if let Some(listener) = listener {
            let inbound = Arc::new(Inbound {
                ports: self.ports.clone(),
                handshake_timeout: self.settings.handshake_timeout,
                max_frame_size: self.settings.max_frame_size,
            });
            let task = tokio::spawn(
                accept_loop(listener, inbound, self.shutdown.subscribe()).with_current_subscriber(),
            );
            *self.accept_task.lock() = Some(task);
        }

        info!(
            component = "engine",
            "Node {} is up as {} ({}, {})", status.node_id, status.hostname, status.ipv4, status.ipv6
        );
        Ok(status)
    }

    async fn listen(
        &self,
        network: Network,
        addr: &str,
        queue: mpsc::Sender<OpenedStream>,
    ) -> Result<Box<dyn EngineBinding>, EngineError> {
        let node = self.status()?;
        let (host, port) = split_host_port(addr)?;

        let bind_ip = match host_target(host, &node) {
            HostTarget::Any => None,
            HostTarget::Own(ip) => Some(ip),
            HostTarget::Remote => {
                return Err(EngineError::InvalidAddr(format!(
                    "{} is not an address of this node",
                    host
                )));
            }
        };
        if let Some(ip) = bind_ip {
            if !network.allows(ip) {
                return Err(EngineError::InvalidAddr(format!(
                    "{} cannot be used with {}",
                    ip, network
                )));
            }
        }

        let use_v6 = network.is_v6_only() || matches!(bind_ip, Some(IpAddr::V6(_)));
        let node_ip = if use_v6 {
            IpAddr::V6(node.ipv6)
        } else {
            IpAddr::V4(node.ipv4)
        };

        let transport = Transport::of(network.is_datagram());
        let (id, port, local_addr) =
            self.ports
                .bind(transport, port, queue, |port| format_addr(node_ip, port))?;

        info!(component = "engine", "Listening on {} {}", network, local_addr);
        Ok(Box::new(PortBinding {
            ports: self.ports.clone(),
            key: (transport, port),
            id,
            local_addr,
        }))
    }

    async fn dial(&self, network: Network, addr: &str) -> Result<OpenedStream, EngineError> {
        let node = self.status()?;
        let (host, port) = split_host_port(addr)?;
        if port == 0 {
            return Err(EngineError::InvalidAddr(format!("{}: port 0 cannot be dialed", addr)));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            if !network.allows(ip) {
                return Err(EngineError::InvalidAddr(format!(
                    "{} cannot be used with {}",
                    ip, network
                )));
            }
        }

        let key = (Transport::of(network.is_datagram()), port);
        let src_addr = self.source_addr(&node, network);
        if !matches!(host_target(host, &node), HostTarget::Remote) {
            return self.dial_local(key, addr, src_addr);
        }

        let peer = self
            .control
            .resolve(host)
            .await
            .map_err(|e| EngineError::Connect(format!("{}: {}", addr, e)))?;
        let mut stream = connect_tcp(peer.underlay_addr)
            .await
            .map_err(|e| EngineError::Connect(format!("{}: {}", addr, e)))?;

        let request = OpenRequest {
            src_node: node.node_id,
            dst_node: peer.node_id,
            port,
            datagram: network.is_datagram(),
            src_addr: src_addr.clone(),
        };
        let decoder = FrameDecoder::with_max_frame_size(self.settings.max_frame_size);
        let outcome = send_open(&mut stream, &request, &decoder)
            .await
            .map_err(|e| EngineError::Connect(format!("{}: {}", addr, e)))?;

        match outcome {
            OpenOutcome::Accepted => {
                debug!(
                    component = "engine",
                    "Opened {} stream to {} (node {})", network, addr, peer.node_id
                );
                Ok(OpenedStream {
                    stream: MeshStream::Tcp(stream),
                    local_addr: src_addr,
                    remote_addr: addr.to_string(),
                })
            }
            refused => Err(refusal(addr, refused)),
        }
    }

    async fn close(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }

        self.ports.entries.clear();
        self.underlay.lock().take();
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }

        let joined = self.node.read().is_some();
        if joined {
            let leave = self.control.deregister(&self.node_key);
            match tokio::time::timeout(self.settings.handshake_timeout, leave).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(component = "engine", "Deregister failed: {}", e),
                Err(_) => warn!(component = "engine", "Deregister timed out"),
            }
        }
        info!(component = "engine", "Node {} closed", self.hostname);
    }
}

fn refusal(addr: &str, outcome: OpenOutcome) -> EngineError {
    match outcome {
        OpenOutcome::Rejected { reason, .. } => {
            EngineError::Connect(format!("{} refused: {}", addr, reason))
        }
        OpenOutcome::Accepted => EngineError::Connect(format!("{} refused", addr)),
    }
}

/// State shared by inbound stream handlers
struct Inbound {
    ports: Arc<PortTable>,
    handshake_timeout: Duration,
    max_frame_size: usize,
}

async fn accept_loop(listener: TcpListener, inbound: Arc<Inbound>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            biased;

            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                debug!(component = "engine", "Underlay accept loop stopped");
                return;
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let inbound = inbound.clone();
                    tokio::spawn(
                        async move {
                            if let Err(e) = handle_inbound(stream, peer, inbound).await {
                                debug!(component = "engine", "Inbound open from {} failed: {}", peer, e);
                            }
                        }
                        .with_current_subscriber(),
                    );
                }
                Err(e) => {
                    warn!(component = "engine", "Underlay accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
}

async fn handle_inbound(mut stream: TcpStream, peer: SocketAddr, inbound: Arc<Inbound>) -> Result<(), FrameError> {
    stream.set_nodelay(true)?;
    let decoder = FrameDecoder::with_max_frame_size(inbound.max_frame_size);
    let frame = match tokio::time::timeout(inbound.handshake_timeout, read_frame(&mut stream, &decoder)).await {
        Ok(frame) => frame?,
        Err(_) => {
            debug!(component = "engine", "Handshake from {} timed out", peer);
            return Ok(());
        }
    };
    let request = OpenRequest::decode(&frame)?;
    let key = (Transport::of(request.datagram), request.port);

    match inbound.ports.reserve(key) {
        Ok((permit, local_addr)) => {
            answer_open(&mut stream, &request, &OpenOutcome::Accepted, inbound.max_frame_size).await?;
            debug!(
                component = "engine",
                "Accepted stream from {} on {} port {}",
                request.src_addr,
                key.0.name(),
                key.1
            );
            permit.send(OpenedStream {
                stream: MeshStream::Tcp(stream),
                local_addr,
                remote_addr: request.src_addr,
            });
        }
        Err(refused) => {
            answer_open(&mut stream, &request, &refused, inbound.max_frame_size).await?;
        }
    }
    Ok(())
}

enum HostTarget {
    /// Empty or unspecified host
    Any,
    /// One of this node's addresses
    Own(IpAddr),
    /// Some other node
    Remote,
}

fn host_target(host: &str, node: &NodeStatus) -> HostTarget {
    if host.is_empty() {
        return HostTarget::Any;
    }
    match host.parse::<IpAddr>() {
        Ok(ip) if ip.is_unspecified() => HostTarget::Any,
        Ok(ip) if ip == IpAddr::V4(node.ipv4) || ip == IpAddr::V6(node.ipv6) => HostTarget::Own(ip),
        Ok(_) => HostTarget::Remote,
        Err(_) if host.eq_ignore_ascii_case(&node.hostname) => HostTarget::Own(IpAddr::V4(node.ipv4)),
        Err(_) => HostTarget::Remote,
    }
}

/// Split `host:port`, `:port` or `[v6]:port`
fn split_host_port(addr: &str) -> Result<(&str, u16), EngineError> {
    let invalid = |why: &str| EngineError::InvalidAddr(format!("{:?}: {}", addr, why));

    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| invalid("missing ']'"))?;
        let port = tail.strip_prefix(':').ok_or_else(|| invalid("missing port"))?;
        if host.parse::<std::net::Ipv6Addr>().is_err() {
            return Err(invalid("bracketed host must be an IPv6 address"));
        }
        (host, port)
    } else {
        let (host, port) = addr.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        if host.contains(':') {
            return Err(invalid("IPv6 hosts must be bracketed"));
        }
        (host, port)
    };

    let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
    Ok((host, port))
}

fn format_addr(ip: IpAddr, port: u16) -> String {
    SocketAddr::new(ip, port).to_string()
}

/// Path of a node's persisted state inside `dir`
pub fn state_path(dir: &Path) -> PathBuf {
    dir.join(STATE_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn node_config(hostname: &str, control_url: &str) -> NodeConfig {
        NodeConfig {
            dir: None,
            hostname: hostname.to_string(),
            auth_key: None,
            control_url: control_url.to_string(),
            ephemeral: true,
        }
    }

    async fn started_up(engine: &MeshEngine, hostname: &str) -> (Arc<dyn EngineSession>, NodeStatus) {
        let session = engine.start(node_config(hostname, "local://test")).await.unwrap();
        let status = session.up().await.unwrap();
        (session, status)
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port(":8080").unwrap(), ("", 8080));
        assert_eq!(split_host_port("foo:80").unwrap(), ("foo", 80));
        assert_eq!(split_host_port("[fd7a::1]:443").unwrap(), ("fd7a::1", 443));
        assert!(split_host_port("8080").is_err());
        assert!(split_host_port("fd7a::1:80").is_err());
        assert!(split_host_port("foo:http").is_err());
        assert!(split_host_port("[foo]:80").is_err());
    }

    #[tokio::test]
    async fn test_stream_between_two_nodes() {
        let engine = MeshEngine::default();
        let (server, server_status) = started_up(&engine, "server").await;
        let (client, _) = started_up(&engine, "client").await;

        let (tx, mut rx) = mpsc::channel(4);
        let binding = server.listen(Network::Tcp, ":8080", tx).await.unwrap();
        assert_eq!(binding.local_addr(), format!("{}:8080", server_status.ipv4));

        let mut dialed = client.dial(Network::Tcp, "server:8080").await.unwrap();
        assert_eq!(dialed.remote_addr, "server:8080");
        dialed.stream.write_all(b"hello mesh").await.unwrap();

        let mut accepted = rx.recv().await.unwrap();
        assert_eq!(accepted.remote_addr, dialed.local_addr);
        let mut buf = [0u8; 10];
        accepted.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello mesh");

        server.close().await;
        client.close().await;
    }

    #[tokio::test]
    async fn test_refusals() {
        let engine = MeshEngine::default();
        let (server, status) = started_up(&engine, "busy").await;
        let (client, _) = started_up(&engine, "caller").await;

        let missing = client.dial(Network::Tcp, "busy:9").await;
        assert!(matches!(missing, Err(EngineError::Connect(ref m)) if m.contains("no listener")));

        let (tx, _rx) = mpsc::channel(1);
        let _binding = server.listen(Network::Tcp, ":7000", tx.clone()).await.unwrap();
        let in_use = server.listen(Network::Tcp, ":7000", tx.clone()).await;
        assert!(matches!(in_use, Err(EngineError::AddrInUse(_))));

        // Datagram ports are a separate namespace.
        let _udp = server.listen(Network::Udp, ":7000", tx).await.unwrap();

        let _first = client.dial(Network::Tcp, &format!("{}:7000", status.ipv4)).await.unwrap();
        let second = client.dial(Network::Tcp, "busy:7000").await;
        assert!(matches!(second, Err(EngineError::Connect(ref m)) if m.contains("backlog full")));

        let foreign = server.listen(Network::Tcp, "100.64.9.9:1", mpsc::channel(1).0).await;
        assert!(matches!(foreign, Err(EngineError::InvalidAddr(_))));
    }

    #[tokio::test]
    async fn test_binding_drop_releases_port_and_ephemeral_ports() {
        let engine = MeshEngine::default();
        let (session, _) = started_up(&engine, "solo").await;

        let (tx, mut rx) = mpsc::channel(1);
        let binding = session.listen(Network::Tcp, ":0", tx.clone()).await.unwrap();
        let port: u16 = binding.local_addr().rsplit_once(':').unwrap().1.parse().unwrap();
        assert!(port >= EPHEMERAL_PORT_FIRST);

        let mut near = session.dial(Network::Tcp, &format!(":{}", port)).await.unwrap();
        near.stream.write_all(b"x").await.unwrap();
        let mut far = rx.recv().await.unwrap();
        let mut byte = [0u8; 1];
        far.stream.read_exact(&mut byte).await.unwrap();
        assert_eq!(&byte, b"x");

        drop(binding);
        let again = session.listen(Network::Tcp, &format!("solo:{}", port), tx).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_auth_failure_and_closed_session() {
        let plane = Arc::new(ControlPlane::with_auth_keys(["right"]));
        let engine = MeshEngine::default().with_control("secure", plane);

        let mut config = node_config("n", "local://secure");
        config.auth_key = Some("wrong".to_string());
        let session = engine.start(config).await.unwrap();
        assert!(matches!(session.up().await, Err(EngineError::Auth(_))));

        session.close().await;
        assert_eq!(session.up().await, Err(EngineError::Closed));

        let bad_url = engine.start(node_config("n", "http://nowhere")).await;
        assert!(matches!(bad_url, Err(EngineError::Join(_))));
    }

    #[tokio::test]
    async fn test_persistent_node_keeps_identity() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MeshEngine::default();
        let plane = engine.control_plane("test");

        let mut config = node_config("keeper", "local://test");
        config.dir = Some(dir.path().to_path_buf());
        config.ephemeral = false;

        let first = engine.start(config.clone()).await.unwrap();
        let status = first.up().await.unwrap();
        first.close().await;
        assert!(state_path(dir.path()).exists());
        assert_eq!(plane.member_count().await, 1);
        assert_eq!(plane.online_count().await, 0);

        let second = engine.start(config).await.unwrap();
        assert_eq!(second.up().await.unwrap(), status);
        second.close().await;
    }
}
