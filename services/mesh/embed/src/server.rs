//! Server objects and their lifecycle state machine.
//!
//! ```text
//! Created ──set──▶ Configured ──start──▶ Starting ──ok──▶ Started ──up──▶ Up
//!                       ▲                    │
//!                       └──────failed────────┘        (close from anywhere ▶ Closed)
//! ```
//!
//! A [`Server`] only guards its own state. Engine calls are made by
//! [`MeshRuntime`](crate::MeshRuntime) between the `begin_*` and `finish_*`
//! transitions so that no lock is held while the engine runs.

use crate::cancel::CancelSignal;
use crate::engine::{EngineSession, NodeConfig, NodeStatus};
use crate::error::{MeshError, Result};
use crate::handle::Handle;
use crate::logging::LogTarget;
use crate::loopback::{Loopback, LoopbackInfo};
use mesh_session::ControlEndpoint;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Dispatch;

/// Hostname used when none is set
pub const DEFAULT_HOSTNAME: &str = "mesh-node";

/// Lifecycle state of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Fresh, default configuration
    Created,
    /// At least one setting applied
    Configured,
    /// Engine start in progress
    Starting,
    /// Engine session exists; not yet joined
    Started,
    /// Joined and routable
    Up,
    /// Torn down
    Closed,
}

impl ServerState {
    fn name(self) -> &'static str {
        match self {
            ServerState::Created => "created",
            ServerState::Configured => "configured",
            ServerState::Starting => "starting",
            ServerState::Started => "started",
            ServerState::Up => "up",
            ServerState::Closed => "closed",
        }
    }

    fn is_configurable(self) -> bool {
        matches!(self, ServerState::Created | ServerState::Configured)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single configuration change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Setting {
    /// State directory
    Dir(PathBuf),
    /// Requested hostname; empty restores the default
    Hostname(String),
    /// Auth key; empty clears it
    AuthKey(String),
    /// Control plane URL
    ControlUrl(String),
    /// Ephemeral membership
    Ephemeral(bool),
    /// Engine log descriptor; `-1` discards
    LogFd(i32),
}

impl Setting {
    /// Name of the setter, as used in error messages
    pub fn name(&self) -> &'static str {
        match self {
            Setting::Dir(_) => "set_dir",
            Setting::Hostname(_) => "set_hostname",
            Setting::AuthKey(_) => "set_authkey",
            Setting::ControlUrl(_) => "set_control_url",
            Setting::Ephemeral(_) => "set_ephemeral",
            Setting::LogFd(_) => "set_log_fd",
        }
    }
}

/// Node configuration held by a server until start
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// State directory
    pub dir: Option<PathBuf>,
    /// Requested hostname
    pub hostname: String,
    /// Auth key
    pub auth_key: Option<String>,
    /// Control URL; the runtime default when unset
    pub control_url: Option<String>,
    /// Ephemeral membership
    pub ephemeral: bool,
    /// Where engine logs go
    pub log: LogTarget,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            dir: None,
            hostname: DEFAULT_HOSTNAME.to_string(),
            auth_key: None,
            control_url: None,
            ephemeral: false,
            log: LogTarget::Default,
        }
    }
}

impl ServerConfig {
    /// Validate and apply one setting; nothing changes on error
    pub fn apply(&mut self, setting: Setting) -> Result<()> {
        match setting {
            Setting::Dir(dir) => {
                self.dir = if dir.as_os_str().is_empty() { None } else { Some(dir) };
            }
            Setting::Hostname(hostname) => {
                if hostname.chars().any(|c| c.is_whitespace() || c == ':') {
                    return Err(MeshError::Config(format!("invalid hostname {:?}", hostname)));
                }
                self.hostname = if hostname.is_empty() {
                    DEFAULT_HOSTNAME.to_string()
                } else {
                    hostname
                };
            }
            Setting::AuthKey(key) => {
                self.auth_key = if key.is_empty() { None } else { Some(key) };
            }
            Setting::ControlUrl(url) => {
                ControlEndpoint::parse(&url).map_err(|e| MeshError::Config(e.to_string()))?;
                self.control_url = Some(url);
            }
            Setting::Ephemeral(ephemeral) => self.ephemeral = ephemeral,
            Setting::LogFd(fd) => self.log = LogTarget::from_fd(fd)?,
        }
        Ok(())
    }

    fn node_config(&self, default_control_url: &str) -> NodeConfig {
        NodeConfig {
            dir: self.dir.clone(),
            hostname: self.hostname.clone(),
            auth_key: self.auth_key.clone(),
            control_url: self
                .control_url
                .clone()
                .unwrap_or_else(|| default_control_url.to_string()),
            ephemeral: self.ephemeral,
        }
    }
}

/// Everything a closing server hands back for release
pub(crate) struct Teardown {
    pub listeners: Vec<Handle>,
    pub connections: Vec<Handle>,
    pub session: Option<Arc<dyn EngineSession>>,
    pub loopback: Option<Loopback>,
    pub dispatch: Dispatch,
}

struct ServerInner {
    state: ServerState,
    error: Option<String>,
    config: ServerConfig,
    dispatch: Option<Dispatch>,
    session: Option<Arc<dyn EngineSession>>,
    status: Option<NodeStatus>,
    listeners: BTreeSet<Handle>,
    connections: BTreeSet<Handle>,
    loopback: Option<Loopback>,
}

/// A node within the mesh, owned by the server registry
pub struct Server {
    handle: Handle,
    cancel: CancelSignal,
    inner: Mutex<ServerInner>,
}

impl Server {
    pub(crate) fn new(handle: Handle) -> Self {
        Self {
            handle,
            cancel: CancelSignal::new(),
            inner: Mutex::new(ServerInner {
                state: ServerState::Created,
                error: None,
                config: ServerConfig::default(),
                dispatch: None,
                session: None,
                status: None,
                listeners: BTreeSet::new(),
                connections: BTreeSet::new(),
                loopback: None,
            }),
        }
    }

    /// Handle of this server
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Signal raised when the server closes
    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Current lifecycle state
    pub fn state(&self) -> ServerState {
        self.inner.lock().state
    }

    /// Message of the last failed lifecycle operation
    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().error.clone()
    }

    /// Copy of the configuration
    pub fn config(&self) -> ServerConfig {
        self.inner.lock().config.clone()
    }

    /// Node identity once up
    pub fn node_status(&self) -> Option<NodeStatus> {
        self.inner.lock().status.clone()
    }

    pub(crate) fn configure(&self, setting: Setting) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.state.is_configurable() {
            return Err(MeshError::Config(format!(
                "settings are fixed once the server is {}",
                inner.state
            )));
        }
        inner.config.apply(setting)?;
        inner.state = ServerState::Configured;
        Ok(())
    }

    /// Created/Configured ▶ Starting
    pub(crate) fn begin_start(&self, default_control_url: &str) -> Result<(NodeConfig, Dispatch)> {
        let mut inner = self.inner.lock();
        if !inner.state.is_configurable() {
            return Err(MeshError::State(format!(
                "start requires a created or configured server; server is {}",
                inner.state
            )));
        }
        let node_config = inner.config.node_config(default_control_url);
        let dispatch = inner.config.log.dispatch(&node_config.hostname);
        inner.state = ServerState::Starting;
        inner.dispatch = Some(dispatch.clone());
        Ok((node_config, dispatch))
    }

    /// Starting ▶ Started; hands the session back if the server closed meanwhile
    pub(crate) fn install_session(
        &self,
        session: Arc<dyn EngineSession>,
    ) -> std::result::Result<(), Arc<dyn EngineSession>> {
        let mut inner = self.inner.lock();
        if inner.state != ServerState::Starting {
            return Err(session);
        }
        inner.session = Some(session);
        inner.state = ServerState::Started;
        inner.error = None;
        Ok(())
    }

    /// Starting ▶ Configured, keeping the failure
    pub(crate) fn fail_start(&self, error: &MeshError) {
        let mut inner = self.inner.lock();
        if inner.state == ServerState::Starting {
            inner.state = ServerState::Configured;
            inner.dispatch = None;
            inner.error = Some(error.to_string());
        }
    }

    /// Session to bring up; requires Started
    pub(crate) fn begin_up(&self) -> Result<(Arc<dyn EngineSession>, Dispatch)> {
        let inner = self.inner.lock();
        match (&inner.state, &inner.session, &inner.dispatch) {
            (ServerState::Started, Some(session), Some(dispatch)) => {
                Ok((session.clone(), dispatch.clone()))
            }
            _ => Err(MeshError::State(format!(
                "up requires a started server; server is {}",
                inner.state
            ))),
        }
    }

    /// Started ▶ Up, or record why not
    pub(crate) fn finish_up(&self, result: Result<NodeStatus>) -> Result<NodeStatus> {
        let mut inner = self.inner.lock();
        match result {
            Ok(status) => match inner.state {
                ServerState::Started => {
                    inner.state = ServerState::Up;
                    inner.status = Some(status.clone());
                    inner.error = None;
                    Ok(status)
                }
                ServerState::Up => Ok(status),
                _ => Err(MeshError::Cancelled("up cancelled by close".to_string())),
            },
            Err(e) => {
                if inner.state == ServerState::Started {
                    inner.error = Some(e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Session and log dispatch of an Up server
    pub(crate) fn require_up(&self) -> Result<(Arc<dyn EngineSession>, Dispatch)> {
        let inner = self.inner.lock();
        match (&inner.state, &inner.session, &inner.dispatch) {
            (ServerState::Up, Some(session), Some(dispatch)) => {
                Ok((session.clone(), dispatch.clone()))
            }
            _ => Err(MeshError::State(format!(
                "server must be up; server is {}",
                inner.state
            ))),
        }
    }

    /// `"<ipv4>,<ipv6>"` of an Up server
    pub(crate) fn ips(&self) -> Result<String> {
        let inner = self.inner.lock();
        match (&inner.state, &inner.status) {
            (ServerState::Up, Some(status)) => Ok(format!("{},{}", status.ipv4, status.ipv6)),
            _ => Err(MeshError::State(format!(
                "server must be up; server is {}",
                inner.state
            ))),
        }
    }

    pub(crate) fn attach_listener(&self, listener: Handle) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != ServerState::Up {
            return Err(MeshError::Cancelled("listen cancelled by close".to_string()));
        }
        inner.listeners.insert(listener);
        Ok(())
    }

    pub(crate) fn detach_listener(&self, listener: Handle) {
        self.inner.lock().listeners.remove(&listener);
    }

    pub(crate) fn attach_connection(&self, connection: Handle) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != ServerState::Up {
            return Err(MeshError::Cancelled("connection cancelled by close".to_string()));
        }
        inner.connections.insert(connection);
        Ok(())
    }

    pub(crate) fn detach_connection(&self, connection: Handle) {
        self.inner.lock().connections.remove(&connection);
    }

    pub(crate) fn loopback_info(&self) -> Option<LoopbackInfo> {
        self.inner.lock().loopback.as_ref().map(|proxy| proxy.info().clone())
    }

    /// Keep a freshly started proxy, unless one exists or the server went down
    pub(crate) fn install_loopback(&self, proxy: Loopback) -> Result<LoopbackInfo> {
        let mut inner = self.inner.lock();
        if inner.state != ServerState::Up {
            return Err(MeshError::Cancelled("loopback cancelled by close".to_string()));
        }
        if let Some(existing) = &inner.loopback {
            return Ok(existing.info().clone());
        }
        let info = proxy.info().clone();
        inner.loopback = Some(proxy);
        Ok(info)
    }

    /// Any state ▶ Closed; `None` if already closed
    pub(crate) fn close(&self) -> Option<Teardown> {
        self.cancel.cancel();
        let mut inner = self.inner.lock();
        if inner.state == ServerState::Closed {
            return None;
        }
        inner.state = ServerState::Closed;
        Some(Teardown {
            listeners: std::mem::take(&mut inner.listeners).into_iter().collect(),
            connections: std::mem::take(&mut inner.connections).into_iter().collect(),
            session: inner.session.take(),
            loopback: inner.loopback.take(),
            dispatch: inner.dispatch.take().unwrap_or_else(Dispatch::none),
        })
    }
}
