//! The owned registry object behind the flat call surface.
//!
//! [`MeshRuntime`] owns the three handle registries, the error reporter, the
//! engine and the tokio runtime the engine runs on. Its methods are blocking
//! and must be called from plain threads, never from inside an async context.
//!
//! Lock order: a registry's table lock and a server's state lock are never
//! held together, and no lock is held while an engine future runs.

use crate::config::RuntimeConfig;
use crate::connection::{Connection, Origin};
use crate::engine::{Engine, EngineError, MeshEngine, Network, NodeStatus, OpenedStream};
use crate::error::{MeshError, Result};
use crate::handle::{Handle, HandleKind, Registry};
use crate::listener::Listener;
use crate::loopback::{Loopback, LoopbackInfo};
use crate::reporter::ErrorReporter;
use crate::server::{Server, ServerState, Setting};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::instrument::WithSubscriber;
use tracing::{debug, info, warn, Dispatch};

/// Registries, engine and executor of one embedding
pub struct MeshRuntime {
    rt: tokio::runtime::Runtime,
    engine: Arc<dyn Engine>,
    config: RuntimeConfig,
    servers: Registry<Server>,
    listeners: Registry<Listener>,
    connections: Registry<Connection>,
    reporter: ErrorReporter,
}

impl MeshRuntime {
    /// Runtime with environment configuration and the reference engine
    pub fn new() -> Result<Self> {
        Self::with_config(RuntimeConfig::from_env())
    }

    /// Runtime with the reference engine
    pub fn with_config(config: RuntimeConfig) -> Result<Self> {
        let engine = Arc::new(MeshEngine::from_config(&config));
        Self::with_engine(config, engine)
    }

    /// Runtime driving a caller-supplied engine
    pub fn with_engine(config: RuntimeConfig, engine: Arc<dyn Engine>) -> Result<Self> {
        config.validate()?;

        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all().thread_name("mesh-embed");
        if let Some(threads) = config.worker_threads {
            builder.worker_threads(threads);
        }
        let rt = builder
            .build()
            .map_err(|e| MeshError::Config(format!("failed to build executor: {}", e)))?;

        info!(
            "Mesh runtime ready (backlog {}, default control {})",
            config.accept_backlog, config.default_control_url
        );

        Ok(Self {
            rt,
            engine,
            config,
            servers: Registry::new(HandleKind::Server),
            listeners: Registry::new(HandleKind::Listener),
            connections: Registry::new(HandleKind::Connection),
            reporter: ErrorReporter::new(),
        })
    }

    /// Configuration in effect
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Last-error slots
    pub fn reporter(&self) -> &ErrorReporter {
        &self.reporter
    }

    /// Whether a handle refers to a live object
    pub fn is_live(&self, handle: Handle) -> bool {
        match handle.kind() {
            Some(HandleKind::Server) => self.servers.get(handle).is_ok(),
            Some(HandleKind::Listener) => self.listeners.get(handle).is_ok(),
            Some(HandleKind::Connection) => self.connections.get(handle).is_ok(),
            None => false,
        }
    }

    /// Number of live servers, listeners and connections
    pub fn live_counts(&self) -> (usize, usize, usize) {
        (self.servers.len(), self.listeners.len(), self.connections.len())
    }

    fn block_on<F: Future>(&self, dispatch: &Dispatch, fut: F) -> F::Output {
        self.rt.block_on(fut.with_subscriber(dispatch.clone()))
    }

    /// Create a server in the Created state
    pub fn new_server(&self) -> Handle {
        let (handle, _) = self.servers.insert_with(Server::new);
        debug!("Created server {}", handle);
        handle
    }

    /// Apply one setting to a server that has not started
    pub fn configure(&self, handle: Handle, setting: Setting) -> Result<()> {
        let server = self.servers.get(handle)?;
        debug!("{} on server {}", setting.name(), handle);
        server.configure(setting)
    }

    /// Lifecycle state and error marker of a server
    pub fn server_state(&self, handle: Handle) -> Result<(ServerState, Option<String>)> {
        let server = self.servers.get(handle)?;
        Ok((server.state(), server.last_error()))
    }

    /// Hand the server's configuration to the engine
    pub fn start(&self, handle: Handle) -> Result<()> {
        let server = self.servers.get(handle)?;
        let (node_config, dispatch) = server.begin_start(&self.config.default_control_url)?;
        info!("Starting server {} as {}", handle, node_config.hostname);

        let engine = self.engine.clone();
        let started = self.block_on(
            &dispatch,
            server.cancel_signal().guard("start", async move {
                engine.start(node_config).await.map_err(MeshError::from)
            }),
        );

        match started {
            Ok(session) => match server.install_session(session) {
                Ok(()) => {
                    info!("Server {} started", handle);
                    Ok(())
                }
                Err(orphan) => {
                    self.block_on(&dispatch, orphan.close());
                    Err(MeshError::Cancelled("start cancelled by close".to_string()))
                }
            },
            Err(e) => {
                warn!("Server {} failed to start: {}", handle, e);
                server.fail_start(&e);
                Err(e)
            }
        }
    }

    /// Block until the server has joined the mesh
    pub fn up(&self, handle: Handle) -> Result<NodeStatus> {
        let server = self.servers.get(handle)?;
        let (session, dispatch) = server.begin_up()?;
        let up_timeout = self.config.up_timeout;

        let joined = self.block_on(
            &dispatch,
            server
                .cancel_signal()
                .guard("up", with_limit("up", up_timeout, async move {
                    session.up().await.map_err(MeshError::from)
                })),
        );

        let status = server.finish_up(joined)?;
        info!(
            "Server {} is up as {} ({}, {})",
            handle, status.hostname, status.ipv4, status.ipv6
        );
        Ok(status)
    }

    /// `"<ipv4>,<ipv6>"` of an Up server
    pub fn ips(&self, handle: Handle) -> Result<String> {
        self.servers.get(handle)?.ips()
    }

    /// Bind a listener on an Up server
    pub fn listen(&self, handle: Handle, network: &str, addr: &str) -> Result<Handle> {
        let server = self.servers.get(handle)?;
        let (session, dispatch) = server.require_up()?;
        let network: Network = network.parse().map_err(MeshError::Listen)?;

        let (queue_tx, queue_rx) = mpsc::channel(self.config.accept_backlog);
        let binding = self.block_on(
            &dispatch,
            server.cancel_signal().guard("listen", async {
                session
                    .listen(network, addr, queue_tx)
                    .await
                    .map_err(EngineError::into_listen_error)
            }),
        )?;

        let (listener_handle, listener) = self.listeners.insert_with(|listener_handle| {
            Listener::new(listener_handle, handle, network, addr, binding, queue_rx, dispatch)
        });
        if let Err(e) = server.attach_listener(listener_handle) {
            self.listeners.remove(listener_handle);
            listener.close();
            return Err(e);
        }

        debug!(
            "Listener {} bound {} {} on server {}",
            listener_handle,
            network,
            listener.local_addr(),
            handle
        );
        Ok(listener_handle)
    }

    /// Address a listener is bound to
    pub fn listener_addr(&self, handle: Handle) -> Result<String> {
        Ok(self.listeners.get(handle)?.local_addr().to_string())
    }

    /// Block until the next inbound connection
    pub fn accept(&self, handle: Handle) -> Result<Handle> {
        let listener = match self.listeners.get(handle) {
            Ok(listener) => listener,
            Err(_) if self.listeners.was_closed(handle) => {
                return Err(MeshError::Cancelled(format!("listener {} is closed", handle)));
            }
            Err(e) => return Err(e),
        };
        let opened = self.block_on(listener.dispatch(), listener.next())?;
        self.register_connection(listener.server(), Origin::Accepted, opened, listener.dispatch())
    }

    /// Open an outbound connection
    pub fn dial(&self, handle: Handle, network: &str, addr: &str) -> Result<Handle> {
        let server = self.servers.get(handle)?;
        let (session, dispatch) = server.require_up()?;
        let network: Network = network.parse().map_err(MeshError::Network)?;
        let dial_timeout = self.config.dial_timeout;

        let opened = self.block_on(
            &dispatch,
            server
                .cancel_signal()
                .guard("dial", with_limit("dial", dial_timeout, async {
                    session.dial(network, addr).await.map_err(MeshError::from)
                })),
        )?;
        self.register_connection(handle, Origin::Dialed, opened, &dispatch)
    }

    fn register_connection(
        &self,
        server_handle: Handle,
        origin: Origin,
        opened: OpenedStream,
        dispatch: &Dispatch,
    ) -> Result<Handle> {
        let op = match origin {
            Origin::Accepted => "accept",
            Origin::Dialed => "dial",
        };
        let server = self
            .servers
            .get(server_handle)
            .map_err(|_| MeshError::Cancelled(format!("{} cancelled by close", op)))?;

        let (handle, connection) = self.connections.insert_with(|handle| {
            Connection::new(handle, server_handle, origin, opened, dispatch.clone())
        });
        if let Err(e) = server.attach_connection(handle) {
            self.connections.remove(handle);
            connection.close();
            return Err(e);
        }

        debug!(
            "Connection {} {:?} {} -> {}",
            handle,
            origin,
            connection.local_addr(),
            connection.remote_addr()
        );
        Ok(handle)
    }

    /// Local proxy bridging into the server's session; stable while Up
    pub fn loopback(&self, handle: Handle) -> Result<LoopbackInfo> {
        let server = self.servers.get(handle)?;
        let (session, dispatch) = server.require_up()?;
        if let Some(info) = server.loopback_info() {
            return Ok(info);
        }

        let proxy = self.block_on(&dispatch, Loopback::start(session))?;
        server.install_loopback(proxy)
    }

    /// Read from a connection; `Ok(0)` at end of stream
    pub fn read(&self, handle: Handle, buf: &mut [u8]) -> Result<usize> {
        let connection = self.connections.get(handle)?;
        self.block_on(connection.dispatch(), connection.read(buf))
    }

    /// Write all of `buf` to a connection
    pub fn write(&self, handle: Handle, buf: &[u8]) -> Result<usize> {
        let connection = self.connections.get(handle)?;
        self.block_on(connection.dispatch(), connection.write(buf))
    }

    /// Mesh address of the far end
    pub fn remote_addr(&self, handle: Handle) -> Result<String> {
        Ok(self.connections.get(handle)?.remote_addr().to_string())
    }

    /// Mesh address of the near end
    pub fn local_addr(&self, handle: Handle) -> Result<String> {
        Ok(self.connections.get(handle)?.local_addr().to_string())
    }

    /// Close any handle; closing an already closed handle succeeds
    pub fn close(&self, handle: Handle) -> Result<()> {
        match handle.kind() {
            Some(HandleKind::Server) => self.close_server(handle),
            Some(HandleKind::Listener) => self.close_listener(handle),
            Some(HandleKind::Connection) => self.close_connection(handle),
            None => Err(MeshError::Handle(format!("invalid handle {}", handle))),
        }
    }

    fn close_server(&self, handle: Handle) -> Result<()> {
        let server = match self.servers.remove(handle) {
            Some(server) => server,
            None => return already_closed(self.servers.was_closed(handle), handle),
        };

        let Some(teardown) = server.close() else {
            return Ok(());
        };
        for listener in teardown.listeners {
            let _ = self.close_listener(listener);
        }
        for connection in teardown.connections {
            let _ = self.close_connection(connection);
        }
        drop(teardown.loopback);
        if let Some(session) = teardown.session {
            self.block_on(&teardown.dispatch, session.close());
        }

        self.reporter.forget(handle);
        info!("Server {} closed", handle);
        Ok(())
    }

    fn close_listener(&self, handle: Handle) -> Result<()> {
        let listener = match self.listeners.remove(handle) {
            Some(listener) => listener,
            None => return already_closed(self.listeners.was_closed(handle), handle),
        };
        listener.close();
        if let Ok(server) = self.servers.get(listener.server()) {
            server.detach_listener(handle);
        }
        self.reporter.forget(handle);
        debug!("Listener {} closed", handle);
        Ok(())
    }

    fn close_connection(&self, handle: Handle) -> Result<()> {
        let connection = match self.connections.remove(handle) {
            Some(connection) => connection,
            None => return already_closed(self.connections.was_closed(handle), handle),
        };
        connection.close();
        if let Ok(server) = self.servers.get(connection.server()) {
            server.detach_connection(handle);
        }
        self.reporter.forget(handle);
        debug!("Connection {} closed", handle);
        Ok(())
    }

    /// Close every live server, and with them everything else
    pub fn shutdown(&self) {
        for handle in self.servers.handles() {
            let _ = self.close_server(handle);
        }
    }
}

impl Drop for MeshRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn already_closed(was_issued: bool, handle: Handle) -> Result<()> {
    if was_issued {
        Ok(())
    } else {
        Err(MeshError::Handle(format!("unknown handle {}", handle)))
    }
}

async fn with_limit<T, F>(what: &str, limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
            Err(MeshError::Network(format!(
                "{} timed out after {}",
                what,
                humantime::format_duration(limit)
            )))
        }),
        None => fut.await,
    }
}
