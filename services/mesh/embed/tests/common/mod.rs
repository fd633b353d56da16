//! Shared fixtures for the runtime integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use mesh_embed::{
    Api, Engine, EngineBinding, EngineError, EngineSession, MeshEngine, MeshRuntime, Network,
    NodeConfig, NodeStatus, OpenedStream, RuntimeConfig, Status,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;

/// Small runtime configuration for tests
pub fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        worker_threads: Some(2),
        ..RuntimeConfig::default()
    }
}

/// Flat surface over the reference engine
pub fn api() -> Api {
    Api::with_runtime(MeshRuntime::with_config(test_config()).unwrap())
}

/// Flat surface over a caller-supplied engine
pub fn api_with(engine: Arc<dyn Engine>) -> Api {
    Api::with_runtime(MeshRuntime::with_engine(test_config(), engine).unwrap())
}

/// Create, configure, start and bring up a server
pub fn up_server(api: &Api, hostname: &str, control_url: &str) -> u64 {
    let server = api.new_server();
    assert_eq!(api.set_hostname(server, hostname), Status::Ok);
    assert_eq!(api.set_control_url(server, control_url), Status::Ok);
    assert_eq!(api.set_ephemeral(server, true), Status::Ok);
    assert_eq!(api.start(server), Status::Ok, "{}", api.err_msg(server));
    assert_eq!(api.up(server), Status::Ok, "{}", api.err_msg(server));
    server
}

/// Give a blocked call on another thread time to park
pub fn settle() {
    thread::sleep(Duration::from_millis(200));
}

/// Engine whose sessions start but never finish joining
pub struct StallEngine;

struct StallSession;

#[async_trait]
impl Engine for StallEngine {
    async fn start(&self, _config: NodeConfig) -> Result<Arc<dyn EngineSession>, EngineError> {
        Ok(Arc::new(StallSession))
    }
}

#[async_trait]
impl EngineSession for StallSession {
    async fn up(&self) -> Result<NodeStatus, EngineError> {
        std::future::pending().await
    }

    async fn listen(
        &self,
        _network: Network,
        _addr: &str,
        _queue: mpsc::Sender<OpenedStream>,
    ) -> Result<Box<dyn EngineBinding>, EngineError> {
        Err(EngineError::Closed)
    }

    async fn dial(&self, _network: Network, _addr: &str) -> Result<OpenedStream, EngineError> {
        Err(EngineError::Closed)
    }

    async fn close(&self) {}
}

/// Engine that refuses the first `failures` starts, then behaves normally
pub struct FailingEngine {
    failures: AtomicUsize,
    inner: MeshEngine,
}

impl FailingEngine {
    pub fn new(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            inner: MeshEngine::default(),
        }
    }
}

#[async_trait]
impl Engine for FailingEngine {
    async fn start(&self, config: NodeConfig) -> Result<Arc<dyn EngineSession>, EngineError> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(EngineError::Join("underlay unavailable".to_string()));
        }
        self.inner.start(config).await
    }
}

/// Engine whose nodes join normally but whose outbound connects never finish
pub struct DialStallEngine {
    inner: MeshEngine,
}

impl DialStallEngine {
    pub fn new() -> Self {
        Self {
            inner: MeshEngine::default(),
        }
    }
}

struct DialStallSession(Arc<dyn EngineSession>);

#[async_trait]
impl Engine for DialStallEngine {
    async fn start(&self, config: NodeConfig) -> Result<Arc<dyn EngineSession>, EngineError> {
        let session = self.inner.start(config).await?;
        Ok(Arc::new(DialStallSession(session)))
    }
}

#[async_trait]
impl EngineSession for DialStallSession {
    async fn up(&self) -> Result<NodeStatus, EngineError> {
        self.0.up().await
    }

    async fn listen(
        &self,
        network: Network,
        addr: &str,
        queue: mpsc::Sender<OpenedStream>,
    ) -> Result<Box<dyn EngineBinding>, EngineError> {
        self.0.listen(network, addr, queue).await
    }

    async fn dial(&self, _network: Network, _addr: &str) -> Result<OpenedStream, EngineError> {
        std::future::pending().await
    }

    async fn close(&self) {
        self.0.close().await
    }
}
