//! Runtime configuration.
//!
//! Settings are read from the `runtime` section of a YAML file and then
//! overridden by `MESH_EMBED_*` environment variables. Durations use
//! human-readable strings (`"30s"`, `"2m"`); `"none"` disables an optional
//! timeout.

use crate::error::{MeshError, Result};
use mesh_wire::{DEFAULT_MAX_FRAME_SIZE, HARD_MAX_FRAME_SIZE};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

const ENV_PREFIX: &str = "MESH_EMBED_";

/// Configuration shared by every server of a runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Pending inbound connections queued per listener
    pub accept_backlog: usize,
    /// Upper bound on `up`; unbounded when `None`
    pub up_timeout: Option<Duration>,
    /// Upper bound on `dial`; unbounded when `None`
    pub dial_timeout: Option<Duration>,
    /// Time an inbound underlay connection has to send its `Open` frame
    pub handshake_timeout: Duration,
    /// Local address the underlay listener binds
    pub underlay_bind: SocketAddr,
    /// Control URL used when a server does not set one
    pub default_control_url: String,
    /// Largest frame accepted on the wire
    pub max_frame_size: usize,
    /// Executor worker threads; tokio's default when `None`
    pub worker_threads: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            accept_backlog: 128,
            up_timeout: None,
            dial_timeout: None,
            handshake_timeout: Duration::from_secs(10),
            underlay_bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            default_control_url: "local://default".to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            worker_threads: None,
        }
    }
}

/// Root of the YAML document
#[derive(Debug, Deserialize)]
struct RootConfig {
    runtime: Option<FileConfig>,
}

/// `runtime` section as written in the file
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    accept_backlog: Option<usize>,
    up_timeout: Option<String>,
    dial_timeout: Option<String>,
    handshake_timeout: Option<String>,
    underlay_bind: Option<SocketAddr>,
    default_control_url: Option<String>,
    max_frame_size: Option<usize>,
    worker_threads: Option<usize>,
}

impl RuntimeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Self {
        let path = config_path.as_ref();
        let mut config = Self::default();

        match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    if let Some(section) = root.runtime {
                        config.apply_file_config(section);
                    }
                    info!("Loaded runtime configuration from {:?}", path);
                }
                Err(e) => warn!("Failed to parse config file {:?} ({}), using defaults", path, e),
            },
            Err(_) => warn!("Config file {:?} not found, using defaults", path),
        }

        config.apply_environment_overrides();
        config
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_environment_overrides();
        config
    }

    fn apply_file_config(&mut self, file: FileConfig) {
        if let Some(backlog) = file.accept_backlog {
            self.accept_backlog = backlog;
        }
        if let Some(raw) = file.up_timeout {
            apply_optional_duration("up_timeout", &raw, &mut self.up_timeout);
        }
        if let Some(raw) = file.dial_timeout {
            apply_optional_duration("dial_timeout", &raw, &mut self.dial_timeout);
        }
        if let Some(raw) = file.handshake_timeout {
            match humantime::parse_duration(&raw) {
                Ok(timeout) => self.handshake_timeout = timeout,
                Err(e) => warn!("Ignoring handshake_timeout {:?}: {}", raw, e),
            }
        }
        if let Some(bind) = file.underlay_bind {
            self.underlay_bind = bind;
        }
        if let Some(url) = file.default_control_url {
            self.default_control_url = url;
        }
        if let Some(size) = file.max_frame_size {
            self.max_frame_size = size;
        }
        if file.worker_threads.is_some() {
            self.worker_threads = file.worker_threads;
        }
    }

    /// Apply `MESH_EMBED_*` overrides from the process environment
    pub fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(value) = var("ACCEPT_BACKLOG") {
            match value.parse::<usize>() {
                Ok(backlog) => {
                    self.accept_backlog = backlog;
                    info!("Accept backlog overridden by environment: {}", backlog);
                }
                Err(e) => warn!("Ignoring {}ACCEPT_BACKLOG={:?}: {}", ENV_PREFIX, value, e),
            }
        }
        if let Some(value) = var("UP_TIMEOUT") {
            apply_optional_duration("up_timeout", &value, &mut self.up_timeout);
        }
        if let Some(value) = var("DIAL_TIMEOUT") {
            apply_optional_duration("dial_timeout", &value, &mut self.dial_timeout);
        }
        if let Some(value) = var("HANDSHAKE_TIMEOUT") {
            match humantime::parse_duration(&value) {
                Ok(timeout) => self.handshake_timeout = timeout,
                Err(e) => warn!("Ignoring {}HANDSHAKE_TIMEOUT={:?}: {}", ENV_PREFIX, value, e),
            }
        }
        if let Some(value) = var("UNDERLAY_BIND") {
            match value.parse::<SocketAddr>() {
                Ok(bind) => {
                    self.underlay_bind = bind;
                    info!("Underlay bind address overridden by environment: {}", bind);
                }
                Err(e) => warn!("Ignoring {}UNDERLAY_BIND={:?}: {}", ENV_PREFIX, value, e),
            }
        }
        if let Some(value) = var("CONTROL_URL") {
            info!("Default control URL overridden by environment: {}", value);
            self.default_control_url = value;
        }
        if let Some(value) = var("MAX_FRAME_SIZE") {
            match value.parse::<usize>() {
                Ok(size) => self.max_frame_size = size,
                Err(e) => warn!("Ignoring {}MAX_FRAME_SIZE={:?}: {}", ENV_PREFIX, value, e),
            }
        }
        if let Some(value) = var("WORKER_THREADS") {
            match value.parse::<usize>() {
                Ok(threads) => self.worker_threads = Some(threads),
                Err(e) => warn!("Ignoring {}WORKER_THREADS={:?}: {}", ENV_PREFIX, value, e),
            }
        }
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.accept_backlog == 0 {
            return Err(MeshError::Config("accept_backlog must be at least 1".to_string()));
        }
        if self.max_frame_size == 0 || self.max_frame_size > HARD_MAX_FRAME_SIZE {
            return Err(MeshError::Config(format!(
                "max_frame_size must be between 1 and {}",
                HARD_MAX_FRAME_SIZE
            )));
        }
        if self.worker_threads == Some(0) {
            return Err(MeshError::Config("worker_threads must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn apply_optional_duration(name: &str, raw: &str, slot: &mut Option<Duration>) {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("none") || trimmed.is_empty() {
        *slot = None;
        return;
    }
    match humantime::parse_duration(trimmed) {
        Ok(duration) => *slot = Some(duration),
        Err(e) => warn!("Ignoring {} {:?}: {}", name, raw, e),
    }
}
