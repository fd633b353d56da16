//! Embeddable mesh node runtime.
//!
//! A host program creates servers, configures them, brings them up on a
//! mesh and then listens, accepts and dials streams, all through opaque
//! integer handles. Calls block the calling thread; a `close` on a handle
//! from another thread interrupts whatever is blocked on it.
//!
//! ## Layers
//!
//! - [`Api`]: integer/string/status surface for language bindings
//! - [`MeshRuntime`]: typed registries, lifecycle and close cascade
//! - [`Engine`]: the networking contract; [`MeshEngine`] is the reference
//!   implementation built on `mesh-session`
//!
//! ## Example
//!
//! ```rust,no_run
//! use mesh_embed::{Api, Status};
//!
//! let api = Api::new().expect("runtime");
//! let server = api.new_server();
//! assert_eq!(api.set_hostname(server, "web"), Status::Ok);
//! assert_eq!(api.start(server), Status::Ok);
//! assert_eq!(api.up(server), Status::Ok);
//!
//! let (listener, status) = api.listen(server, "tcp", ":8080");
//! assert_eq!(status, Status::Ok);
//! let (conn, _) = api.accept(listener);
//! let mut buf = [0u8; 1024];
//! let (n, _) = api.read(conn, &mut buf);
//! api.write(conn, &buf[..n]);
//! api.close(server);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod cancel;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod handle;
pub mod listener;
pub mod logging;
mod loopback;
pub mod reporter;
pub mod runtime;
pub mod server;

pub use api::{Api, VERSION};
pub use config::RuntimeConfig;
pub use engine::{
    Engine, EngineBinding, EngineError, EngineSession, EngineSettings, MeshEngine, Network,
    NodeConfig, NodeStatus, OpenedStream,
};
pub use error::{MeshError, Result, Status};
pub use handle::{Handle, HandleKind};
pub use logging::NodeLogFormatter;
pub use loopback::{LoopbackInfo, LOOPBACK_USER};
pub use reporter::ErrorReporter;
pub use runtime::MeshRuntime;
pub use server::{ServerState, Setting, DEFAULT_HOSTNAME};
