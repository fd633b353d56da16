//! Underlay transport, stream-open handshake and control plane for the mesh.
//!
//! This crate holds the networking pieces the embedded runtime's reference
//! engine is built from.
//!
//! ## Features
//!
//! - **Underlay Transport**: TCP streams between nodes, in-memory pairs for
//!   node-local streams
//! - **Open Handshake**: `Open` / `Accept` / `Reject` exchange that turns an
//!   underlay socket into a raw mesh stream
//! - **Control Plane**: auth keys, address allocation, hostname
//!   de-duplication, lookup, ephemeral membership
//!
//! ## Example
//!
//! ```rust,no_run
//! use mesh_session::{ControlClient, ControlPlane, RegisterRequest};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), mesh_session::ControlError> {
//! let plane = Arc::new(ControlPlane::with_auth_keys(["tskey-example"]));
//! let client = ControlClient::Local(plane);
//!
//! let joined = client
//!     .register(RegisterRequest {
//!         hostname: "foo".to_string(),
//!         auth_key: Some("tskey-example".to_string()),
//!         node_key: "node-key-1".to_string(),
//!         ephemeral: true,
//!         underlay_addr: "127.0.0.1:9000".parse().unwrap(),
//!     })
//!     .await?;
//! println!("joined as {} at {}", joined.hostname, joined.ipv4);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod control;
pub mod handshake;
pub mod transport;

pub use control::{
    ControlClient, ControlEndpoint, ControlError, ControlPlane, ControlServer, PeerInfo,
    RegisterRequest, RegisterResponse,
};
pub use handshake::{answer_open, read_frame, send_open, write_frame, FrameError, OpenOutcome, OpenRequest};
pub use transport::{connect_tcp, listen_tcp, MeshStream, MEMORY_STREAM_CAPACITY};
