//! Wire protocol framing, fast headers and CBOR metadata for the embedded mesh.
//!
//! This crate carries the two small protocols the reference mesh engine
//! speaks: control-plane requests (register, resolve, deregister) and the
//! stream-open handshake on a node's underlay socket. User stream bytes are
//! never framed; once an `Open` is answered with `Accept` the socket carries
//! raw bytes.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 frame_len        | length of bytes that follow|
//! +----------------------+----------------------------+
//! | Fast Header (32B)    | type, code, port, node ids |
//! +----------------------+----------------------------+
//! | u32 meta_len         | canonical CBOR map length  |
//! +----------------------+----------------------------+
//! | meta_bytes           | metadata (CBOR)            |
//! +----------------------+----------------------------+
//! | payload              | variable (0..N)            |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod header;

// Re-export main types
pub use codec::{get_meta_str, parse_meta, CodecError, FrameBuilder, Meta};
pub use error::WireError;
pub use frame::{Frame, FrameDecoder, DEFAULT_MAX_FRAME_SIZE, HARD_MAX_FRAME_SIZE, MAX_META_SIZE};
pub use header::{FastHeader, Flags, FrameType, StatusCode, FAST_HEADER_SIZE, WIRE_VERSION};
