//! Errors raised while encoding or decoding control and handshake frames.

use thiserror::Error;

/// Frame-level failures; none of them are recoverable on the same socket
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes buffered than the header or frame needs
    #[error("frame truncated")]
    Incomplete,

    /// Peer speaks another wire version
    #[error("wire version {0} not supported")]
    Version(u8),

    /// Frame larger than the configured maximum
    #[error("frame of {0} bytes exceeds the size limit")]
    Size(usize),

    /// Metadata section too large or not a CBOR map
    #[error("frame metadata is not valid CBOR")]
    Meta,

    /// Reserved header bits or flags set
    #[error("reserved header bits set")]
    Reserved,

    /// Frame type byte not known to this version
    #[error("unknown frame type {0:#04x}")]
    Type(u8),

    /// Status byte not known to this version
    #[error("unknown status code {0:#04x}")]
    Code(u8),

    /// Length fields disagree with the bytes present
    #[error("frame lengths are inconsistent")]
    Malformed,
}
