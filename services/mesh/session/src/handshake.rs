//! Stream-open handshake on a node's underlay socket.
//!
//! A dialer sends exactly one `Open` frame naming the destination virtual
//! port; the peer answers with `Accept` or `Reject`. After `Accept` both sides
//! treat the socket as a raw byte stream, so frames are read with exact-length
//! reads and no byte past the reply is consumed.

use bytes::Bytes;
use mesh_wire::{
    get_meta_str, parse_meta, CodecError, FastHeader, Flags, Frame, FrameBuilder, FrameDecoder,
    FrameType, StatusCode, WireError,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Errors raised while exchanging frames
#[derive(Error, Debug)]
pub enum FrameError {
    /// Socket failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Metadata failure
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Peer sent a frame that does not fit the exchange
    #[error("unexpected {0:?} frame")]
    Unexpected(FrameType),
}

/// Write an encoded frame and flush it
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame_bytes: &Bytes,
) -> Result<(), FrameError> {
    writer.write_all(frame_bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one frame from the socket
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    decoder: &FrameDecoder,
) -> Result<Frame, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let frame_len = u32::from_be_bytes(len_buf) as usize;
    decoder.check_len(frame_len)?;

    let mut body = vec![0u8; frame_len];
    reader.read_exact(&mut body).await?;
    trace!("Read frame body of {} bytes", frame_len);

    Ok(Frame::decode_body(Bytes::from(body))?)
}

/// Request to open a stream to a virtual port on another node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    /// Dialing node
    pub src_node: u64,
    /// Target node
    pub dst_node: u64,
    /// Target virtual port
    pub port: u16,
    /// Whether the datagram port namespace is targeted
    pub datagram: bool,
    /// Mesh address of the dialing side, as the acceptor should report it
    pub src_addr: String,
}

impl OpenRequest {
    /// Encode the request as an `Open` frame
    pub fn encode(&self, max_frame_size: usize) -> Result<Bytes, CodecError> {
        let mut fast = FastHeader::new(FrameType::Open, self.src_node, self.dst_node);
        fast.port = self.port;

        let flags = if self.datagram {
            Flags::DATAGRAM
        } else {
            Flags::empty()
        };

        FrameBuilder::new(fast)
            .flags(flags)
            .meta_insert_str("src_addr", &self.src_addr)
            .build(max_frame_size)
    }

    /// Decode an `Open` frame
    pub fn decode(frame: &Frame) -> Result<Self, FrameError> {
        if frame.fast.typ != FrameType::Open {
            return Err(FrameError::Unexpected(frame.fast.typ));
        }

        let meta = parse_meta(&frame.meta_raw)?;
        let src_addr = get_meta_str(&meta, "src_addr")
            .ok_or(FrameError::Wire(WireError::Malformed))?
            .to_string();

        Ok(Self {
            src_node: frame.fast.src_node,
            dst_node: frame.fast.dst_node,
            port: frame.fast.port,
            datagram: frame.fast.flags.contains(Flags::DATAGRAM),
            src_addr,
        })
    }

    fn header(&self) -> FastHeader {
        let mut fast = FastHeader::new(FrameType::Open, self.src_node, self.dst_node);
        fast.port = self.port;
        fast
    }
}

/// Answer received for an `Open`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Stream accepted; raw bytes follow
    Accepted,
    /// Stream refused
    Rejected {
        /// Refusal code
        code: StatusCode,
        /// Human readable reason
        reason: String,
    },
}

/// Send an `Open` frame and wait for the answer
pub async fn send_open<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    request: &OpenRequest,
    decoder: &FrameDecoder,
) -> Result<OpenOutcome, FrameError> {
    let bytes = request.encode(decoder.max_frame_size())?;
    write_frame(stream, &bytes).await?;
    debug!(
        "Sent OPEN node {} -> node {} port {}",
        request.src_node, request.dst_node, request.port
    );

    let reply = read_frame(stream, decoder).await?;
    match reply.fast.typ {
        FrameType::Accept => Ok(OpenOutcome::Accepted),
        FrameType::Reject => {
            let meta = parse_meta(&reply.meta_raw)?;
            let reason = get_meta_str(&meta, "reason")
                .unwrap_or("connection refused")
                .to_string();
            Ok(OpenOutcome::Rejected {
                code: reply.fast.code,
                reason,
            })
        }
        other => Err(FrameError::Unexpected(other)),
    }
}

/// Answer a received `Open` frame
pub async fn answer_open<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request: &OpenRequest,
    outcome: &OpenOutcome,
    max_frame_size: usize,
) -> Result<(), FrameError> {
    let open = request.header();
    let bytes = match outcome {
        OpenOutcome::Accepted => {
            FrameBuilder::new(open.reply(FrameType::Accept, StatusCode::Ok)).build(max_frame_size)?
        }
        OpenOutcome::Rejected { code, reason } => {
            FrameBuilder::new(open.reply(FrameType::Reject, *code))
                .meta_insert_str("reason", reason)
                .build(max_frame_size)?
        }
    };
    write_frame(writer, &bytes).await
}
