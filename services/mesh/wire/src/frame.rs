//! Message framing for the wire protocol.
//!
//! This module provides the complete frame structure (fast header, metadata
//! and payload) plus a buffer-driven decoder.

use crate::header::{FastHeader, FAST_HEADER_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum frame size (1 MiB default, 16 MiB hard limit)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;
/// Hard maximum frame size limit (16 MiB)
pub const HARD_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum metadata size (64 KiB)
pub const MAX_META_SIZE: usize = 64 * 1024;

/// Complete wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Fast header (32 bytes)
    pub fast: FastHeader,
    /// Metadata as raw CBOR bytes
    pub meta_raw: Bytes,
    /// Payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(fast: FastHeader, meta_raw: Bytes, payload: Bytes) -> Self {
        Self {
            fast,
            meta_raw,
            payload,
        }
    }

    /// Get the total frame size when encoded
    pub fn encoded_size(&self) -> usize {
        4 + FAST_HEADER_SIZE + 4 + self.meta_raw.len() + self.payload.len()
    }

    /// Encode frame to a contiguous buffer
    pub fn encode(&self, max_frame_size: usize) -> Result<Bytes, crate::WireError> {
        let total_size = self.encoded_size();
        if total_size > max_frame_size.min(HARD_MAX_FRAME_SIZE) {
            return Err(crate::WireError::Size(total_size));
        }
        if self.meta_raw.len() > MAX_META_SIZE {
            return Err(crate::WireError::Meta);
        }

        let mut buf = BytesMut::with_capacity(total_size);

        // Frame length (everything after this u32)
        buf.put_u32((total_size - 4) as u32);
        self.fast.encode(&mut buf);
        buf.put_u32(self.meta_raw.len() as u32);
        buf.put_slice(&self.meta_raw);
        buf.put_slice(&self.payload);

        Ok(buf.freeze())
    }

    /// Decode the body of a frame (everything after the length prefix)
    pub fn decode_body(mut body: Bytes) -> Result<Self, crate::WireError> {
        let fast = FastHeader::decode(&mut body)?;

        if body.len() < 4 {
            return Err(crate::WireError::Malformed);
        }

        let meta_len = body.get_u32() as usize;
        if meta_len > MAX_META_SIZE || body.len() < meta_len {
            return Err(crate::WireError::Meta);
        }

        let meta_raw = body.split_to(meta_len);

        Ok(Frame {
            fast,
            meta_raw,
            payload: body,
        })
    }
}

/// Frame decoder for parsing incoming frames
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a decoder with a custom frame size limit (capped at the hard limit)
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(HARD_MAX_FRAME_SIZE),
        }
    }

    /// Configured frame size limit
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Validate a length prefix against the configured limit
    pub fn check_len(&self, frame_len: usize) -> Result<(), crate::WireError> {
        if frame_len > self.max_frame_size {
            return Err(crate::WireError::Size(frame_len));
        }
        if frame_len < FAST_HEADER_SIZE + 4 {
            return Err(crate::WireError::Malformed);
        }
        Ok(())
    }

    /// Decode one frame from a buffer
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, crate::WireError> {
        // Need at least 4 bytes for frame length
        if buf.len() < 4 {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        self.check_len(frame_len)?;

        if buf.len() < 4 + frame_len {
            return Ok(None);
        }

        buf.advance(4);
        let body = buf.split_to(frame_len).freeze();
        Frame::decode_body(body).map(Some)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::FrameType;

    fn sample() -> Frame {
        Frame::new(
            FastHeader::new(FrameType::Open, 1, 2),
            Bytes::from_static(&[0xa0]),
            Bytes::from_static(b"payload"),
        )
    }

    #[test]
    fn test_decode_waits_for_complete_frame() {
        let encoded = sample().encode(DEFAULT_MAX_FRAME_SIZE).unwrap();
        let mut decoder = FrameDecoder::new();

        let mut partial = BytesMut::from(&encoded[..encoded.len() - 3]);
        assert!(decoder.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&encoded[encoded.len() - 3..]);
        partial.extend_from_slice(b"trailing");
        let frame = decoder.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame, sample());
        assert_eq!(&partial[..], b"trailing");
    }

    #[test]
    fn test_size_limits() {
        let frame = sample();
        assert_eq!(
            frame.encode(16),
            Err(crate::WireError::Size(frame.encoded_size()))
        );

        let mut decoder = FrameDecoder::with_max_frame_size(64);
        let mut buf = BytesMut::from(&1024u32.to_be_bytes()[..]);
        assert_eq!(decoder.decode(&mut buf), Err(crate::WireError::Size(1024)));

        let mut short = BytesMut::from(&4u32.to_be_bytes()[..]);
        assert_eq!(decoder.decode(&mut short), Err(crate::WireError::Malformed));
    }

    #[test]
    fn test_meta_length_overrun() {
        let encoded = sample().encode(DEFAULT_MAX_FRAME_SIZE).unwrap();
        let mut corrupted = BytesMut::from(&encoded[..]);
        let meta_len_at = 4 + FAST_HEADER_SIZE;
        corrupted[meta_len_at..meta_len_at + 4].copy_from_slice(&500u32.to_be_bytes());

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.decode(&mut corrupted), Err(crate::WireError::Meta));
    }
}
