//! Fixed-size frame header.
//!
//! Defines the 32-byte fast header that every control and
//! handshake frame starts with. Control replies and stream-open answers can be
//! dispatched from the header alone, without touching the metadata.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Version byte every header carries
pub const WIRE_VERSION: u8 = 1;

/// Encoded header length
pub const FAST_HEADER_SIZE: usize = 32;

/// What a frame asks for or answers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameType {
    /// Node registration with the control plane
    Register = 0x10,
    /// Name or address lookup against the control plane
    Resolve = 0x11,
    /// Node leaving the control plane
    Deregister = 0x12,
    /// Answer to any control request
    ControlReply = 0x13,
    /// Request to open a stream to a virtual port
    Open = 0x20,
    /// Stream accepted, raw bytes follow
    Accept = 0x21,
    /// Stream refused
    Reject = 0x22,
}

impl TryFrom<u8> for FrameType {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x10 => Ok(FrameType::Register),
            0x11 => Ok(FrameType::Resolve),
            0x12 => Ok(FrameType::Deregister),
            0x13 => Ok(FrameType::ControlReply),
            0x20 => Ok(FrameType::Open),
            0x21 => Ok(FrameType::Accept),
            0x22 => Ok(FrameType::Reject),
            _ => Err(crate::WireError::Type(value)),
        }
    }
}

bitflags! {
    /// Per-frame option bits; unknown bits are rejected on decode
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Flags: u16 {
        /// Stream targets the datagram port namespace
        const DATAGRAM = 1 << 0;
        /// Registering node is ephemeral
        const EPHEMERAL = 1 << 1;
    }
}

/// Status codes for control replies and stream-open answers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    /// Success
    Ok = 0,
    /// Transient failure, the request may be repeated
    Retryable = 1,
    /// Permanent failure
    Fatal = 2,
    /// Missing or rejected credentials
    Unauthorized = 3,
    /// Unknown node, name or port
    NotFound = 4,
    /// Peer is at capacity
    Busy = 5,
    /// Request not understood or malformed
    Unsupported = 6,
}

impl TryFrom<u8> for StatusCode {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StatusCode::Ok),
            1 => Ok(StatusCode::Retryable),
            2 => Ok(StatusCode::Fatal),
            3 => Ok(StatusCode::Unauthorized),
            4 => Ok(StatusCode::NotFound),
            5 => Ok(StatusCode::Busy),
            6 => Ok(StatusCode::Unsupported),
            _ => Err(crate::WireError::Code(value)),
        }
    }
}

/// Header that precedes metadata and payload in every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastHeader {
    /// Always `WIRE_VERSION`
    pub ver: u8,
    /// Request or answer kind
    pub typ: FrameType,
    /// Option bits
    pub flags: Flags,
    /// Outcome, meaningful on replies only
    pub code: StatusCode,
    /// Zero on the wire
    pub reserved0: u8,
    /// Destination virtual port for `Open`, zero otherwise
    pub port: u16,
    /// Correlation ID echoed by replies (0 if none)
    pub corr_id: u64,
    /// Source node ID (0 while unregistered)
    pub src_node: u64,
    /// Destination node ID (0 for the control plane)
    pub dst_node: u64,
}

impl FastHeader {
    /// Header for a fresh request between two nodes
    pub fn new(typ: FrameType, src_node: u64, dst_node: u64) -> Self {
        Self {
            ver: WIRE_VERSION,
            typ,
            flags: Flags::empty(),
            code: StatusCode::Ok,
            reserved0: 0,
            port: 0,
            corr_id: 0,
            src_node,
            dst_node,
        }
    }

    /// Build a reply header for this frame, swapping source and destination
    pub fn reply(&self, typ: FrameType, code: StatusCode) -> Self {
        Self {
            code,
            corr_id: self.corr_id,
            port: self.port,
            ..Self::new(typ, self.dst_node, self.src_node)
        }
    }

    /// Append the header in network byte order
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.ver);
        buf.put_u8(self.typ as u8);
        buf.put_u16(self.flags.bits());
        buf.put_u8(self.code as u8);
        buf.put_u8(self.reserved0);
        buf.put_u16(self.port);
        buf.put_u64(self.corr_id);
        buf.put_u64(self.src_node);
        buf.put_u64(self.dst_node);
    }

    /// Consume a header from the front of `buf`
    pub fn decode(buf: &mut Bytes) -> Result<Self, crate::WireError> {
        use crate::WireError;

        match buf.first() {
            None => return Err(WireError::Incomplete),
            Some(&v) if v != WIRE_VERSION => return Err(WireError::Version(v)),
            Some(_) if buf.len() < FAST_HEADER_SIZE => return Err(WireError::Incomplete),
            Some(_) => {}
        }

        let ver = buf.get_u8();
        let typ = buf.get_u8().try_into()?;
        let flags = Flags::from_bits(buf.get_u16()).ok_or(WireError::Reserved)?;
        let code = buf.get_u8().try_into()?;
        let reserved0 = match buf.get_u8() {
            0 => 0,
            _ => return Err(WireError::Reserved),
        };

        Ok(Self {
            ver,
            typ,
            flags,
            code,
            reserved0,
            port: buf.get_u16(),
            corr_id: buf.get_u64(),
            src_node: buf.get_u64(),
            dst_node: buf.get_u64(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::try_from(0x10).unwrap(), FrameType::Register);
        assert_eq!(FrameType::try_from(0x22).unwrap(), FrameType::Reject);
        assert!(FrameType::try_from(0xFF).is_err());
    }

    #[test]
    fn test_fast_header_layout() {
        let mut header = FastHeader::new(FrameType::Open, 0x1234567890ABCDEF, 7);
        header.flags = Flags::DATAGRAM;
        header.port = 8080;
        header.corr_id = 99;

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), FAST_HEADER_SIZE);
        assert_eq!(&buf[6..8], &8080u16.to_be_bytes());

        let mut bytes = buf.freeze();
        let decoded = FastHeader::decode(&mut bytes).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_reserved_and_unknown_bits_rejected() {
        let header = FastHeader::new(FrameType::Accept, 1, 2);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        let mut reserved = buf.clone();
        reserved[5] = 1;
        assert_eq!(
            FastHeader::decode(&mut reserved.freeze()),
            Err(crate::WireError::Reserved)
        );

        let mut flags = buf.clone();
        flags[2] = 0x80;
        assert_eq!(
            FastHeader::decode(&mut flags.freeze()),
            Err(crate::WireError::Reserved)
        );

        let mut version = buf;
        version[0] = 9;
        assert_eq!(
            FastHeader::decode(&mut version.freeze()),
            Err(crate::WireError::Version(9))
        );
    }

    #[test]
    fn test_reply_swaps_nodes() {
        let mut open = FastHeader::new(FrameType::Open, 11, 22);
        open.corr_id = 5;
        open.port = 443;

        let reply = open.reply(FrameType::Reject, StatusCode::Busy);
        assert_eq!(reply.src_node, 22);
        assert_eq!(reply.dst_node, 11);
        assert_eq!(reply.corr_id, 5);
        assert_eq!(reply.port, 443);
        assert_eq!(reply.code, StatusCode::Busy);
    }
}
