//! Frame assembly and the string-keyed CBOR metadata carried by control and
//! handshake frames.

use crate::frame::Frame;
use crate::header::{FastHeader, Flags};
use bytes::Bytes;
use ciborium::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Decoded frame metadata. Keys and values are both text on this mesh.
pub type Meta = BTreeMap<String, String>;

/// Builds one frame: header, metadata and an optional payload
#[derive(Debug)]
pub struct FrameBuilder {
    fast: FastHeader,
    meta: Meta,
    payload: Bytes,
}

impl FrameBuilder {
    /// Start from a header with no metadata or payload
    pub fn new(fast: FastHeader) -> Self {
        Self {
            fast,
            meta: Meta::new(),
            payload: Bytes::new(),
        }
    }

    /// OR `flags` into the header
    pub fn flags(mut self, flags: Flags) -> Self {
        self.fast.flags |= flags;
        self
    }

    /// Attach a metadata entry; a repeated key keeps the last value
    pub fn meta_insert_str(mut self, key: &str, value: &str) -> Self {
        self.meta.insert(key.to_owned(), value.to_owned());
        self
    }

    /// Bytes carried after the metadata
    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Assemble the frame without length-checking or encoding it
    pub fn build_frame(self) -> Result<Frame, CodecError> {
        let meta_raw = encode_meta(self.meta)?;
        Ok(Frame::new(self.fast, meta_raw, self.payload))
    }

    /// Assemble and encode, refusing frames above `max_frame_size`
    pub fn build(self, max_frame_size: usize) -> Result<Bytes, CodecError> {
        Ok(self.build_frame()?.encode(max_frame_size)?)
    }
}

/// Errors from metadata handling or the frame layer beneath it
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// CBOR serialization failed
    #[error("frame metadata could not be serialized")]
    MetaEncode,

    /// Metadata is not a CBOR map of text to text
    #[error("frame metadata is not a text map")]
    MetaDecode,

    /// Header or length failure
    #[error(transparent)]
    Wire(#[from] crate::WireError),
}

// BTreeMap iteration keeps the encoding canonical: keys in sorted order.
fn encode_meta(meta: Meta) -> Result<Bytes, CodecError> {
    if meta.is_empty() {
        return Ok(Bytes::new());
    }

    let entries = meta
        .into_iter()
        .map(|(k, v)| (Value::Text(k), Value::Text(v)))
        .collect();

    let mut out = Vec::new();
    ciborium::into_writer(&Value::Map(entries), &mut out).map_err(|_| CodecError::MetaEncode)?;
    Ok(out.into())
}

/// Decode a metadata section; an empty section is an empty map
pub fn parse_meta(meta_raw: &[u8]) -> Result<Meta, CodecError> {
    if meta_raw.is_empty() {
        return Ok(Meta::new());
    }

    let Ok(Value::Map(entries)) = ciborium::from_reader::<Value, _>(meta_raw) else {
        return Err(CodecError::MetaDecode);
    };

    entries
        .into_iter()
        .map(|entry| match entry {
            (Value::Text(k), Value::Text(v)) => Ok((k, v)),
            _ => Err(CodecError::MetaDecode),
        })
        .collect()
}

/// Look up a metadata entry
pub fn get_meta_str<'a>(meta: &'a Meta, key: &str) -> Option<&'a str> {
    meta.get(key).map(String::as_str)
}
