//! Carbonlink wire protocol.
//!
//! Every message, in both directions, is a 4-byte big-endian length followed
//! by exactly that many payload bytes. The payload format itself is owned by a
//! [`Codec`]. carbon-cache speaks Python pickle ([`PickleCodec`]);
//! [`MsgpackCodec`] is there for daemons and tests that prefer MessagePack.

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CodecError, LinkError};

/// Request type understood by the cache daemon.
pub const CACHE_QUERY: &str = "cache-query";

/// Upper bound on a frame in either direction. Well below `u32::MAX`, so
/// every accepted length fits the 4-byte prefix.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// A cache query for one metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: String,
    pub metric: String,
}

impl Request {
    pub fn cache_query(metric: impl Into<String>) -> Self {
        Self {
            kind: CACHE_QUERY.to_string(),
            metric: metric.into(),
        }
    }
}

/// Raw cached samples, in the order the daemon produced them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default)]
    pub datapoints: Vec<(i64, f64)>,
}

/// Serializes requests and parses replies.
///
/// Implementations only deal with payload bytes; framing is handled by
/// [`write_frame`] and [`read_frame`].
pub trait Codec: Send + Sync {
    fn encode(&self, request: &Request) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, payload: &[u8]) -> Result<Reply, CodecError>;
}

/// MessagePack payloads with named fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgpackCodec;

impl Codec for MsgpackCodec {
    fn encode(&self, request: &Request) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec_named(request)?)
    }

    fn decode(&self, payload: &[u8]) -> Result<Reply, CodecError> {
        Ok(rmp_serde::from_slice(payload)?)
    }
}

/// Python pickle payloads, as carbon-cache reads and writes them.
///
/// Requests are pickled as a dict `{"type": ..., "metric": ...}`. Replies
/// from Python 2 daemons carry byte-string keys, so those are decoded as
/// UTF-8.
#[derive(Debug, Clone, Copy, Default)]
pub struct PickleCodec;

impl Codec for PickleCodec {
    fn encode(&self, request: &Request) -> Result<Vec<u8>, CodecError> {
        Ok(serde_pickle::to_vec(request, serde_pickle::SerOptions::new())?)
    }

    fn decode(&self, payload: &[u8]) -> Result<Reply, CodecError> {
        Ok(serde_pickle::from_slice(
            payload,
            serde_pickle::DeOptions::new().decode_strings(),
        )?)
    }
}

/// Which payload codec a client speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Pickle,
    Msgpack,
}

impl CodecKind {
    pub fn codec(self) -> Arc<dyn Codec> {
        match self {
            Self::Pickle => Arc::new(PickleCodec),
            Self::Msgpack => Arc::new(MsgpackCodec),
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pickle => "pickle",
            Self::Msgpack => "msgpack",
        })
    }
}

impl FromStr for CodecKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pickle" => Ok(Self::Pickle),
            "msgpack" | "messagepack" => Ok(Self::Msgpack),
            other => Err(format!("unknown codec `{other}` (expected pickle or msgpack)")),
        }
    }
}

/// Prefix `payload` with its big-endian length.
pub fn frame(payload: &[u8]) -> Result<Vec<u8>, LinkError> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|_| payload.len() <= MAX_FRAME_LEN)
        .ok_or(LinkError::FrameTooLarge(payload.len()))?;

    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Write one framed message in a single `write_all`.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), LinkError> {
    writer.write_all(&frame(payload)?)?;
    writer.flush()?;
    Ok(())
}

/// Read one framed message and return its payload.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, LinkError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(LinkError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}
