//! Error types for the carbonlink client.
//!
//! None of these escape [`crate::Carbonlink::query`]: the pool absorbs them
//! and answers with the empty sentinel. They exist so the wire layer can
//! report *why* a probe failed, which ends up in the logs.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the payload codec.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("failed to encode request: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode reply: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("pickle codec: {0}")]
    Pickle(#[from] serde_pickle::Error),
}

/// Errors raised by a single wire connection.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("no live connection")]
    NotConnected,

    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("reply timed out after {0:?}")]
    Timeout(Duration),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("connection I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
