//! Error types for the relay transport.
//!
//! Transport and framing errors are always fatal to the connection they
//! happen on and never to the process. Only start-up failures (bind, first
//! dial, bad address list) are returned to callers synchronously.

use std::io;

use thiserror::Error;

/// Failure to encode or decode a wire message.
#[derive(Debug, Error)]
#[error("codec error: {0}")]
pub struct CodecError(#[from] pub bincode::Error);

/// Errors from the length-prefixed framing layer.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("frame deadline elapsed")]
    Timeout,
    #[error("frame of {len} bytes exceeds maximum of {max} bytes")]
    TooLarge { len: u64, max: usize },
    #[error("empty frame")]
    Empty,
    #[error("connection closed by remote")]
    Closed,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Errors from the connection manager (server and client modes).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("failed to dial {addr}: {source}")]
    Dial { addr: String, source: io::Error },
    #[error("dial to {0} timed out")]
    DialTimeout(String),
    #[error("server is not running")]
    NotRunning,
    #[error("not connected")]
    NotConnected,
    #[error("outbound channel is full")]
    ChannelFull,
    #[error("outbound channel is closed")]
    ChannelClosed,
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Errors surfaced by the resilient [`Peer`](super::peer::Peer).
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("no router addresses configured")]
    NoAddresses,
    #[error("none of {0} router addresses accepted a connection")]
    Unreachable(usize),
    #[error("peer is already started")]
    AlreadyStarted,
    #[error("peer was stopped and cannot be restarted")]
    Spent,
    #[error("peer is not running")]
    NotRunning,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}
