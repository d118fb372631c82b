//! P2P relay transport
//!
//! Layers, leaves first:
//! - `framing`: 8-byte length-prefixed frames with deadlines and a size cap
//! - `handler` / `connection`: per-socket channels and reader/writer tasks
//! - `server` / `client`: connection managers for accepted and dialed sockets
//! - `node`: overlay of one server plus the outbound links it initiated
//! - `peer`: self-healing link to a router with keepalive and failover
//! - `router`: server-side protocol service for peers

use std::time::Duration;

pub mod client;
pub mod connection;
pub mod dial_tracker;
pub mod error;
pub mod framing;
pub mod handler;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod router;
pub mod server;

/// P2P timeouts
pub const READ_TIMEOUT_SECS: u64 = 60;
pub const WRITE_TIMEOUT_SECS: u64 = 10;
pub const DIAL_TIMEOUT_SECS: u64 = 5;

/// Socket-level settings shared by every connection a manager owns.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Capacity of each per-connection channel
    pub channel_capacity: usize,
    /// Largest serialized message accepted or sent
    pub max_message_size: usize,
    /// Deadline for reading one whole frame
    pub read_timeout: Duration,
    /// Deadline for writing one whole frame
    pub write_timeout: Duration,
    /// Deadline for an outbound TCP dial
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            channel_capacity: handler::DEFAULT_CHANNEL_CAPACITY,
            max_message_size: framing::MAX_MESSAGE_SIZE,
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            write_timeout: Duration::from_secs(WRITE_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DIAL_TIMEOUT_SECS),
        }
    }
}

pub use client::Client;
pub use connection::{Connection, ConnectionId, HandlerResult, MessageService};
pub use error::{CodecError, FrameError, PeerError, TransportError};
pub use handler::{ConnectionHandler, Outbound};
pub use node::{NodeSnapshot, P2PNode};
pub use peer::{ChainHandler, Peer, PeerConfig};
pub use protocol::{normalize_destination, ChainMessage, Message, MessageType, WireMessage};
pub use router::RouterService;
pub use server::Server;
