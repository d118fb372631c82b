//! chain-relay: framed TCP transport, P2P overlay and self-healing peer links
//! for relaying chain payloads between nodes.

pub mod config;
pub mod p2p;
