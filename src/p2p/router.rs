//! Router-side protocol service
//!
//! Answers the peer half of the protocol: registers peers on PEER_HELLO,
//! acknowledges keepalives and hands chain messages to the application.
//! Forwarding between peers is left to the chain handler.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::connection::{Connection, ConnectionId, HandlerResult, MessageService};
use super::handler::Outbound;
use super::peer::ChainHandler;
use super::protocol::{Message, MessageType};

pub struct RouterService {
    peers: DashMap<String, ConnectionId>,
    callback: Arc<dyn ChainHandler>,
}

impl RouterService {
    pub fn new<H: ChainHandler>(callback: H) -> Self {
        Self {
            peers: DashMap::new(),
            callback: Arc::new(callback),
        }
    }

    /// Registered peer ids with the connection each greeted on.
    pub fn peers(&self) -> Vec<(String, ConnectionId)> {
        let mut peers: Vec<_> = self
            .peers
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        peers.sort();
        peers
    }

    /// Connection a peer is registered on.
    pub fn connection_of(&self, peer_id: &str) -> Option<ConnectionId> {
        self.peers.get(peer_id).map(|e| *e.value())
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn reply(&self, conn: &Connection<Message>, outbound: &Outbound<Message>, msg: Message) {
        let kind = msg.kind().map(|k| k.to_string()).unwrap_or_default();
        if let Err(e) = outbound.try_send(msg) {
            warn!(conn = %conn.id(), kind = %kind, error = %e, "[ROUTER] Failed to queue reply");
        }
    }
}

impl MessageService for RouterService {
    type Message = Message;

    fn handle(
        &self,
        conn: &Arc<Connection<Message>>,
        outbound: &Outbound<Message>,
        msg: Message,
    ) -> HandlerResult {
        match msg.kind() {
            Ok(MessageType::PeerHello) => {
                let peer_id = msg.peer_id();
                if let Some(previous) = self.peers.insert(peer_id.clone(), conn.id()) {
                    if previous != conn.id() {
                        info!(peer = %peer_id, old = %previous, conn = %conn.id(), "[ROUTER] Peer re-registered");
                    }
                } else {
                    info!(peer = %peer_id, conn = %conn.id(), addr = %conn.remote_addr(), "[ROUTER] Peer registered");
                }
                self.reply(conn, outbound, Message::hello_ack());
            }
            Ok(MessageType::PeerClose) => {
                let peer_id = msg.peer_id();
                if self.peers.remove_if(&peer_id, |_, id| *id == conn.id()).is_some() {
                    info!(peer = %peer_id, conn = %conn.id(), "[ROUTER] Peer said goodbye");
                }
            }
            Ok(MessageType::Keepalive) => {
                self.reply(conn, outbound, Message::keepalive_ack());
            }
            Ok(MessageType::KeepaliveAck) => {
                debug!(conn = %conn.id(), "[ROUTER] KEEPALIVE_ACK");
            }
            Ok(MessageType::ChainMessage) => {
                let chain = msg.chain_message()?;
                debug!(conn = %conn.id(), msg = ?chain, "[ROUTER] Chain message received");
                self.callback
                    .on_chain_message(&chain.src_id, &chain.dst_id, &chain.payload, &chain.signature)?;
            }
            Ok(kind @ (MessageType::RouterSync | MessageType::RouterGet | MessageType::RouterClose)) => {
                debug!(conn = %conn.id(), kind = %kind, "[ROUTER] Reserved router message, no action");
            }
            Ok(MessageType::PeerHelloAck) => {
                debug!(conn = %conn.id(), "[ROUTER] Unexpected PEER_HELLO_ACK");
            }
            Err(tag) => {
                warn!(conn = %conn.id(), tag = tag, "[ROUTER] Unknown message type, ignoring");
            }
        }
        Ok(())
    }

    fn on_disconnect(&self, conn: &Connection<Message>) {
        let id = conn.id();
        self.peers.retain(|peer_id, registered| {
            let keep = *registered != id;
            if !keep {
                info!(peer = %peer_id, conn = %id, "[ROUTER] Peer unregistered");
            }
            keep
        });
    }
}
