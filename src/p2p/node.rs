//! P2P overlay node
//!
//! A node is at the same time a server accepting inbound peer links and a
//! directory of the outbound links it dialed itself. Callers can disconnect a
//! link by id without knowing which side opened it.
//!
//! Dead outbound links are collected lazily: every operation that walks the
//! outbound map first evicts clients that report "not connected".

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::client::Client;
use super::connection::{Connection, ConnectionId, MessageService};
use super::error::TransportError;
use super::server::Server;
use super::TransportConfig;

/// One link in a [`NodeSnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct LinkInfo {
    pub id: u64,
    pub remote: String,
}

/// Point-in-time view of a node for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub listen_addr: String,
    pub running: bool,
    pub inbound: Vec<LinkInfo>,
    pub outbound: Vec<LinkInfo>,
}

impl std::fmt::Display for NodeSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let render = |links: &[LinkInfo]| {
            links
                .iter()
                .map(|l| format!("#{}@{}", l.id, l.remote))
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(
            f,
            "P2PNode[{}] running={} inbound({})=[{}] outbound({})=[{}]",
            self.listen_addr,
            self.running,
            self.inbound.len(),
            render(&self.inbound),
            self.outbound.len(),
            render(&self.outbound),
        )
    }
}

pub struct P2PNode<S: MessageService> {
    listen_addr: String,
    service: Arc<S>,
    config: TransportConfig,
    server: Mutex<Option<Arc<Server<S>>>>,
    outbound: Mutex<HashMap<ConnectionId, Arc<Client<S>>>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl<S: MessageService> P2PNode<S> {
    pub fn new(listen_addr: impl Into<String>, service: Arc<S>, config: TransportConfig) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            service,
            config,
            server: Mutex::new(None),
            outbound: Mutex::new(HashMap::new()),
            keepalive: Mutex::new(None),
        }
    }

    /// Start listening with a fresh outbound map. A no-op when running.
    pub async fn start(&self) -> Result<(), TransportError> {
        if self.is_running() {
            info!(addr = %self.listen_addr, "[P2P] Node already running");
            return Ok(());
        }

        *self.outbound.lock() = HashMap::new();

        let server = Arc::new(Server::new(self.service.clone(), self.config.clone()));
        let bound = server.start(&self.listen_addr).await?;
        *self.server.lock() = Some(server);

        info!(addr = %bound, "[P2P] Node started");
        Ok(())
    }

    /// Stop the server, then close every outbound link concurrently.
    /// A no-op when not running.
    pub async fn stop(&self) {
        let server = self.server.lock().take();
        let Some(server) = server else {
            info!(addr = %self.listen_addr, "[P2P] Node not running, nothing to stop");
            return;
        };

        if let Some(task) = self.keepalive.lock().take() {
            task.abort();
        }

        server.stop().await;

        let clients: Vec<_> = self.outbound.lock().drain().map(|(_, c)| c).collect();
        let count = clients.len();
        join_all(clients.iter().map(|c| c.disconnect())).await;

        info!(addr = %self.listen_addr, outbound = count, "[P2P] Node stopped");
    }

    pub fn is_running(&self) -> bool {
        self.server.lock().as_ref().is_some_and(|s| s.is_running())
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().as_ref().and_then(|s| s.local_addr())
    }

    /// Dial `addr` and track the link. `None` when the dial fails.
    pub async fn connect(&self, addr: &str) -> Option<Arc<Connection<S::Message>>> {
        let client = Arc::new(Client::new(addr, self.service.clone(), self.config.clone()));
        match client.connect().await {
            Ok(conn) => {
                self.outbound.lock().insert(conn.id(), client);
                Some(conn)
            }
            Err(e) => {
                warn!(peer = %addr, error = %e, "[P2P] Outbound connect failed");
                None
            }
        }
    }

    /// Close a link by id, whichever side opened it.
    pub async fn disconnect(&self, id: ConnectionId) -> bool {
        self.evict_dead();

        let client = self.outbound.lock().remove(&id);
        if let Some(client) = client {
            client.disconnect().await;
            return true;
        }

        match self.server() {
            Some(server) => server.disconnect(id).await,
            None => false,
        }
    }

    /// Drop outbound clients whose connection has closed. Returns how many.
    pub fn evict_dead(&self) -> usize {
        let mut map = self.outbound.lock();
        let before = map.len();
        map.retain(|id, client| {
            let keep = client.is_connected();
            if !keep {
                debug!(conn = %id, peer = %client.addr(), "[P2P] Evicting dead outbound link");
            }
            keep
        });
        before - map.len()
    }

    /// Live links this node dialed.
    pub fn outbound_connections(&self) -> Vec<Arc<Connection<S::Message>>> {
        self.evict_dead();
        self.outbound
            .lock()
            .values()
            .filter_map(|c| c.connection())
            .collect()
    }

    /// Live links accepted by this node's server.
    pub fn inbound_connections(&self) -> Vec<Arc<Connection<S::Message>>> {
        self.server()
            .map(|s| s.connections())
            .unwrap_or_default()
    }

    pub fn outbound_count(&self) -> usize {
        self.outbound_connections().len()
    }

    pub fn inbound_count(&self) -> usize {
        self.inbound_connections().len()
    }

    /// Apply `send` to every outbound link (the servers this node dialed).
    pub fn broadcast_to_server_with<F>(&self, msg: &S::Message, mut send: F) -> (usize, usize)
    where
        F: FnMut(&Arc<Connection<S::Message>>, &S::Message) -> Result<(), TransportError>,
    {
        let targets = self.outbound_connections();

        let mut success = 0;
        let mut failure = 0;
        for conn in &targets {
            match send(conn, msg) {
                Ok(()) => success += 1,
                Err(e) => {
                    failure += 1;
                    error!(conn = %conn.id(), peer = %conn.remote_addr(), error = %e, "Failed to send message to server");
                }
            }
        }
        (success, failure)
    }

    pub fn broadcast_to_server(&self, msg: &S::Message) -> (usize, usize)
    where
        S::Message: Clone,
    {
        self.broadcast_to_server_with(msg, |conn, m| conn.send(m.clone()))
    }

    /// Apply `send` to every inbound link (the clients that dialed this node).
    pub fn broadcast_to_client_with<F>(&self, msg: &S::Message, send: F) -> (usize, usize)
    where
        F: FnMut(&Arc<Connection<S::Message>>, &S::Message) -> Result<(), TransportError>,
    {
        match self.server() {
            Some(server) => server.broadcast_with(msg, send),
            None => (0, 0),
        }
    }

    pub fn broadcast_to_client(&self, msg: &S::Message) -> (usize, usize)
    where
        S::Message: Clone,
    {
        self.broadcast_to_client_with(msg, |conn, m| conn.send(m.clone()))
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let link = |c: &Arc<Connection<S::Message>>| LinkInfo {
            id: c.id().as_u64(),
            remote: c.remote_addr().to_string(),
        };
        NodeSnapshot {
            listen_addr: self
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|| self.listen_addr.clone()),
            running: self.is_running(),
            inbound: self.inbound_connections().iter().map(link).collect(),
            outbound: self.outbound_connections().iter().map(link).collect(),
        }
    }

    fn server(&self) -> Option<Arc<Server<S>>> {
        self.server.lock().clone()
    }
}

impl<S> P2PNode<S>
where
    S: MessageService,
    S::Message: Clone,
{
    /// Broadcast `msg` to every inbound link each `interval` until the node
    /// stops. Replaces a previously spawned keepalive loop.
    pub fn spawn_keepalive(self: &Arc<Self>, interval: Duration, msg: S::Message) {
        let node: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(node) = node.upgrade() else { break };
                if !node.is_running() {
                    break;
                }
                let (success, failure) = node.broadcast_to_client(&msg);
                if success > 0 || failure > 0 {
                    debug!(success = success, failure = failure, "Keepalive sent");
                }
            }
        });

        if let Some(previous) = self.keepalive.lock().replace(task) {
            previous.abort();
        }
    }
}

impl<S: MessageService> std::fmt::Display for P2PNode<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.snapshot().fmt(f)
    }
}
