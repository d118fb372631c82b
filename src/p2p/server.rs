//! Server-mode connection manager
//!
//! Owns one TCP listener and every connection it accepted. Accepted
//! connections are tracked by [`ConnectionId`] for broadcast and shutdown and
//! drop out of the set on their own when their reader task exits.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::connection::{self, Connection, ConnectionId, MessageService};
use super::error::TransportError;
use super::TransportConfig;

type ConnectionMap<M> = Arc<Mutex<HashMap<ConnectionId, Arc<Connection<M>>>>>;

struct ListenerState {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct Server<S: MessageService> {
    service: Arc<S>,
    config: TransportConfig,
    listener: Mutex<Option<ListenerState>>,
    connections: ConnectionMap<S::Message>,
}

impl<S: MessageService> Server<S> {
    pub fn new(service: Arc<S>, config: TransportConfig) -> Self {
        Self {
            service,
            config,
            listener: Mutex::new(None),
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Bind `addr` and start accepting. Returns the bound address, which
    /// differs from `addr` when port 0 was requested.
    pub async fn start(&self, addr: &str) -> Result<SocketAddr, TransportError> {
        if let Some(local) = self.local_addr() {
            warn!(addr = %local, "[P2P] Server already running");
            return Ok(local);
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::Bind {
                addr: addr.to_string(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            listener,
            shutdown_rx,
            self.service.clone(),
            self.config.clone(),
            self.connections.clone(),
        ));

        *self.listener.lock() = Some(ListenerState {
            local_addr,
            shutdown,
            task,
        });

        info!("[P2P] Listener started on {}", local_addr);
        Ok(local_addr)
    }

    /// Close the listener, then every tracked connection, waiting for their
    /// tasks to exit. A no-op when not running.
    pub async fn stop(&self) {
        let state = self.listener.lock().take();
        let Some(state) = state else {
            warn!("[P2P] Server stop requested but it is not running");
            return;
        };

        let _ = state.shutdown.send(true);
        let _ = state.task.await;

        let conns: Vec<_> = self.connections.lock().drain().map(|(_, c)| c).collect();
        let count = conns.len();
        join_all(conns.iter().map(|c| c.shutdown())).await;

        info!(addr = %state.local_addr, connections = count, "[P2P] Listener stopped");
    }

    pub fn is_running(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(|s| !s.task.is_finished())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().as_ref().map(|s| s.local_addr)
    }

    /// Close one tracked connection. Returns false if it was not tracked.
    pub async fn disconnect(&self, id: ConnectionId) -> bool {
        let conn = self.connections.lock().remove(&id);
        match conn {
            Some(conn) => {
                conn.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.lock().contains_key(&id)
    }

    /// Snapshot of live inbound connections.
    pub fn connections(&self) -> Vec<Arc<Connection<S::Message>>> {
        self.connections
            .lock()
            .values()
            .filter(|c| c.is_alive())
            .cloned()
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Apply `send` to every live connection. A failure on one connection is
    /// logged and does not stop delivery to the rest.
    ///
    /// Returns `(delivered, failed)`.
    pub fn broadcast_with<F>(&self, msg: &S::Message, mut send: F) -> (usize, usize)
    where
        F: FnMut(&Arc<Connection<S::Message>>, &S::Message) -> Result<(), TransportError>,
    {
        let targets = self.connections();

        let mut success = 0;
        let mut failure = 0;
        for conn in &targets {
            match send(conn, msg) {
                Ok(()) => {
                    success += 1;
                    debug!(conn = %conn.id(), peer = %conn.remote_addr(), "Sent message to peer");
                }
                Err(e) => {
                    failure += 1;
                    error!(conn = %conn.id(), peer = %conn.remote_addr(), error = %e, "Failed to send message to peer");
                }
            }
        }
        (success, failure)
    }

    /// Queue a copy of `msg` on every live connection.
    pub fn broadcast(&self, msg: &S::Message) -> (usize, usize)
    where
        S::Message: Clone,
    {
        self.broadcast_with(msg, |conn, m| conn.send(m.clone()))
    }
}

impl<S: MessageService> Drop for Server<S> {
    fn drop(&mut self) {
        if let Some(state) = self.listener.get_mut().take() {
            let _ = state.shutdown.send(true);
        }
        for conn in self.connections.lock().values() {
            conn.close();
        }
    }
}

async fn accept_loop<S: MessageService>(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    service: Arc<S>,
    config: TransportConfig,
    connections: ConnectionMap<S::Message>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                info!("[P2P] Inbound TCP accepted from {}", peer_addr);

                let tracked = connections.clone();
                let on_close: connection::OnClose = Box::new(move |id| {
                    tracked.lock().remove(&id);
                });

                match connection::spawn(stream, service.clone(), &config, Some(on_close)) {
                    Ok(conn) => {
                        let mut map = connections.lock();
                        map.insert(conn.id(), conn.clone());
                        // it may already have died before it was tracked
                        if !conn.is_alive() {
                            map.remove(&conn.id());
                        }
                    }
                    Err(e) => warn!(peer = %peer_addr, error = %e, "[P2P] Failed to set up inbound connection"),
                }
            }
        }
    }
    debug!("[P2P] Accept loop exited");
}
