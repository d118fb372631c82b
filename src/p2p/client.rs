//! Client-mode connection manager
//!
//! One outbound dial to one address. There is no retry here: callers that
//! want resilience (see [`Peer`](super::peer::Peer)) decide when to dial again.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use super::connection::{self, Connection, MessageService};
use super::error::TransportError;
use super::TransportConfig;

pub struct Client<S: MessageService> {
    addr: String,
    service: Arc<S>,
    config: TransportConfig,
    conn: Mutex<Option<Arc<Connection<S::Message>>>>,
}

impl<S: MessageService> Client<S> {
    pub fn new(addr: impl Into<String>, service: Arc<S>, config: TransportConfig) -> Self {
        Self {
            addr: addr.into(),
            service,
            config,
            conn: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Dial the target once and start the connection's tasks.
    ///
    /// Returns the existing connection if one is still open.
    pub async fn connect(&self) -> Result<Arc<Connection<S::Message>>, TransportError> {
        if let Some(conn) = self.connection() {
            debug!(peer = %self.addr, "[P2P] Already connected");
            return Ok(conn);
        }

        let stream = match timeout(self.config.connect_timeout, TcpStream::connect(self.addr.as_str())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TransportError::Dial {
                    addr: self.addr.clone(),
                    source: e,
                })
            }
            Err(_) => return Err(TransportError::DialTimeout(self.addr.clone())),
        };

        let conn = connection::spawn(stream, self.service.clone(), &self.config, None)?;
        let previous = self.conn.lock().replace(conn.clone());
        if let Some(previous) = previous {
            previous.close();
        }

        info!(peer = %self.addr, conn = %conn.id(), "[P2P] Outbound connection established");
        Ok(conn)
    }

    /// Close the connection and wait for its tasks to stop.
    pub async fn disconnect(&self) {
        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            conn.shutdown().await;
            debug!(peer = %self.addr, conn = %conn.id(), "[P2P] Outbound connection closed");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.lock().as_ref().is_some_and(|c| c.is_alive())
    }

    /// Current connection, if it is still open.
    pub fn connection(&self) -> Option<Arc<Connection<S::Message>>> {
        self.conn
            .lock()
            .as_ref()
            .filter(|c| c.is_alive())
            .cloned()
    }

    /// Queue a message on the current connection without waiting.
    pub fn send(&self, msg: S::Message) -> Result<(), TransportError> {
        match self.connection() {
            Some(conn) => conn.send(msg),
            None => Err(TransportError::NotConnected),
        }
    }
}

impl<S: MessageService> Drop for Client<S> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.get_mut().take() {
            conn.close();
        }
    }
}
