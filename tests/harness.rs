#![allow(dead_code)]

use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chain_relay::p2p::{
    ChainHandler, Connection, HandlerResult, Message, MessageService, MessageType, Outbound,
    TransportConfig,
};
use parking_lot::Mutex;

/// Service that records every inbound message.
///
/// Echoes messages back when built with [`Recorder::echoing`]; a payload of
/// `fail` makes the handler return an error.
pub struct Recorder {
    received: Mutex<Vec<Message>>,
    echo: bool,
    disconnects: AtomicUsize,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
            echo: false,
            disconnects: AtomicUsize::new(0),
        })
    }

    pub fn echoing() -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
            echo: true,
            disconnects: AtomicUsize::new(0),
        })
    }

    pub fn messages(&self) -> Vec<Message> {
        self.received.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.received.lock().len()
    }

    pub fn count_of(&self, kind: MessageType) -> usize {
        self.received
            .lock()
            .iter()
            .filter(|m| m.kind() == Ok(kind))
            .count()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

impl MessageService for Recorder {
    type Message = Message;

    fn handle(
        &self,
        _conn: &Arc<Connection<Message>>,
        outbound: &Outbound<Message>,
        msg: Message,
    ) -> HandlerResult {
        if msg.payload() == b"fail" {
            anyhow::bail!("handler asked to fail");
        }
        self.received.lock().push(msg.clone());
        if self.echo {
            outbound.try_send(msg)?;
        }
        Ok(())
    }

    fn on_disconnect(&self, _conn: &Connection<Message>) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// Chain callback that keeps `(src, dst, payload, signature)` tuples.
///
/// A payload of `bad` makes the callback fail.
#[derive(Clone, Default)]
pub struct ChainLog {
    entries: Arc<Mutex<Vec<(String, String, Vec<u8>, Vec<u8>)>>>,
}

impl ChainLog {
    pub fn entries(&self) -> Vec<(String, String, Vec<u8>, Vec<u8>)> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl ChainHandler for ChainLog {
    fn on_chain_message(
        &self,
        src_id: &str,
        dst_id: &str,
        payload: &[u8],
        signature: &[u8],
    ) -> anyhow::Result<()> {
        if payload == b"bad" {
            anyhow::bail!("rejected payload");
        }
        self.entries.lock().push((
            src_id.to_string(),
            dst_id.to_string(),
            payload.to_vec(),
            signature.to_vec(),
        ));
        Ok(())
    }
}

pub fn test_config() -> TransportConfig {
    TransportConfig {
        read_timeout: Duration::from_secs(5),
        write_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
        ..TransportConfig::default()
    }
}

/// An address nothing listens on: bind an ephemeral port, then release it.
pub fn refused_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    addr.to_string()
}

/// Poll `cond` every 10ms until it holds or `timeout` passes.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
