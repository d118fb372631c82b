//! Live TCP connections and their reader/writer tasks
//!
//! Every accepted or dialed socket becomes one [`Connection`] driven by
//! exactly two tasks for its whole life:
//!
//! - the reader decodes frames into the inbound channel and, in the same
//!   task, dispatches them in order to the [`MessageService`];
//! - the writer drains the outbound channel onto the socket.
//!
//! Any read, write or handler error closes that connection only. Closing is
//! signalled through a watch channel so both tasks unblock immediately.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::{FrameError, TransportError};
use super::framing;
use super::handler::{ConnectionHandler, Outbound};
use super::protocol::WireMessage;
use super::TransportConfig;

static CONNECTION_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of one open socket. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(CONNECTION_INSTANCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Result type of message handling. Any error is fatal to the connection.
pub type HandlerResult = anyhow::Result<()>;

/// Protocol family plugged into the connection manager.
///
/// `handle` runs on the connection's reader task, so it must not block for
/// long; replies go through `outbound`.
pub trait MessageService: Send + Sync + 'static {
    type Message: WireMessage;

    fn handle(
        &self,
        conn: &Arc<Connection<Self::Message>>,
        outbound: &Outbound<Self::Message>,
        msg: Self::Message,
    ) -> HandlerResult;

    /// Called once from the reader task after the connection has closed.
    fn on_disconnect(&self, _conn: &Connection<Self::Message>) {}
}

/// Hook run once when a connection's reader task exits.
pub(crate) type OnClose = Box<dyn FnOnce(ConnectionId) + Send + 'static>;

/// One live bidirectional stream.
pub struct Connection<M> {
    id: ConnectionId,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    alive: AtomicBool,
    closed_tx: watch::Sender<bool>,
    outbound: Outbound<M>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<M: WireMessage> Connection<M> {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn outbound(&self) -> &Outbound<M> {
        &self.outbound
    }

    /// Queue a message for the writer without waiting.
    pub fn send(&self, msg: M) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::NotConnected);
        }
        self.outbound.try_send(msg)
    }

    /// Mark the connection closed and wake both tasks. Idempotent.
    pub fn close(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            debug!(conn = %self.id, peer = %self.remote_addr, "[P2P] Closing connection");
            let _ = self.closed_tx.send(true);
        }
    }

    /// Close and wait for the reader and writer tasks to finish.
    ///
    /// Must not be awaited from inside this connection's own reader task.
    pub async fn shutdown(&self) {
        self.close();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }
}

impl<M> std::fmt::Debug for Connection<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("alive", &self.alive.load(Ordering::Relaxed))
            .finish()
    }
}

/// Take ownership of `stream` and start its reader and writer tasks.
pub(crate) fn spawn<S: MessageService>(
    stream: TcpStream,
    service: Arc<S>,
    config: &TransportConfig,
    on_close: Option<OnClose>,
) -> Result<Arc<Connection<S::Message>>, TransportError> {
    let remote_addr = stream.peer_addr()?;
    let local_addr = stream.local_addr()?;
    let _ = stream.set_nodelay(true);

    let mut handler = ConnectionHandler::new(config.channel_capacity);
    let inbound_rx = handler.take_inbound().ok_or(TransportError::ChannelClosed)?;
    let outbound_rx = handler.take_outbound().ok_or(TransportError::ChannelClosed)?;
    let (closed_tx, _) = watch::channel(false);

    let conn = Arc::new(Connection {
        id: ConnectionId::next(),
        remote_addr,
        local_addr,
        alive: AtomicBool::new(true),
        closed_tx,
        outbound: handler.outbound(),
        tasks: Mutex::new(Vec::with_capacity(2)),
    });

    let (reader, writer) = stream.into_split();

    let reader_task = tokio::spawn(reader_loop(
        conn.clone(),
        reader,
        service,
        handler.inbound_sender(),
        inbound_rx,
        config.clone(),
        on_close,
    ));
    let writer_task = tokio::spawn(writer_loop(conn.clone(), writer, outbound_rx, config.clone()));
    conn.tasks.lock().extend([reader_task, writer_task]);

    info!(conn = %conn.id, peer = %remote_addr, "[P2P] Connection established");
    Ok(conn)
}

enum ReaderExit {
    Frame(FrameError),
    Handler(anyhow::Error),
}

async fn reader_loop<S: MessageService>(
    conn: Arc<Connection<S::Message>>,
    mut reader: OwnedReadHalf,
    service: Arc<S>,
    inbound_tx: mpsc::Sender<S::Message>,
    mut inbound_rx: mpsc::Receiver<S::Message>,
    config: TransportConfig,
    on_close: Option<OnClose>,
) {
    let mut closed = conn.closed_signal();
    let read_timeout = config.read_timeout;
    let max_size = config.max_message_size;

    // A read error ends the socket half but not dispatch: dropping the
    // sender lets the dispatch half drain frames already queued.
    let socket_half = async move {
        let end = loop {
            match framing::receive::<_, S::Message>(&mut reader, read_timeout, max_size).await {
                Ok(msg) => {
                    if inbound_tx.send(msg).await.is_err() {
                        break None;
                    }
                }
                Err(e) => break Some(e),
            }
        };
        drop(inbound_tx);
        Ok::<Option<FrameError>, ReaderExit>(end)
    };

    let dispatch_half = async {
        while let Some(msg) = inbound_rx.recv().await {
            service
                .handle(&conn, &conn.outbound, msg)
                .map_err(ReaderExit::Handler)?;
        }
        Ok::<(), ReaderExit>(())
    };

    let outcome = tokio::select! {
        r = async { tokio::try_join!(socket_half, dispatch_half) } => match r {
            Ok((Some(e), ())) => Err(ReaderExit::Frame(e)),
            Ok((None, ())) => Ok(()),
            Err(e) => Err(e),
        },
        _ = wait_closed(&mut closed) => Ok(()),
    };

    match outcome {
        Ok(()) => debug!(conn = %conn.id, "[P2P] Reader stopped"),
        Err(ReaderExit::Frame(FrameError::Closed)) => {
            info!(conn = %conn.id, peer = %conn.remote_addr, "[P2P] Peer disconnected")
        }
        Err(ReaderExit::Frame(e)) => {
            warn!(conn = %conn.id, peer = %conn.remote_addr, error = %e, "[P2P] Read failed, dropping connection")
        }
        Err(ReaderExit::Handler(e)) => {
            warn!(conn = %conn.id, peer = %conn.remote_addr, error = %e, "[P2P] Handler failed, dropping connection")
        }
    }

    conn.close();
    service.on_disconnect(&conn);
    if let Some(hook) = on_close {
        hook(conn.id);
    }
}

async fn writer_loop<M: WireMessage>(
    conn: Arc<Connection<M>>,
    mut writer: OwnedWriteHalf,
    mut outbound_rx: mpsc::Receiver<M>,
    config: TransportConfig,
) {
    let mut closed = conn.closed_signal();

    loop {
        tokio::select! {
            msg = outbound_rx.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = write_one(&mut writer, &msg, &config).await {
                    warn!(conn = %conn.id, peer = %conn.remote_addr, error = %e, "[P2P] Write failed, dropping connection");
                    break;
                }
            }
            _ = wait_closed(&mut closed) => {
                // Deliver what was queued before the close, best effort.
                while let Ok(msg) = outbound_rx.try_recv() {
                    if write_one(&mut writer, &msg, &config).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
    conn.close();
    debug!(conn = %conn.id, "[P2P] Writer stopped");
}

async fn write_one<M: WireMessage>(
    writer: &mut OwnedWriteHalf,
    msg: &M,
    config: &TransportConfig,
) -> Result<usize, FrameError> {
    match tokio::time::timeout(
        config.write_timeout,
        framing::send(writer, msg, config.max_message_size),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(FrameError::Timeout),
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::protocol::{Message, MessageType};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    const DEADLINE: Duration = Duration::from_secs(2);

    struct Echo;

    impl MessageService for Echo {
        type Message = Message;

        fn handle(
            &self,
            _conn: &Arc<Connection<Message>>,
            outbound: &Outbound<Message>,
            msg: Message,
        ) -> HandlerResult {
            if msg.kind() == Ok(MessageType::PeerClose) {
                anyhow::bail!("closing on request");
            }
            outbound.try_send(msg)?;
            Ok(())
        }
    }

    async fn pair(on_close: Option<OnClose>) -> (Arc<Connection<Message>>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (raw, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (stream, _) = accepted.unwrap();
        let conn = spawn(stream, Arc::new(Echo), &TransportConfig::default(), on_close).unwrap();
        (conn, raw.unwrap())
    }

    #[derive(Default)]
    struct Counter {
        handled: AtomicUsize,
        disconnects: AtomicUsize,
    }

    impl MessageService for Counter {
        type Message = Message;

        fn handle(
            &self,
            _conn: &Arc<Connection<Message>>,
            _outbound: &Outbound<Message>,
            _msg: Message,
        ) -> HandlerResult {
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_disconnect(&self, _conn: &Connection<Message>) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_connection_ids_increase() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert!(b > a);
        assert_eq!(a.to_string(), format!("#{}", a.as_u64()));
    }

    #[tokio::test]
    async fn test_echo_over_socket() {
        let (conn, mut raw) = pair(None).await;
        assert_eq!(conn.local_addr(), raw.peer_addr().unwrap());

        framing::send(&mut raw, &Message::keepalive(), framing::MAX_MESSAGE_SIZE)
            .await
            .unwrap();
        let back: Message = framing::receive(&mut raw, DEADLINE, framing::MAX_MESSAGE_SIZE)
            .await
            .unwrap();
        assert_eq!(back, Message::keepalive());

        assert!(conn.is_alive());
        conn.shutdown().await;
        assert!(!conn.is_alive());
        assert!(matches!(
            conn.send(Message::keepalive()),
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_handler_error_closes_and_runs_hook() {
        let (tx, rx) = oneshot::channel();
        let hook: OnClose = Box::new(move |id| {
            let _ = tx.send(id);
        });
        let (conn, mut raw) = pair(Some(hook)).await;

        framing::send(&mut raw, &Message::close("p1"), framing::MAX_MESSAGE_SIZE)
            .await
            .unwrap();

        let closed_id = tokio::time::timeout(DEADLINE, rx).await.unwrap().unwrap();
        assert_eq!(closed_id, conn.id());
        assert!(!conn.is_alive());

        let err = framing::receive::<_, Message>(&mut raw, DEADLINE, framing::MAX_MESSAGE_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::Closed | FrameError::Io(_)));
    }

    #[tokio::test]
    async fn test_queued_messages_flushed_on_close() {
        let (conn, mut raw) = pair(None).await;

        conn.send(Message::hello("p1")).unwrap();
        conn.send(Message::close("p1")).unwrap();
        conn.close();
        conn.close();

        let first: Message = framing::receive(&mut raw, DEADLINE, framing::MAX_MESSAGE_SIZE)
            .await
            .unwrap();
        let second: Message = framing::receive(&mut raw, DEADLINE, framing::MAX_MESSAGE_SIZE)
            .await
            .unwrap();
        assert_eq!(first.kind(), Ok(MessageType::PeerHello));
        assert_eq!(second.kind(), Ok(MessageType::PeerClose));
    }

    #[tokio::test]
    async fn test_frames_before_eof_are_all_handled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let service = Arc::new(Counter::default());

        for round in 1..=20usize {
            let (raw, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
            let (stream, _) = accepted.unwrap();
            let _conn = spawn(stream, service.clone(), &TransportConfig::default(), None).unwrap();

            let mut raw = raw.unwrap();
            framing::send(&mut raw, &Message::hello("p1"), framing::MAX_MESSAGE_SIZE)
                .await
                .unwrap();
            framing::send(&mut raw, &Message::close("p1"), framing::MAX_MESSAGE_SIZE)
                .await
                .unwrap();
            raw.shutdown().await.unwrap();

            tokio::time::timeout(DEADLINE, async {
                while service.disconnects.load(Ordering::SeqCst) < round {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();
            assert_eq!(service.handled.load(Ordering::SeqCst), 2 * round);
        }
    }
}
