//! Resilient peer link to a router
//!
//! A [`Peer`] keeps one logical link to whichever router in its address list
//! answers. Liveness is traffic-driven: any inbound message rearms a deadline
//! of twice the keepalive interval. When the deadline passes, the watchdog
//! tears the link down and walks the address list, retrying each address a
//! bounded number of times before moving on, until a router accepts or the
//! peer is stopped.
//!
//! Lifecycle: `Idle -> Running -> Stopped`. A stopped peer cannot be started
//! again; build a new one.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use super::client::Client;
use super::connection::{Connection, HandlerResult, MessageService};
use super::dial_tracker::{DialFailure, DialSource, DialTracker};
use super::error::{PeerError, TransportError};
use super::handler::Outbound;
use super::protocol::{normalize_destination, ChainMessage, Message, MessageType};
use super::TransportConfig;

pub const KEEPALIVE_INTERVAL_SECS: u64 = 15;
pub const RECONNECT_INTERVAL_SECS: u64 = 5;
pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// Liveness and failover policy of a [`Peer`].
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Expected spacing of router traffic; the link is declared dead after
    /// twice this long without any inbound message
    pub keepalive_interval: Duration,
    /// Pause between two dial attempts to the same address
    pub reconnect_interval: Duration,
    /// Dial attempts per address before rotating to the next one
    pub reconnect_max_attempts: u32,
    pub transport: TransportConfig,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(KEEPALIVE_INTERVAL_SECS),
            reconnect_interval: Duration::from_secs(RECONNECT_INTERVAL_SECS),
            reconnect_max_attempts: RECONNECT_MAX_ATTEMPTS,
            transport: TransportConfig::default(),
        }
    }
}

impl PeerConfig {
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_reconnect_max_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_max_attempts = attempts.max(1);
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    fn keepalive_timeout(&self) -> Duration {
        self.keepalive_interval * 2
    }
}

/// Receiver of relayed chain payloads.
///
/// Runs on the connection's reader task and must return well within the
/// keepalive interval. An error drops the connection, which makes the peer
/// reconnect once the keepalive deadline passes.
pub trait ChainHandler: Send + Sync + 'static {
    fn on_chain_message(
        &self,
        src_id: &str,
        dst_id: &str,
        payload: &[u8],
        signature: &[u8],
    ) -> anyhow::Result<()>;
}

impl<F> ChainHandler for F
where
    F: Fn(&str, &str, &[u8], &[u8]) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn on_chain_message(
        &self,
        src_id: &str,
        dst_id: &str,
        payload: &[u8],
        signature: &[u8],
    ) -> anyhow::Result<()> {
        self(src_id, dst_id, payload, signature)
    }
}

/// Keepalive deadline shared by the message handler and the watchdog.
/// `None` means stopped.
struct KeepaliveTimer {
    deadline: watch::Sender<Option<Instant>>,
    timeout: Duration,
}

impl KeepaliveTimer {
    fn new(timeout: Duration) -> Self {
        let (deadline, _) = watch::channel(None);
        Self { deadline, timeout }
    }

    fn stop(&self) {
        self.deadline.send_replace(None);
    }

    fn reset(&self) {
        self.deadline.send_replace(Some(Instant::now() + self.timeout));
    }

    fn subscribe(&self) -> watch::Receiver<Option<Instant>> {
        self.deadline.subscribe()
    }
}

/// Resolves once the armed deadline passes without being moved or stopped.
async fn keepalive_expired(rx: &mut watch::Receiver<Option<Instant>>) {
    loop {
        let deadline = *rx.borrow_and_update();
        match deadline {
            Some(at) => {
                tokio::select! {
                    _ = sleep_until(at) => {
                        if !rx.has_changed().unwrap_or(false) {
                            return;
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() {
                            std::future::pending::<()>().await;
                        }
                    }
                }
            }
            None => {
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Message service installed on every connection a [`Peer`] dials.
pub struct PeerService {
    peer_id: String,
    timer: Arc<KeepaliveTimer>,
    callback: Arc<dyn ChainHandler>,
}

impl PeerService {
    fn dispatch(&self, conn: &Connection<Message>, outbound: &Outbound<Message>, msg: Message) -> HandlerResult {
        match msg.kind() {
            Ok(MessageType::Keepalive) => {
                if let Err(e) = outbound.try_send(Message::keepalive_ack()) {
                    warn!(peer = %self.peer_id, conn = %conn.id(), error = %e, "[PEER] Failed to queue KEEPALIVE_ACK");
                }
            }
            Ok(MessageType::ChainMessage) => {
                let chain = msg.chain_message()?;
                debug!(peer = %self.peer_id, msg = ?chain, "[PEER] Chain message received");
                self.callback
                    .on_chain_message(&chain.src_id, &chain.dst_id, &chain.payload, &chain.signature)?;
            }
            Ok(kind) => {
                debug!(peer = %self.peer_id, kind = %kind, "[PEER] Message accepted, no action");
            }
            Err(tag) => {
                warn!(peer = %self.peer_id, tag = tag, "[PEER] Unknown message type, ignoring");
            }
        }
        Ok(())
    }
}

impl MessageService for PeerService {
    type Message = Message;

    fn handle(
        &self,
        conn: &Arc<Connection<Message>>,
        outbound: &Outbound<Message>,
        msg: Message,
    ) -> HandlerResult {
        self.timer.stop();
        let result = self.dispatch(conn, outbound, msg);
        self.timer.reset();
        result
    }

    fn on_disconnect(&self, conn: &Connection<Message>) {
        info!(peer = %self.peer_id, conn = %conn.id(), router = %conn.remote_addr(), "[PEER] Router link closed");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Running,
    Stopped,
}

struct Link {
    client: Option<Arc<Client<PeerService>>>,
    index: usize,
}

struct PeerInner {
    id: String,
    addrs: Vec<String>,
    config: PeerConfig,
    service: Arc<PeerService>,
    timer: Arc<KeepaliveTimer>,
    phase: Mutex<Phase>,
    link: Mutex<Link>,
    cancel: watch::Sender<bool>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    dials: Mutex<DialTracker>,
}

impl PeerInner {
    async fn dial(&self, addr: &str, source: DialSource) -> Result<Arc<Client<PeerService>>, TransportError> {
        let client = Arc::new(Client::new(addr, self.service.clone(), self.config.transport.clone()));
        match client.connect().await {
            Ok(_) => Ok(client),
            Err(e) => {
                warn!(peer = %self.id, router = %addr, source = %source, error = %e, "[PEER] Dial failed");
                self.dials.lock().record(addr, &e, source);
                Err(e)
            }
        }
    }

    /// Greet the router on a fresh link and make it the active one.
    async fn install(&self, client: Arc<Client<PeerService>>, index: usize) -> Result<(), TransportError> {
        if let Err(e) = client.send(Message::hello(&self.id)) {
            client.disconnect().await;
            return Err(e);
        }
        let previous = {
            let mut link = self.link.lock();
            link.index = index;
            link.client.replace(client)
        };
        if let Some(previous) = previous {
            previous.disconnect().await;
        }
        self.timer.reset();
        info!(peer = %self.id, router = %self.addrs[index], "[PEER] Connected to router");
        Ok(())
    }

    async fn drop_link(&self) {
        let client = self.link.lock().client.take();
        if let Some(client) = client {
            client.disconnect().await;
        }
    }

    /// Rotate through the address list, starting after the current one,
    /// until a router accepts. Returns false when cancelled.
    async fn reconnect(&self, cancel: &mut watch::Receiver<bool>) -> bool {
        let count = self.addrs.len();
        let mut index = (self.link.lock().index + 1) % count;
        let attempts = self.config.reconnect_max_attempts.max(1);

        loop {
            let addr = &self.addrs[index];
            for attempt in 1..=attempts {
                if *cancel.borrow() {
                    return false;
                }
                debug!(peer = %self.id, router = %addr, attempt = attempt, max = attempts, "[PEER] Reconnecting");

                let dialed = tokio::select! {
                    _ = cancelled(cancel) => return false,
                    dialed = self.dial(addr, DialSource::Reconnect) => dialed,
                };
                if let Ok(client) = dialed {
                    match self.install(client, index).await {
                        Ok(()) => return true,
                        Err(e) => warn!(peer = %self.id, router = %addr, error = %e, "[PEER] Failed to send PEER_HELLO"),
                    }
                }

                if attempt < attempts {
                    tokio::select! {
                        _ = cancelled(cancel) => return false,
                        _ = sleep(self.config.reconnect_interval) => {}
                    }
                }
            }
            warn!(peer = %self.id, router = %addr, attempts = attempts, "[PEER] Giving up on router, rotating");
            index = (index + 1) % count;
        }
    }
}

async fn watchdog(inner: Arc<PeerInner>, mut cancel: watch::Receiver<bool>) {
    let mut deadline = inner.timer.subscribe();
    loop {
        tokio::select! {
            _ = cancelled(&mut cancel) => break,
            _ = keepalive_expired(&mut deadline) => {}
        }

        warn!(
            peer = %inner.id,
            timeout_ms = inner.config.keepalive_timeout().as_millis() as u64,
            "[PEER] Keepalive timeout, reconnecting"
        );
        inner.timer.stop();
        inner.drop_link().await;

        if !inner.reconnect(&mut cancel).await {
            break;
        }
    }
    debug!(peer = %inner.id, "[PEER] Watchdog exited");
}

/// Self-healing client link to one of several routers.
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    pub fn new<H: ChainHandler>(
        id: impl Into<String>,
        addrs: Vec<String>,
        callback: H,
        config: PeerConfig,
    ) -> Self {
        let id = id.into();
        let timer = Arc::new(KeepaliveTimer::new(config.keepalive_timeout()));
        let service = Arc::new(PeerService {
            peer_id: id.clone(),
            timer: timer.clone(),
            callback: Arc::new(callback),
        });
        let (cancel, _) = watch::channel(false);

        Self {
            inner: Arc::new(PeerInner {
                id,
                addrs,
                config,
                service,
                timer,
                phase: Mutex::new(Phase::Idle),
                link: Mutex::new(Link { client: None, index: 0 }),
                cancel,
                watchdog: Mutex::new(None),
                dials: Mutex::new(DialTracker::new()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn addrs(&self) -> &[String] {
        &self.inner.addrs
    }

    /// Address of the router currently linked, if any.
    pub fn current_addr(&self) -> Option<String> {
        let link = self.inner.link.lock();
        link.client
            .as_ref()
            .filter(|c| c.is_connected())
            .map(|c| c.addr().to_string())
    }

    pub fn is_running(&self) -> bool {
        *self.inner.phase.lock() == Phase::Running
    }

    /// Recent failed dials, most recent first.
    pub fn dial_failures(&self) -> Vec<DialFailure> {
        self.inner.dials.lock().failures()
    }

    /// Connect to the first reachable router in list order, greet it and
    /// start the keepalive watchdog.
    ///
    /// A failed start leaves the peer idle; it does not retry on its own.
    pub async fn start(&self) -> Result<(), PeerError> {
        {
            let mut phase = self.inner.phase.lock();
            match *phase {
                Phase::Stopped => return Err(PeerError::Spent),
                Phase::Starting | Phase::Running => return Err(PeerError::AlreadyStarted),
                Phase::Idle => {}
            }
            if self.inner.addrs.is_empty() {
                return Err(PeerError::NoAddresses);
            }
            *phase = Phase::Starting;
        }

        let inner = &self.inner;
        let mut linked = false;
        for (index, addr) in inner.addrs.iter().enumerate() {
            let Ok(client) = inner.dial(addr, DialSource::Start).await else {
                continue;
            };
            match inner.install(client, index).await {
                Ok(()) => {
                    linked = true;
                    break;
                }
                Err(e) => warn!(peer = %inner.id, router = %addr, error = %e, "[PEER] Failed to send PEER_HELLO"),
            }
        }

        if !linked {
            *inner.phase.lock() = Phase::Idle;
            warn!(peer = %inner.id, routers = inner.addrs.len(), "[PEER] No router reachable");
            return Err(PeerError::Unreachable(inner.addrs.len()));
        }

        let task = tokio::spawn(watchdog(inner.clone(), inner.cancel.subscribe()));
        *inner.watchdog.lock() = Some(task);
        *inner.phase.lock() = Phase::Running;

        info!(peer = %inner.id, keepalive_secs = inner.config.keepalive_interval.as_secs_f64(), "[PEER] Started");
        Ok(())
    }

    /// Relay `payload` to `dst_id` through the router.
    ///
    /// A bare chain name is addressed to every peer of that chain.
    pub fn send(&self, dst_id: &str, payload: Vec<u8>, signature: Vec<u8>) -> Result<(), PeerError> {
        if !self.is_running() {
            debug!(peer = %self.inner.id, "[PEER] Send while not running");
            return Err(PeerError::NotRunning);
        }

        let chain = ChainMessage::new(self.inner.id.as_str(), normalize_destination(dst_id), payload, signature);
        let msg = Message::chain(&chain)?;

        let client = self.inner.link.lock().client.clone();
        match client {
            Some(client) => Ok(client.send(msg)?),
            None => Err(TransportError::NotConnected.into()),
        }
    }

    /// Cancel the watchdog, say PEER_CLOSE and drop the link. Idempotent.
    pub async fn stop(&self) {
        {
            let mut phase = self.inner.phase.lock();
            if *phase != Phase::Running {
                warn!(peer = %self.inner.id, "[PEER] Stop requested but peer is not running");
                return;
            }
            *phase = Phase::Stopped;
        }

        let inner = &self.inner;
        inner.cancel.send_replace(true);
        let task = inner.watchdog.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        inner.timer.stop();

        let client = inner.link.lock().client.take();
        if let Some(client) = client {
            if let Err(e) = client.send(Message::close(&inner.id)) {
                debug!(peer = %inner.id, error = %e, "[PEER] PEER_CLOSE not queued");
            }
            client.disconnect().await;
        }

        info!(peer = %inner.id, "[PEER] Stopped");
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.inner.cancel.send_replace(true);
        if let Some(task) = self.inner.watchdog.lock().take() {
            task.abort();
        }
        self.inner.link.lock().client.take();
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match *self.inner.phase.lock() {
            Phase::Idle => "idle",
            Phase::Starting => "starting",
            Phase::Running => "running",
            Phase::Stopped => "stopped",
        };
        write!(
            f,
            "Peer[{}] {} router={} routers={}",
            self.inner.id,
            state,
            self.current_addr().as_deref().unwrap_or("-"),
            self.inner.addrs.join(","),
        )
    }
}
