//! Per-connection channel pair
//!
//! Decouples socket I/O from message processing: the socket side of the
//! reader only ever pushes into `inbound`, and the writer only ever pulls
//! from `outbound`.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::error::TransportError;

/// Default capacity of each direction.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// Cloneable handle used to queue messages for a connection's writer.
#[derive(Debug)]
pub struct Outbound<M> {
    tx: mpsc::Sender<M>,
}

impl<M> Clone for Outbound<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M> Outbound<M> {
    /// Queue without waiting. Fails when the channel is full or the writer
    /// has gone away.
    pub fn try_send(&self, msg: M) -> Result<(), TransportError> {
        self.tx.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::ChannelFull,
            TrySendError::Closed(_) => TransportError::ChannelClosed,
        })
    }

    /// Queue, waiting for room if the channel is full.
    pub async fn send(&self, msg: M) -> Result<(), TransportError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Bounded inbound and outbound channels of one connection.
pub struct ConnectionHandler<M> {
    capacity: usize,
    inbound_tx: mpsc::Sender<M>,
    inbound_rx: Option<mpsc::Receiver<M>>,
    outbound_tx: mpsc::Sender<M>,
    outbound_rx: Option<mpsc::Receiver<M>>,
}

impl<M> ConnectionHandler<M> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        Self {
            capacity,
            inbound_tx,
            inbound_rx: Some(inbound_rx),
            outbound_tx,
            outbound_rx: Some(outbound_rx),
        }
    }

    /// Reallocate both channels. Anything queued on the old ones is dropped.
    pub fn init(&mut self) {
        *self = Self::new(self.capacity);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn inbound_sender(&self) -> mpsc::Sender<M> {
        self.inbound_tx.clone()
    }

    pub fn outbound(&self) -> Outbound<M> {
        Outbound {
            tx: self.outbound_tx.clone(),
        }
    }

    /// Receiving end of the inbound channel; `None` once taken.
    pub fn take_inbound(&mut self) -> Option<mpsc::Receiver<M>> {
        self.inbound_rx.take()
    }

    /// Receiving end of the outbound channel; `None` once taken.
    pub fn take_outbound(&mut self) -> Option<mpsc::Receiver<M>> {
        self.outbound_rx.take()
    }
}
