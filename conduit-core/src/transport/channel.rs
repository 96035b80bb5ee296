//! In-process transport backed by tokio mpsc channels.
//!
//! Useful for tests and in-process wiring where a real socket is not needed. Messages are
//! already unit-sized, so no framing is applied.

use super::state::{ReaderSlot, TransportState, lock};
use super::{ClosedSignal, Transport, TransportHandler};
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

struct Inner {
    state: TransportState,
    sender: Mutex<Option<mpsc::Sender<Bytes>>>,
    receiver: Mutex<Option<mpsc::Receiver<Bytes>>>,
    reader: ReaderSlot,
    /// Keeps the inbound side open for transports without a real peer.
    _keepalive: Option<mpsc::Sender<Bytes>>,
}

impl Inner {
    fn shutdown(&self) -> bool {
        let was_connected = self.state.end_connection();
        self.reader.cancel();
        lock(&self.sender).take();
        if was_connected {
            self.state.fire_closed();
            self.state.release_handler();
        }
        was_connected
    }
}

async fn read_loop(inner: Arc<Inner>, mut receiver: mpsc::Receiver<Bytes>) {
    loop {
        inner.state.wait_open().await;
        if !inner.state.is_connected() {
            return;
        }
        match receiver.recv().await {
            Some(message) => {
                if !inner.state.deliver(message).await {
                    return;
                }
            }
            None => break,
        }
    }

    if !inner.state.is_connected() {
        return;
    }
    warn!("Channel peer went away");
    let handler = inner.state.handler();
    inner.shutdown();
    if let Some(handler) = handler {
        handler
            .on_connection_lost(&TransportError::reset("Peer channel closed"))
            .await;
    }
}

/// In-process transport over a pair of mpsc channels.
///
/// Writing after the peer stopped reading reports the message through
/// [`TransportHandler::on_message_returned`] instead of failing the write.
pub struct ChannelTransport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("connected", &self.inner.state.is_connected())
            .finish()
    }
}

impl ChannelTransport {
    /// Create a `ChannelTransport` from the given channel halves.
    ///
    /// * `receiver`: incoming messages (read side)
    /// * `sender`:   outgoing messages (write side)
    pub fn new(receiver: mpsc::Receiver<Bytes>, sender: mpsc::Sender<Bytes>) -> Self {
        Self::build(receiver, sender, None)
    }

    fn build(
        receiver: mpsc::Receiver<Bytes>,
        sender: mpsc::Sender<Bytes>,
        keepalive: Option<mpsc::Sender<Bytes>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: TransportState::new(),
                sender: Mutex::new(Some(sender)),
                receiver: Mutex::new(Some(receiver)),
                reader: ReaderSlot::default(),
                _keepalive: keepalive,
            }),
        }
    }

    /// Create a linked pair: messages written by one side are received by the other.
    ///
    /// `buffer` controls the capacity of each underlying mpsc channel.
    pub fn pair(buffer: usize) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(buffer);
        let (tx_b, rx_b) = mpsc::channel(buffer);
        (Self::new(rx_a, tx_b), Self::new(rx_b, tx_a))
    }

    /// A transport whose peer never reads: it stays connected, and every write is returned
    /// as undeliverable.
    pub fn unrouted() -> Self {
        let (tx_out, rx_out) = mpsc::channel(1);
        drop(rx_out);
        let (tx_in, rx_in) = mpsc::channel(1);
        Self::build(rx_in, tx_out, Some(tx_in))
    }

    /// Notify the handler and start the reader. A channel transport connects once.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let receiver = lock(&self.inner.receiver)
            .take()
            .ok_or(TransportError::AlreadyConnected)?;
        self.inner.state.begin_connection(None)?;
        debug!("Channel transport connected");

        self.inner.state.notify_made().await;
        if !self.inner.state.is_connected() {
            return Ok(());
        }
        let handle = tokio::spawn(read_loop(Arc::clone(&self.inner), receiver));
        self.inner.reader.set(handle);
        Ok(())
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        self.inner.reader.cancel();
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn set_handler(&self, handler: Arc<dyn TransportHandler>) -> Result<(), TransportError> {
        self.inner.state.set_handler(handler)
    }

    fn is_connected(&self) -> bool {
        self.inner.state.is_connected()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn closed(&self) -> ClosedSignal {
        self.inner.state.closed()
    }

    async fn write(&self, message: Bytes) -> Result<(), TransportError> {
        if !self.inner.state.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let sender = lock(&self.inner.sender)
            .clone()
            .ok_or(TransportError::NotConnected)?;
        if let Err(returned) = sender.send(message).await {
            debug!("Channel peer is gone, returning message");
            self.inner.state.notify_returned(returned.0).await;
        }
        Ok(())
    }

    async fn drain(&self) -> Result<(), TransportError> {
        if self.inner.state.is_connected() {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.inner.shutdown() {
            debug!("Channel transport closed");
        }
        Ok(())
    }

    fn pause(&self) {
        self.inner.state.pause();
    }

    fn resume(&self) {
        self.inner.state.resume();
    }

    fn is_paused(&self) -> bool {
        self.inner.state.is_paused()
    }
}
