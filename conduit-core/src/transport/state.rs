//! Connection state shared by the concrete transports and their reader tasks.

use super::{ClosedSignal, TransportHandler};
use crate::error::TransportError;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct TransportState {
    handler: Mutex<Option<Arc<dyn TransportHandler>>>,
    connected: AtomicBool,
    closed: Mutex<ClosedSignal>,
    peer: Mutex<Option<SocketAddr>>,
    /// `true` while paused.
    gate: watch::Sender<bool>,
}

impl TransportState {
    pub(crate) fn new() -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            handler: Mutex::new(None),
            connected: AtomicBool::new(false),
            closed: Mutex::new(ClosedSignal::new()),
            peer: Mutex::new(None),
            gate,
        }
    }

    // -- handler ----------------------------------------------------------

    pub(crate) fn set_handler(
        &self,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<(), TransportError> {
        if self.is_connected() {
            return Err(TransportError::AlreadyConnected);
        }
        *lock(&self.handler) = Some(handler);
        Ok(())
    }

    pub(crate) fn handler(&self) -> Option<Arc<dyn TransportHandler>> {
        lock(&self.handler).clone()
    }

    pub(crate) fn release_handler(&self) -> Option<Arc<dyn TransportHandler>> {
        lock(&self.handler).take()
    }

    pub(crate) async fn notify_made(&self) {
        if let Some(handler) = self.handler() {
            handler.on_connection_made(self.peer()).await;
        }
    }

    pub(crate) async fn notify_returned(&self, message: Bytes) {
        if let Some(handler) = self.handler() {
            handler.on_message_returned(message).await;
        }
    }

    /// Deliver one inbound unit, honoring the gate.
    ///
    /// Returns `false` when the connection was closed meanwhile and the unit was dropped.
    pub(crate) async fn deliver(&self, message: Bytes) -> bool {
        self.wait_open().await;
        if !self.is_connected() {
            return false;
        }
        if let Some(handler) = self.handler() {
            handler.on_message_received(message).await;
        }
        true
    }

    // -- connection -------------------------------------------------------

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Mark connected and arm a fresh closed signal if the previous one fired.
    ///
    /// Fails with `AlreadyConnected` if the flag was already set.
    pub(crate) fn begin_connection(&self, peer: Option<SocketAddr>) -> Result<(), TransportError> {
        if self
            .connected
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TransportError::AlreadyConnected);
        }
        *lock(&self.peer) = peer;
        let mut closed = lock(&self.closed);
        if closed.is_fired() {
            *closed = ClosedSignal::new();
        }
        Ok(())
    }

    /// Flip connected→false; returns the previous value.
    pub(crate) fn end_connection(&self) -> bool {
        self.connected.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn peer(&self) -> Option<SocketAddr> {
        *lock(&self.peer)
    }

    pub(crate) fn closed(&self) -> ClosedSignal {
        lock(&self.closed).clone()
    }

    pub(crate) fn fire_closed(&self) {
        lock(&self.closed).fire();
    }

    // -- backpressure gate ------------------------------------------------

    pub(crate) fn pause(&self) {
        self.gate.send_replace(true);
    }

    pub(crate) fn resume(&self) {
        self.gate.send_replace(false);
    }

    pub(crate) fn is_paused(&self) -> bool {
        *self.gate.borrow()
    }

    /// Resolve once the gate is open.
    pub(crate) async fn wait_open(&self) {
        let mut rx = self.gate.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|paused| !*paused).await;
    }
}

/// The single reader task owned by a connection.
#[derive(Default)]
pub(crate) struct ReaderSlot {
    task: Mutex<Option<(AbortHandle, tokio::task::Id)>>,
}

impl ReaderSlot {
    pub(crate) fn set(&self, handle: JoinHandle<()>) {
        let entry = (handle.abort_handle(), handle.id());
        if let Some((previous, _)) = lock(&self.task).replace(entry) {
            previous.abort();
        }
    }

    /// Abort the reader unless called from the reader itself, which exits on its own once it
    /// observes the connection is gone.
    pub(crate) fn cancel(&self) {
        if let Some((handle, id)) = lock(&self.task).take() {
            if tokio::task::try_id() != Some(id) {
                handle.abort();
            }
        }
    }
}
