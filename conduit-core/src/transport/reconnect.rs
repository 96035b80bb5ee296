//! Reconnect-with-backoff decorator over a [`SocketTransport`].
//!
//! An unexpected loss schedules a background reconnect; the user handler does not see the
//! loss, only a fresh `on_connection_made` once the link is back. An explicit `close()`
//! cancels any in-flight attempt and suppresses further scheduling.

use super::backoff::Backoff;
use super::socket::{SocketOptions, SocketTransport};
use super::state::lock;
use super::{ClosedSignal, Transport, TransportHandler};
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Inner {
    socket: SocketTransport,
    target: String,
    backoff: Backoff,
    handler: Mutex<Option<Arc<dyn TransportHandler>>>,
    closing: AtomicBool,
    reconnecting: AtomicBool,
    cancel: Mutex<CancellationToken>,
    closed: Mutex<ClosedSignal>,
}

impl Inner {
    fn handler(&self) -> Option<Arc<dyn TransportHandler>> {
        lock(&self.handler).clone()
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Retry until connected, closed, or cancelled.
    async fn connect_loop(self: &Arc<Self>) -> Result<(), TransportError> {
        let token = lock(&self.cancel).clone();
        let mut attempt = 0usize;
        loop {
            if self.is_closing() || token.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            if self.socket.is_connected() {
                return Ok(());
            }

            let outcome = tokio::select! {
                _ = token.cancelled() => return Err(TransportError::Cancelled),
                outcome = TcpStream::connect(self.target.as_str()) => outcome,
            };
            let result = match outcome {
                Ok(stream) => {
                    let relay = Arc::new(Relay {
                        owner: Arc::downgrade(self),
                    });
                    match self.socket.set_handler(relay) {
                        Ok(()) => self.socket.connect_tcp(stream).await,
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(TransportError::Io(e)),
            };

            match result {
                Ok(()) => {
                    if self.is_closing() {
                        // Closed while the stream was being attached.
                        self.socket.close().await?;
                        return Err(TransportError::Cancelled);
                    }
                    info!(addr = %self.target, attempt, "Connected");
                    return Ok(());
                }
                Err(TransportError::AlreadyConnected) => return Ok(()),
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        addr = %self.target,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Connection attempt failed, retrying"
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = token.cancelled() => return Err(TransportError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.is_closing() || self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let owner = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = owner.connect_loop().await;
            owner.reconnecting.store(false, Ordering::SeqCst);
            match outcome {
                // A loss reported while the flag was still set was ignored; pick it up here.
                Ok(()) if !owner.socket.is_connected() => owner.schedule_reconnect(),
                Ok(()) => {}
                Err(TransportError::Cancelled) => debug!(addr = %owner.target, "Reconnect cancelled"),
                Err(e) => warn!(addr = %owner.target, error = %e, "Reconnect gave up"),
            }
        });
    }
}

/// Handler installed on the wrapped socket; forwards to the user handler.
struct Relay {
    owner: Weak<Inner>,
}

#[async_trait]
impl TransportHandler for Relay {
    async fn on_connection_made(&self, peer: Option<SocketAddr>) {
        let Some(owner) = self.owner.upgrade() else {
            return;
        };
        if let Some(handler) = owner.handler() {
            handler.on_connection_made(peer).await;
        }
    }

    async fn on_connection_lost(&self, error: &TransportError) {
        let Some(owner) = self.owner.upgrade() else {
            return;
        };
        if owner.is_closing() {
            return;
        }
        warn!(addr = %owner.target, error = %error, "Connection lost, reconnecting");
        owner.schedule_reconnect();
    }

    async fn on_message_received(&self, message: Bytes) {
        if let Some(handler) = self.owner.upgrade().and_then(|owner| owner.handler()) {
            handler.on_message_received(message).await;
        }
    }

    async fn on_message_returned(&self, message: Bytes) {
        if let Some(handler) = self.owner.upgrade().and_then(|owner| owner.handler()) {
            handler.on_message_returned(message).await;
        }
    }
}

/// Socket transport that survives connection loss.
pub struct ReconnectingTransport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ReconnectingTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectingTransport")
            .field("target", &self.inner.target)
            .field("connected", &self.inner.socket.is_connected())
            .field("closing", &self.inner.is_closing())
            .finish()
    }
}

impl ReconnectingTransport {
    /// Wrap a socket transport that will connect to `target` (`host:port`).
    pub fn new(target: impl Into<String>, options: SocketOptions, backoff: Backoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                socket: SocketTransport::new(options),
                target: target.into(),
                backoff,
                handler: Mutex::new(None),
                closing: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                cancel: Mutex::new(CancellationToken::new()),
                closed: Mutex::new(ClosedSignal::new()),
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.inner.target
    }

    pub fn backoff(&self) -> &Backoff {
        &self.inner.backoff
    }

    /// Connect, retrying with backoff until it succeeds or `close()` is called.
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.inner.closing.store(false, Ordering::SeqCst);
        {
            let mut cancel = lock(&self.inner.cancel);
            if cancel.is_cancelled() {
                *cancel = CancellationToken::new();
            }
        }
        {
            let mut closed = lock(&self.inner.closed);
            if closed.is_fired() {
                *closed = ClosedSignal::new();
            }
        }
        debug!(addr = %self.inner.target, "Connecting");
        self.inner.connect_loop().await
    }
}

impl Drop for ReconnectingTransport {
    fn drop(&mut self) {
        // Stop a background reconnect loop that would otherwise outlive its owner.
        self.inner.closing.store(true, Ordering::SeqCst);
        lock(&self.inner.cancel).cancel();
    }
}

#[async_trait]
impl Transport for ReconnectingTransport {
    fn set_handler(&self, handler: Arc<dyn TransportHandler>) -> Result<(), TransportError> {
        if self.inner.socket.is_connected() {
            return Err(TransportError::AlreadyConnected);
        }
        *lock(&self.inner.handler) = Some(handler);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.socket.is_connected()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.socket.peer_addr()
    }

    /// Fires on `close()` only; losses are absorbed by reconnecting.
    fn closed(&self) -> ClosedSignal {
        lock(&self.inner.closed).clone()
    }

    async fn write(&self, message: Bytes) -> Result<(), TransportError> {
        if self.inner.is_closing() {
            return Err(TransportError::reset("Connection is closing"));
        }
        self.inner.socket.write(message).await
    }

    async fn drain(&self) -> Result<(), TransportError> {
        if self.inner.is_closing() {
            return Err(TransportError::reset("Connection is closing"));
        }
        self.inner.socket.drain().await
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(addr = %self.inner.target, "Closing the connection");
        lock(&self.inner.cancel).cancel();
        self.inner.socket.close().await?;
        lock(&self.inner.closed).fire();
        lock(&self.inner.handler).take();
        Ok(())
    }

    fn pause(&self) {
        self.inner.socket.pause();
    }

    fn resume(&self) {
        self.inner.socket.resume();
    }

    fn is_paused(&self) -> bool {
        self.inner.socket.is_paused()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_write_while_closing_is_reset() {
        let transport =
            ReconnectingTransport::new("127.0.0.1:9", SocketOptions::default(), Backoff::default());
        transport.close().await.unwrap();

        let err = transport.write(Bytes::from("x")).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionReset { .. }));
        assert_eq!(err.to_string(), "Connection reset: Connection is closing");
        let err = transport.drain().await.unwrap_err();
        assert!(err.is_connection_error());
        assert!(transport.closed().is_fired());
    }

    #[tokio::test]
    async fn test_close_cancels_retry_loop() {
        // Reserve a port and release it so connects are refused.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = Arc::new(ReconnectingTransport::new(
            addr.to_string(),
            SocketOptions::default(),
            Backoff::fixed(Duration::from_millis(20)),
        ));
        let connecting = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(60)).await;
        transport.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), connecting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TransportError::Cancelled)));
        assert!(!transport.is_connected());
    }
}
