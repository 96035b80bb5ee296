//! Transport layer: a bidirectional message channel to one peer.
//!
//! Provides the [`Transport`] contract and its implementations:
//! - [`SocketTransport`]: framed stream socket (TCP, or TLS with the `tls` feature)
//! - [`ChannelTransport`]: in-process tokio mpsc channels (for testing and in-process wiring)
//! - [`ReconnectingTransport`]: reconnect-with-backoff decorator over a socket transport
//!
//! Notifications flow to a single [`TransportHandler`] installed before `connect()`. A
//! transport holds its handler until it closes and then releases it, so a handler may own
//! the transport it listens to without leaking.

mod backoff;
mod channel;
mod codec;
mod reconnect;
mod socket;
mod state;

pub use backoff::{Backoff, DEFAULT_RECONNECT_DELAYS_SECS};
pub use channel::ChannelTransport;
pub use codec::{DEFAULT_MAX_FRAME_LENGTH, FrameCodec};
pub use reconnect::ReconnectingTransport;
pub use socket::{SocketOptions, SocketTransport};

use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Receiver of transport notifications.
///
/// Every slot defaults to a no-op, so implementors override only what they need.
#[async_trait]
pub trait TransportHandler: Send + Sync {
    /// The peer association is established. `peer` is `None` for in-process transports.
    async fn on_connection_made(&self, _peer: Option<SocketAddr>) {}

    /// The peer went away without a local `close()`.
    ///
    /// The connection is already torn down when this runs: `is_connected()` is `false`, the
    /// closed signal has fired, and the handler may reconnect from inside the callback.
    async fn on_connection_lost(&self, _error: &TransportError) {}

    /// One complete inbound unit (a frame, or a raw chunk without framing).
    async fn on_message_received(&self, _message: Bytes) {}

    /// An outbound message could not be delivered.
    async fn on_message_returned(&self, _message: Bytes) {}
}

/// Handler that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl TransportHandler for NoopHandler {}

/// One-shot signal fired when a connection instance closes.
///
/// Clones observe the same signal. A transport arms a fresh signal on each connect once the
/// previous one has fired.
#[derive(Debug, Clone, Default)]
pub struct ClosedSignal {
    token: CancellationToken,
}

impl ClosedSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fire(&self) {
        self.token.cancel();
    }

    /// Whether the connection instance has closed.
    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolve once the connection instance has closed.
    pub async fn wait(&self) {
        self.token.cancelled().await
    }
}

/// Abstract bidirectional message channel to one peer.
///
/// All methods take `&self`; implementations are shared as `Arc<dyn Transport>`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Install the notification handler. Fails with `AlreadyConnected` once connected.
    fn set_handler(&self, handler: Arc<dyn TransportHandler>) -> Result<(), TransportError>;

    /// Whether a live peer association exists.
    fn is_connected(&self) -> bool;

    /// Remote address of the current connection, if any.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Signal for the current connection instance.
    fn closed(&self) -> ClosedSignal;

    /// Write one message, framing it as configured.
    ///
    /// Fails with a connection-error kind when no live writer exists.
    async fn write(&self, message: Bytes) -> Result<(), TransportError>;

    /// Wait until buffered outbound data has been flushed.
    async fn drain(&self) -> Result<(), TransportError>;

    /// Tear down the connection. Safe to call repeatedly; only the first call has effect.
    async fn close(&self) -> Result<(), TransportError>;

    /// Block the read loop before its next read.
    fn pause(&self);

    /// Release the read loop.
    fn resume(&self);

    /// Whether the read loop is currently gated.
    fn is_paused(&self) -> bool;
}
