//! Framed transport over a stream socket.
//!
//! One reader task per connection decodes frames with [`FrameCodec`] and hands each to the
//! handler. The backpressure gate is checked before every read and again before every
//! emitted frame, so nothing is delivered while paused and buffered input is kept.

use super::codec::{DEFAULT_MAX_FRAME_LENGTH, FrameCodec};
use super::state::{ReaderSlot, TransportState, lock};
use super::{ClosedSignal, Transport, TransportHandler};
use crate::config::TransportConfig;
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default read buffer capacity (64 KiB).
const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Framing and buffering options for a [`SocketTransport`].
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Frame terminator; `None` delivers raw read chunks.
    pub delimiter: Option<Bytes>,
    pub read_buffer_size: usize,
    pub max_frame_length: usize,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            delimiter: Some(Bytes::from_static(b"\n")),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl SocketOptions {
    /// Options without framing.
    pub fn raw() -> Self {
        Self {
            delimiter: None,
            ..Default::default()
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        let delimiter = (!config.raw && !config.delimiter.is_empty())
            .then(|| Bytes::from(config.delimiter.clone().into_bytes()));
        Self {
            delimiter,
            read_buffer_size: config.read_buffer_size,
            max_frame_length: config.max_frame_length,
        }
    }

    fn codec(&self) -> FrameCodec {
        let codec = match &self.delimiter {
            Some(delimiter) => FrameCodec::delimited(delimiter.clone()),
            None => FrameCodec::raw(),
        };
        codec.with_max_frame_length(self.max_frame_length)
    }
}

struct Inner {
    options: SocketOptions,
    state: TransportState,
    writer: tokio::sync::Mutex<Option<FramedWrite<BoxedWrite, FrameCodec>>>,
    /// Fired on teardown so writes stuck on a full socket give up the writer.
    write_cancel: Mutex<CancellationToken>,
    reader: ReaderSlot,
}

impl Inner {
    /// Tear down the current connection.
    ///
    /// `is_lost` skips the graceful writer shutdown; the peer is already gone.
    async fn shutdown(&self, is_lost: bool) {
        let was_connected = self.state.end_connection();
        let was_paused = self.state.is_paused();
        if !is_lost && !was_paused {
            self.state.pause();
        }

        self.reader.cancel();
        lock(&self.write_cancel).cancel();
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            // Leftover bytes belong to an interrupted write; flushing them could block again.
            if !is_lost && writer.write_buffer().is_empty() {
                if let Err(e) = SinkExt::<Bytes>::close(&mut writer).await {
                    debug!(error = %e, "Writer shutdown failed");
                }
            }
        }

        if was_connected {
            self.state.fire_closed();
            self.state.release_handler();
            if !is_lost {
                info!(peer = ?self.state.peer(), "Connection closed");
            }
        }
        if !is_lost && !was_paused {
            self.state.resume();
        }
    }
}

async fn read_loop<R>(inner: Arc<Inner>, mut frames: FramedRead<R, FrameCodec>)
where
    R: AsyncRead + Unpin,
{
    let peer = inner.state.peer();
    debug!(peer = ?peer, "Reader started");

    let error = loop {
        inner.state.wait_open().await;
        if !inner.state.is_connected() {
            debug!(peer = ?peer, "Reader stopped");
            return;
        }
        match frames.next().await {
            Some(Ok(frame)) => {
                if !inner.state.deliver(frame).await {
                    debug!(peer = ?peer, "Reader stopped");
                    return;
                }
            }
            Some(Err(e)) => {
                error!(peer = ?peer, error = %e, "Reader failed");
                break e;
            }
            None => {
                warn!(peer = ?peer, "Connection is lost");
                break TransportError::reset("Connection lost: peer closed the stream");
            }
        }
    };

    if !inner.state.is_connected() {
        return;
    }
    // Tear down before notifying, so the handler may reconnect from inside the callback.
    let handler = inner.state.handler();
    inner.shutdown(true).await;
    if let Some(handler) = handler {
        handler.on_connection_lost(&error).await;
    }
}

/// Transport over any byte stream: plain TCP, TLS, or an in-memory duplex.
pub struct SocketTransport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketTransport")
            .field("peer", &self.inner.state.peer())
            .field("connected", &self.inner.state.is_connected())
            .field("paused", &self.inner.state.is_paused())
            .finish()
    }
}

impl Default for SocketTransport {
    fn default() -> Self {
        Self::new(SocketOptions::default())
    }
}

impl SocketTransport {
    pub fn new(options: SocketOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                state: TransportState::new(),
                writer: tokio::sync::Mutex::new(None),
                write_cancel: Mutex::new(CancellationToken::new()),
                reader: ReaderSlot::default(),
            }),
        }
    }

    pub fn options(&self) -> &SocketOptions {
        &self.inner.options
    }

    /// Attach to an established stream, notify the handler, and start the reader.
    pub async fn connect<S>(&self, stream: S, peer: Option<SocketAddr>) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.inner.state.begin_connection(peer)?;
        let (read_half, write_half) = tokio::io::split(stream);
        let write_half: BoxedWrite = Box::new(write_half);
        *lock(&self.inner.write_cancel) = CancellationToken::new();
        *self.inner.writer.lock().await =
            Some(FramedWrite::new(write_half, self.inner.options.codec()));
        debug!(peer = ?peer, "Connected");

        self.inner.state.notify_made().await;
        if !self.inner.state.is_connected() {
            // Closed from inside the connection-made callback.
            return Ok(());
        }

        let frames = FramedRead::with_capacity(
            read_half,
            self.inner.options.codec(),
            self.inner.options.read_buffer_size,
        );
        let handle = tokio::spawn(read_loop(Arc::clone(&self.inner), frames));
        self.inner.reader.set(handle);
        Ok(())
    }

    /// Attach to an accepted or connected TCP stream.
    pub async fn connect_tcp(&self, stream: TcpStream) -> Result<(), TransportError> {
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        self.connect(stream, peer).await
    }

    /// Open a TCP connection to `addr` and attach to it.
    pub async fn connect_to<A: ToSocketAddrs>(&self, addr: A) -> Result<(), TransportError> {
        let stream = TcpStream::connect(addr).await?;
        self.connect_tcp(stream).await
    }

    /// Open a TLS connection to `addr`, verifying the certificate against `domain`.
    #[cfg(feature = "tls")]
    pub async fn connect_tls<A: ToSocketAddrs>(
        &self,
        addr: A,
        domain: &str,
        connector: &tokio_native_tls::TlsConnector,
    ) -> Result<(), TransportError> {
        let stream = TcpStream::connect(addr).await?;
        let peer = stream.peer_addr().ok();
        let stream = connector
            .connect(domain, stream)
            .await
            .map_err(|e| TransportError::Tls {
                message: e.to_string(),
            })?;
        self.connect(stream, peer).await
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.inner.reader.cancel();
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn set_handler(&self, handler: Arc<dyn TransportHandler>) -> Result<(), TransportError> {
        self.inner.state.set_handler(handler)
    }

    fn is_connected(&self) -> bool {
        self.inner.state.is_connected()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        if self.is_connected() {
            self.inner.state.peer()
        } else {
            None
        }
    }

    fn closed(&self) -> ClosedSignal {
        self.inner.state.closed()
    }

    async fn write(&self, message: Bytes) -> Result<(), TransportError> {
        let cancel = lock(&self.inner.write_cancel).clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::reset("Connection closed during write")),
            sent = async {
                let mut guard = self.inner.writer.lock().await;
                let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;
                writer.send(message).await
            } => sent,
        }
    }

    async fn drain(&self) -> Result<(), TransportError> {
        let cancel = lock(&self.inner.write_cancel).clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::reset("Connection closed during drain")),
            flushed = async {
                let mut guard = self.inner.writer.lock().await;
                let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;
                SinkExt::<Bytes>::flush(writer).await
            } => flushed,
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.shutdown(false).await;
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

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    #[derive(Debug, PartialEq)]
    enum Event {
        Made,
        Lost,
        Received(Bytes),
    }

    struct Recorder(mpsc::UnboundedSender<Event>);

    #[async_trait]
    impl TransportHandler for Recorder {
        async fn on_connection_made(&self, _peer: Option<SocketAddr>) {
            let _ = self.0.send(Event::Made);
        }

        async fn on_connection_lost(&self, _error: &TransportError) {
            let _ = self.0.send(Event::Lost);
        }

        async fn on_message_received(&self, message: Bytes) {
            let _ = self.0.send(Event::Received(message));
        }
    }

    fn recorded() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder(tx)), rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event within timeout")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_frames_are_delivered_in_order() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let transport = SocketTransport::default();
        let (handler, mut rx) = recorded();
        transport.set_handler(handler).unwrap();
        transport.connect(local, None).await.unwrap();

        assert_eq!(next(&mut rx).await, Event::Made);
        remote.write_all(b"one\ntw").await.unwrap();
        remote.write_all(b"o\n").await.unwrap();
        assert_eq!(next(&mut rx).await, Event::Received(Bytes::from("one")));
        assert_eq!(next(&mut rx).await, Event::Received(Bytes::from("two")));
    }

    #[tokio::test]
    async fn test_write_appends_delimiter() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let transport = SocketTransport::default();
        transport.connect(local, None).await.unwrap();

        transport.write(Bytes::from("ping")).await.unwrap();
        transport.drain().await.unwrap();

        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping\n");
    }

    #[tokio::test]
    async fn test_write_without_connection_fails() {
        let transport = SocketTransport::default();
        let err = transport.write(Bytes::from("x")).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_peer_eof_reports_lost_and_closes() {
        let (local, remote) = tokio::io::duplex(1024);
        let transport = SocketTransport::default();
        let (handler, mut rx) = recorded();
        transport.set_handler(handler).unwrap();
        transport.connect(local, None).await.unwrap();
        let closed = transport.closed();
        assert_eq!(next(&mut rx).await, Event::Made);

        drop(remote);
        assert_eq!(next(&mut rx).await, Event::Lost);
        closed.wait().await;
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.write(Bytes::from("late")).await,
            Err(TransportError::NotConnected)
        ));
    }

    /// Reports what the transport looked like from inside `on_connection_lost`.
    struct LossProbe {
        transport: std::sync::Weak<SocketTransport>,
        seen: mpsc::UnboundedSender<(bool, bool)>,
    }

    #[async_trait]
    impl TransportHandler for LossProbe {
        async fn on_connection_lost(&self, _error: &TransportError) {
            if let Some(transport) = self.transport.upgrade() {
                let _ = self
                    .seen
                    .send((transport.is_connected(), transport.closed().is_fired()));
            }
        }
    }

    #[tokio::test]
    async fn test_connection_is_torn_down_before_lost_callback() {
        let (local, remote) = tokio::io::duplex(1024);
        let transport = Arc::new(SocketTransport::default());
        let (seen, mut rx) = mpsc::unbounded_channel();
        transport
            .set_handler(Arc::new(LossProbe {
                transport: Arc::downgrade(&transport),
                seen,
            }))
            .unwrap();
        transport.connect(local, None).await.unwrap();

        drop(remote);
        let (connected, fired) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!connected);
        assert!(fired);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases_handler() {
        let (local, _remote) = tokio::io::duplex(1024);
        let transport = SocketTransport::default();
        let (handler, mut rx) = recorded();
        let weak = Arc::downgrade(&handler);
        transport.set_handler(handler).unwrap();
        transport.connect(local, None).await.unwrap();
        assert_eq!(next(&mut rx).await, Event::Made);

        let closed = transport.closed();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        assert!(closed.is_fired());
        assert!(!transport.is_connected());
        assert!(!transport.is_paused());
        assert!(weak.upgrade().is_none(), "handler released on close");
        // A local close is not a loss.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_interrupts_blocked_write() {
        let (local, _remote) = tokio::io::duplex(64);
        let transport = Arc::new(SocketTransport::default());
        transport.connect(local, None).await.unwrap();
        let closed = transport.closed();

        let writing = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.write(Bytes::from(vec![b'x'; 4096])).await })
        };
        // The peer never reads, so the write parks on the full buffer.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writing.is_finished());

        tokio::time::timeout(Duration::from_secs(2), transport.close())
            .await
            .expect("close is not held up by the blocked write")
            .unwrap();
        assert!(closed.is_fired());
        assert!(!transport.is_connected());

        let result = tokio::time::timeout(Duration::from_secs(2), writing)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TransportError::ConnectionReset { .. })));
    }

    #[tokio::test]
    async fn test_write_after_reconnect_uses_new_connection() {
        let transport = SocketTransport::default();
        let (first, _first_remote) = tokio::io::duplex(1024);
        transport.connect(first, None).await.unwrap();
        transport.close().await.unwrap();

        let (second, mut remote) = tokio::io::duplex(1024);
        transport.connect(second, None).await.unwrap();
        transport.write(Bytes::from("again")).await.unwrap();
        transport.drain().await.unwrap();

        let mut buf = [0u8; 6];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"again\n");
    }

    #[tokio::test]
    async fn test_set_handler_rejected_while_connected() {
        let (local, _remote) = tokio::io::duplex(64);
        let transport = SocketTransport::default();
        transport.connect(local, None).await.unwrap();
        let (handler, _rx) = recorded();
        assert!(matches!(
            transport.set_handler(handler),
            Err(TransportError::AlreadyConnected)
        ));
        let (second, _remote2) = tokio::io::duplex(64);
        assert!(matches!(
            transport.connect(second, None).await,
            Err(TransportError::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn test_pause_preserves_partial_data() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let transport = SocketTransport::default();
        let (handler, mut rx) = recorded();
        transport.set_handler(handler).unwrap();
        transport.connect(local, None).await.unwrap();
        assert_eq!(next(&mut rx).await, Event::Made);

        transport.pause();
        remote.write_all(b"par").await.unwrap();
        remote.write_all(b"tial\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        transport.resume();
        assert_eq!(next(&mut rx).await, Event::Received(Bytes::from("partial")));
    }

    #[tokio::test]
    async fn test_raw_mode_delivers_chunks() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let transport = SocketTransport::new(SocketOptions::raw());
        let (handler, mut rx) = recorded();
        transport.set_handler(handler).unwrap();
        transport.connect(local, None).await.unwrap();
        assert_eq!(next(&mut rx).await, Event::Made);

        remote.write_all(b"no delimiter here").await.unwrap();
        assert_eq!(
            next(&mut rx).await,
            Event::Received(Bytes::from("no delimiter here"))
        );
    }

    #[test]
    fn test_options_from_config() {
        let config = TransportConfig {
            delimiter: "\r\n".into(),
            raw: false,
            read_buffer_size: 1024,
            max_frame_length: 2048,
        };
        let options = SocketOptions::from_config(&config);
        assert_eq!(options.delimiter, Some(Bytes::from_static(b"\r\n")));
        assert_eq!(options.read_buffer_size, 1024);

        let raw = SocketOptions::from_config(&TransportConfig {
            raw: true,
            ..config
        });
        assert!(raw.delimiter.is_none());
    }
}
