//! Connection host: accepts inbound peers and tracks their transports.
//!
//! A [`ConnectionHost`] is a [`Service`]: `on_start` binds the listening socket, the body
//! runs the single accept loop, and `on_stop` closes every live transport (awaiting each
//! closed signal) before the listener itself is released.
//!
//! Each accepted stream gets a fresh transport from the [`ConnectionFactory`]. The transport
//! is a member of the live set from the moment `connect()` succeeds until its closed signal
//! fires.

use crate::config::ServerConfig;
use crate::error::{LifecycleError, TransportError};
use crate::lifecycle::{Service, StopSignal};
use crate::transport::{SocketTransport, Transport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Pause after a failed `accept()` so a persistent error (e.g. fd exhaustion) does not spin.
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Upper bound on a TLS handshake with a freshly accepted peer.
#[cfg(feature = "tls")]
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Options & events
// ---------------------------------------------------------------------------

/// Bind options for the listening socket.
pub struct ListenOptions {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub reuse_address: bool,
    pub reuse_port: bool,
    /// Peers beyond this many live connections are rejected.
    pub max_connections: Option<usize>,
    /// Already bound listener to use instead of binding `host:port`.
    pub listener: Option<std::net::TcpListener>,
    /// Wrap accepted streams in TLS.
    #[cfg(feature = "tls")]
    pub tls: Option<tokio_native_tls::TlsAcceptor>,
}

impl std::fmt::Debug for ListenOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("ListenOptions");
        s.field("host", &self.host)
            .field("port", &self.port)
            .field("backlog", &self.backlog)
            .field("reuse_address", &self.reuse_address)
            .field("reuse_port", &self.reuse_port)
            .field("max_connections", &self.max_connections)
            .field("prebound", &self.listener.is_some());
        #[cfg(feature = "tls")]
        s.field("tls", &self.tls.is_some());
        s.finish()
    }
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

impl ListenOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            backlog: config.backlog,
            reuse_address: config.reuse_address,
            reuse_port: config.reuse_port,
            max_connections: config.max_connections,
            listener: None,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Use an already bound listener.
    pub fn with_listener(mut self, listener: std::net::TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, acceptor: tokio_native_tls::TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }
}

/// Live-set notifications published by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Accepted { connection_id: Uuid, peer: SocketAddr },
    Closed { connection_id: Uuid, peer: SocketAddr },
    Rejected { peer: SocketAddr, reason: String },
}

/// Metadata about a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: Uuid,
    pub peer: SocketAddr,
    pub connected_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Produces one transport per accepted connection.
///
/// Synchronous closures implement this directly; asynchronous factories implement the trait.
/// The factory is expected to install the transport's handler before returning it.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    async fn create(&self) -> Result<Arc<SocketTransport>, TransportError>;
}

#[async_trait]
impl<F> ConnectionFactory for F
where
    F: Fn() -> Result<Arc<SocketTransport>, TransportError> + Send + Sync + 'static,
{
    async fn create(&self) -> Result<Arc<SocketTransport>, TransportError> {
        (self)()
    }
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

struct LiveConnection {
    info: ConnectionInfo,
    transport: Arc<SocketTransport>,
}

struct Shared {
    factory: Box<dyn ConnectionFactory>,
    max_connections: Option<usize>,
    #[cfg(feature = "tls")]
    tls: Option<tokio_native_tls::TlsAcceptor>,
    live: Mutex<HashMap<Uuid, LiveConnection>>,
    /// Connections being attached plus live ones; bounded by `max_connections`.
    reserved: AtomicUsize,
    events: broadcast::Sender<HostEvent>,
    accepting: TaskTracker,
    /// Fired when the host starts stopping; in-flight accepts give up.
    stopping: Mutex<CancellationToken>,
}

impl Shared {
    fn broadcast(&self, event: HostEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }

    fn reject(&self, peer: SocketAddr, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(peer = %peer, reason = %reason, "Connection rejected");
        self.broadcast(HostEvent::Rejected { peer, reason });
    }

    /// Claim a connection slot, failing when the limit is reached.
    fn reserve(&self) -> bool {
        let max = self.max_connections.unwrap_or(usize::MAX);
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        self.reserved.fetch_sub(1, Ordering::AcqRel);
    }

    async fn accept(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if !self.reserve() {
            let max = self.max_connections.unwrap_or(usize::MAX);
            self.reject(peer, format!("connection limit of {max} reached"));
            return;
        }
        let stopping = lock(&self.stopping).clone();

        let created = tokio::select! {
            _ = stopping.cancelled() => Err(TransportError::Cancelled),
            created = self.factory.create() => created,
        };
        let transport = match created {
            Ok(transport) => transport,
            Err(e) => {
                error!(peer = %peer, error = %e, "Connection factory failed");
                self.release();
                self.reject(peer, e.to_string());
                return;
            }
        };

        let attached = tokio::select! {
            _ = stopping.cancelled() => Err(TransportError::Cancelled),
            attached = self.connect(&transport, stream, peer) => attached,
        };
        if let Err(e) = attached {
            error!(peer = %peer, error = %e, "Failed to attach connection");
            if let Err(e) = transport.close().await {
                debug!(error = %e, "Failed to close unattached transport");
            }
            self.release();
            self.reject(peer, e.to_string());
            return;
        }

        let connection_id = Uuid::new_v4();
        let closed = transport.closed();
        let info = ConnectionInfo {
            connection_id,
            peer,
            connected_at: Utc::now(),
        };
        lock(&self.live).insert(connection_id, LiveConnection { info, transport });
        info!(connection_id = %connection_id, peer = %peer, "Connection accepted");
        self.broadcast(HostEvent::Accepted {
            connection_id,
            peer,
        });

        let shared = Arc::clone(&self);
        tokio::spawn(async move {
            closed.wait().await;
            let removed = lock(&shared.live).remove(&connection_id);
            shared.release();
            if removed.is_some() {
                debug!(connection_id = %connection_id, peer = %peer, "Connection deregistered");
                shared.broadcast(HostEvent::Closed {
                    connection_id,
                    peer,
                });
            }
        });
    }

    #[cfg(feature = "tls")]
    async fn connect(
        &self,
        transport: &SocketTransport,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), TransportError> {
        match &self.tls {
            Some(acceptor) => {
                let stream = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream))
                    .await
                    .map_err(|_| TransportError::Tls {
                        message: "handshake timed out".to_string(),
                    })?
                    .map_err(|e| TransportError::Tls {
                        message: e.to_string(),
                    })?;
                transport.connect(stream, Some(peer)).await
            }
            None => transport.connect_tcp(stream).await,
        }
    }

    #[cfg(not(feature = "tls"))]
    async fn connect(
        &self,
        transport: &SocketTransport,
        stream: TcpStream,
        _peer: SocketAddr,
    ) -> Result<(), TransportError> {
        transport.connect_tcp(stream).await
    }
}

/// Accepts inbound connections and owns their transports while they are live.
pub struct ConnectionHost {
    bind: Mutex<BindOptions>,
    listener: tokio::sync::Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shared: Arc<Shared>,
}

/// The part of [`ListenOptions`] consumed when binding.
struct BindOptions {
    host: String,
    port: u16,
    backlog: u32,
    reuse_address: bool,
    reuse_port: bool,
    prebound: Option<std::net::TcpListener>,
}

impl std::fmt::Debug for ConnectionHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHost")
            .field("local_addr", &self.local_addr())
            .field("active", &self.active_count())
            .finish()
    }
}

impl ConnectionHost {
    pub fn new(options: ListenOptions, factory: impl ConnectionFactory) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            bind: Mutex::new(BindOptions {
                host: options.host,
                port: options.port,
                backlog: options.backlog,
                reuse_address: options.reuse_address,
                reuse_port: options.reuse_port,
                prebound: options.listener,
            }),
            listener: tokio::sync::Mutex::new(None),
            local_addr: Mutex::new(None),
            shared: Arc::new(Shared {
                factory: Box::new(factory),
                max_connections: options.max_connections,
                #[cfg(feature = "tls")]
                tls: options.tls,
                live: Mutex::new(HashMap::new()),
                reserved: AtomicUsize::new(0),
                events,
                accepting: TaskTracker::new(),
                stopping: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    /// Subscribe to live-set notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.shared.events.subscribe()
    }

    /// Number of live connections.
    pub fn active_count(&self) -> usize {
        lock(&self.shared.live).len()
    }

    /// Snapshot of the live connections.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        lock(&self.shared.live)
            .values()
            .map(|conn| conn.info.clone())
            .collect()
    }

    /// Transport of a live connection.
    pub fn transport(&self, connection_id: &Uuid) -> Option<Arc<SocketTransport>> {
        lock(&self.shared.live)
            .get(connection_id)
            .map(|conn| Arc::clone(&conn.transport))
    }

    async fn bind(&self) -> std::io::Result<TcpListener> {
        let (host, port, backlog, reuse_address, reuse_port, prebound) = {
            let mut bind = lock(&self.bind);
            (
                bind.host.clone(),
                bind.port,
                bind.backlog,
                bind.reuse_address,
                bind.reuse_port,
                bind.prebound.take(),
            )
        };

        if let Some(listener) = prebound {
            listener.set_nonblocking(true)?;
            return TcpListener::from_std(listener);
        }

        let addr = tokio::net::lookup_host((host.as_str(), port))
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("no address for {host}:{port}"),
                )
            })?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(reuse_address)?;
        #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
        {
            if reuse_port {
                socket.set_reuseport(true)?;
            }
        }
        #[cfg(not(all(unix, not(target_os = "solaris"), not(target_os = "illumos"))))]
        {
            if reuse_port {
                warn!("reuse_port is not supported on this platform; ignoring");
            }
        }
        socket.bind(addr)?;
        socket.listen(backlog)
    }
}

#[async_trait]
impl Service for ConnectionHost {
    fn name(&self) -> &str {
        "connection_host"
    }

    async fn on_start(&self) -> Result<(), LifecycleError> {
        let listener = self
            .bind()
            .await
            .map_err(|e| LifecycleError::Transport(TransportError::Io(e)))?;
        let addr = listener.local_addr().map_err(TransportError::Io)?;
        *lock(&self.local_addr) = Some(addr);
        *self.listener.lock().await = Some(listener);
        self.shared.accepting.reopen();
        *lock(&self.shared.stopping) = CancellationToken::new();
        info!(addr = %addr, "Listening");
        Ok(())
    }

    async fn body(&self, stop: StopSignal) -> Result<(), LifecycleError> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| LifecycleError::hook(self.name(), "listener is not bound"))?;

        loop {
            tokio::select! {
                _ = stop.requested() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Accepted");
                        self.shared
                            .accepting
                            .spawn(Arc::clone(&self.shared).accept(stream, peer));
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                    }
                },
            }
        }

        *self.listener.lock().await = Some(listener);
        Ok(())
    }

    async fn on_stop(&self) -> Result<(), LifecycleError> {
        // Abandon in-flight accepts and let them settle, so nothing registers after the sweep below.
        lock(&self.shared.stopping).cancel();
        self.shared.accepting.close();
        self.shared.accepting.wait().await;

        let transports: Vec<Arc<SocketTransport>> = lock(&self.shared.live)
            .values()
            .map(|conn| Arc::clone(&conn.transport))
            .collect();
        debug!(count = transports.len(), "Closing live connections");
        futures::future::join_all(transports.iter().map(|transport| async move {
            let closed = transport.closed();
            if let Err(e) = transport.close().await {
                warn!(error = %e, "Failed to close connection");
            }
            closed.wait().await;
        }))
        .await;

        drop(self.listener.lock().await.take());
        lock(&self.local_addr).take();
        info!("Listener closed");
        Ok(())
    }
}
