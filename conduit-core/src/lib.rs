//! # Conduit Core
//!
//! Building blocks for long-running network services: a cooperative service lifecycle,
//! a message transport contract with a framed socket implementation, automatic reconnection
//! with bounded backoff, a connection host, a static element pool, and layered configuration.
//!
//! ## Architecture
//!
//! ```text
//! ConnectionHost (Service) --accept--> ConnectionFactory --> SocketTransport
//!                                                              |-- FrameCodec
//!                                                              |-- pause/resume gate
//!                                                              +-- TransportHandler (4 slots)
//! ReconnectingTransport --wraps--> SocketTransport + Backoff
//! ```

pub mod config;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod pool;
pub mod transport;

// Re-export commonly used types at the crate root.
pub use config::{ConduitConfig, load_config};
pub use error::{ConduitError, ConfigError, LifecycleError, PoolError, Result, TransportError};
pub use host::{ConnectionFactory, ConnectionHost, ConnectionInfo, HostEvent, ListenOptions};
pub use lifecycle::{Lifecycle, LifecycleState, RunHandle, Service, StopSignal};
pub use pool::{PoolFactory, StaticPool};
pub use transport::{
    Backoff, ChannelTransport, ClosedSignal, FrameCodec, NoopHandler, ReconnectingTransport,
    SocketOptions, SocketTransport, Transport, TransportHandler,
};
