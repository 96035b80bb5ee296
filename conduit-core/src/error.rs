//! Error types for the Conduit core library.
//!
//! Uses `thiserror` for public API error types with structured variants covering
//! transports, service lifecycle, configuration, and pooling.

/// Top-level error type for the Conduit core library.
#[derive(Debug, thiserror::Error)]
pub enum ConduitError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Errors raised by transports and the connection host.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("No connection is made or writer is dead")]
    NotConnected,

    #[error("Connection reset: {message}")]
    ConnectionReset { message: String },

    #[error("Transport is already connected")]
    AlreadyConnected,

    #[error("Frame exceeds the maximum length of {limit} bytes")]
    FrameTooLong { limit: usize },

    #[error("Connection attempt was cancelled")]
    Cancelled,

    #[error("TLS error: {message}")]
    Tls { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Build a `ConnectionReset` error from anything printable.
    pub fn reset(message: impl Into<String>) -> Self {
        TransportError::ConnectionReset {
            message: message.into(),
        }
    }

    /// Stable, machine-readable classification of the error.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::NotConnected => "not_connected",
            TransportError::ConnectionReset { .. } => "connection_reset",
            TransportError::AlreadyConnected => "already_connected",
            TransportError::FrameTooLong { .. } => "frame_too_long",
            TransportError::Cancelled => "cancelled",
            TransportError::Tls { .. } => "tls",
            TransportError::Io(_) => "io",
        }
    }

    /// Whether the error means the peer association is gone.
    pub fn is_connection_error(&self) -> bool {
        match self {
            TransportError::NotConnected | TransportError::ConnectionReset { .. } => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Errors from the service lifecycle state machine.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Service '{name}' failed to start: {message}")]
    StartFailed { name: String, message: String },

    #[error("Service '{name}' cannot {operation} while {state}")]
    InvalidState {
        name: String,
        state: String,
        operation: &'static str,
    },

    #[error("Service '{name}' hook failed: {message}")]
    Hook { name: String, message: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl LifecycleError {
    /// Build a hook failure for the named service.
    pub fn hook(name: impl Into<String>, message: impl std::fmt::Display) -> Self {
        LifecycleError::Hook {
            name: name.into(),
            message: message.to_string(),
        }
    }
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
}

/// Errors from the static pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Pool size must be positive non-0")]
    InvalidSize,

    #[error("Failed to create pool element after {attempts} attempts: {message}")]
    CreationFailed { attempts: u32, message: String },

    #[error("Pool element creation was cancelled")]
    Cancelled,
}

/// Convenience type alias for core results.
pub type Result<T> = std::result::Result<T, ConduitError>;
