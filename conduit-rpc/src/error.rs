//! RPC-specific error types.

use crate::exception::{ExceptionKind, RpcException};
use conduit_core::TransportError;
use std::time::Duration;

/// Errors surfaced by the RPC engine to local callers.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Typed failure, either reported by the peer or synthesized locally.
    #[error("{0}")]
    Exception(#[from] RpcException),

    #[error("Call {correlation_id} timed out after {timeout:?}")]
    Timeout {
        correlation_id: String,
        timeout: Duration,
    },

    #[error("Call {correlation_id} was cancelled before a response arrived")]
    Cancelled { correlation_id: String },

    #[error("Invalid call: {message}")]
    InvalidCall { message: String },

    #[error("Duplicate rpc method: {key}")]
    DuplicateMethod { key: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl RpcError {
    /// Stable, machine-readable code for the error.
    pub fn error_code(&self) -> &'static str {
        match self {
            RpcError::Exception(exception) => match exception.kind() {
                ExceptionKind::Generic => "remote_exception",
                ExceptionKind::WrongConsumer => "wrong_consumer",
                ExceptionKind::SenderStopped => "sender_stopped",
                ExceptionKind::DispatcherStopped => "dispatcher_stopped",
                ExceptionKind::DeliveryFailed => "delivery_failed",
            },
            RpcError::Timeout { .. } => "timeout",
            RpcError::Cancelled { .. } => "cancelled",
            RpcError::InvalidCall { .. } => "invalid_call",
            RpcError::DuplicateMethod { .. } => "duplicate_method",
            RpcError::Transport(_) => "transport",
            RpcError::Codec(_) => "codec",
        }
    }

    /// The carried exception, if this is a typed failure.
    pub fn exception(&self) -> Option<&RpcException> {
        match self {
            RpcError::Exception(exception) => Some(exception),
            _ => None,
        }
    }

    /// Whether the caller's own wait bound expired.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            RpcError::from(RpcException::wrong_consumer("x")).error_code(),
            "wrong_consumer"
        );
        assert_eq!(
            RpcError::from(RpcException::new("x")).error_code(),
            "remote_exception"
        );
        assert_eq!(
            RpcError::Timeout {
                correlation_id: "abc".into(),
                timeout: Duration::from_millis(10),
            }
            .error_code(),
            "timeout"
        );
        assert_eq!(
            RpcError::from(TransportError::NotConnected).error_code(),
            "transport"
        );
    }

    #[test]
    fn test_timeout_is_distinguishable_from_remote_failure() {
        let timeout = RpcError::Timeout {
            correlation_id: "abc".into(),
            timeout: Duration::from_secs(1),
        };
        assert!(timeout.is_timeout());
        assert!(timeout.exception().is_none());

        let remote = RpcError::from(RpcException::new("boom"));
        assert!(!remote.is_timeout());
        assert_eq!(remote.exception().unwrap().message, "boom");
    }

    #[test]
    fn test_error_display() {
        let err = RpcError::DuplicateMethod { key: "echo".into() };
        assert_eq!(err.to_string(), "Duplicate rpc method: echo");
    }
}
