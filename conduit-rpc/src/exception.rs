//! Exception taxonomy carried inside responses.
//!
//! [`RpcException`] is the only error shape that crosses the wire. Its `type` tag classifies it
//! into an [`ExceptionKind`]; tags produced by handler errors (for instance a Rust type path)
//! are preserved verbatim and classify as [`ExceptionKind::Generic`].
//!
//! [`HandlerError`] is what handlers return. Its `NotToHandle` variant is a local control
//! signal and never reaches the wire.

use serde::{Deserialize, Serialize};
use std::backtrace::{Backtrace, BacktraceStatus};

/// Classification of an [`RpcException`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    /// Any failure raised by a handler.
    Generic,
    /// No handler is registered for the dispatch key.
    WrongConsumer,
    /// Outbound call attempted after the engine stopped.
    SenderStopped,
    /// Inbound request arrived after the engine stopped.
    DispatcherStopped,
    /// The transport reported the request as undeliverable.
    DeliveryFailed,
}

impl ExceptionKind {
    /// Tag used in the `type` field on the wire.
    pub fn wire_name(&self) -> &'static str {
        match self {
            ExceptionKind::Generic => "RPCException",
            ExceptionKind::WrongConsumer => "WrongConsumer",
            ExceptionKind::SenderStopped => "RPCSenderStopped",
            ExceptionKind::DispatcherStopped => "RPCDispatcherStopped",
            ExceptionKind::DeliveryFailed => "RPCDeliveryFailed",
        }
    }

    /// Classify a wire tag. Unknown tags are generic failures.
    pub fn from_wire(name: &str) -> Self {
        match name {
            "WrongConsumer" => ExceptionKind::WrongConsumer,
            "RPCSenderStopped" => ExceptionKind::SenderStopped,
            "RPCDispatcherStopped" => ExceptionKind::DispatcherStopped,
            "RPCDeliveryFailed" => ExceptionKind::DeliveryFailed,
            _ => ExceptionKind::Generic,
        }
    }
}

impl std::fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Failure reported through a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{type_name}: {message}")]
pub struct RpcException {
    pub message: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl RpcException {
    /// A generic `RPCException`.
    pub fn new(message: impl Into<String>) -> Self {
        Self::of_kind(ExceptionKind::Generic, message)
    }

    pub fn of_kind(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            type_name: kind.wire_name().to_string(),
            traceback: None,
        }
    }

    pub fn wrong_consumer(message: impl Into<String>) -> Self {
        Self::of_kind(ExceptionKind::WrongConsumer, message)
    }

    pub fn sender_stopped(message: impl Into<String>) -> Self {
        Self::of_kind(ExceptionKind::SenderStopped, message)
    }

    pub fn dispatcher_stopped(message: impl Into<String>) -> Self {
        Self::of_kind(ExceptionKind::DispatcherStopped, message)
    }

    pub fn delivery_failed(message: impl Into<String>) -> Self {
        Self::of_kind(ExceptionKind::DeliveryFailed, message)
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    pub fn kind(&self) -> ExceptionKind {
        ExceptionKind::from_wire(&self.type_name)
    }

    pub fn is(&self, kind: ExceptionKind) -> bool {
        self.kind() == kind
    }
}

/// Outcome of a failed handler invocation.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Suppress the response entirely.
    #[error("Message should not be handled")]
    NotToHandle,

    /// Respond with this exception as is.
    #[error(transparent)]
    Exception(RpcException),

    /// Any other failure; becomes a generic exception carrying the type name and trace.
    #[error("{type_name}: {message}")]
    Failed {
        message: String,
        type_name: String,
        traceback: Option<String>,
    },
}

impl HandlerError {
    /// Capture an arbitrary error with its type name and, when enabled, a backtrace.
    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        HandlerError::Failed {
            message: error.to_string(),
            type_name: std::any::type_name::<E>().to_string(),
            traceback: captured(&Backtrace::capture()),
        }
    }

    /// A failure with a plain message.
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed {
            message: message.into(),
            type_name: ExceptionKind::Generic.wire_name().to_string(),
            traceback: None,
        }
    }

    /// The wire form of this error; `None` for `NotToHandle`.
    pub fn into_exception(self) -> Option<RpcException> {
        match self {
            HandlerError::NotToHandle => None,
            HandlerError::Exception(exception) => Some(exception),
            HandlerError::Failed {
                message,
                type_name,
                traceback,
            } => Some(RpcException {
                message,
                type_name,
                traceback,
            }),
        }
    }
}

fn captured(backtrace: &Backtrace) -> Option<String> {
    match backtrace.status() {
        BacktraceStatus::Captured => Some(backtrace.to_string()),
        _ => None,
    }
}

impl From<RpcException> for HandlerError {
    fn from(exception: RpcException) -> Self {
        HandlerError::Exception(exception)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        HandlerError::from_error(&error)
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        let error = match error.downcast::<RpcException>() {
            Ok(exception) => return HandlerError::Exception(exception),
            Err(error) => error,
        };
        HandlerError::Failed {
            message: format!("{error:#}"),
            type_name: "anyhow::Error".to_string(),
            traceback: captured(error.backtrace()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_wire_names_round_trip() {
        for kind in [
            ExceptionKind::Generic,
            ExceptionKind::WrongConsumer,
            ExceptionKind::SenderStopped,
            ExceptionKind::DispatcherStopped,
            ExceptionKind::DeliveryFailed,
        ] {
            assert_eq!(ExceptionKind::from_wire(kind.wire_name()), kind);
        }
        assert_eq!(ExceptionKind::from_wire("ValueError"), ExceptionKind::Generic);
    }

    #[test]
    fn test_exception_json_shape() {
        let exception = RpcException::wrong_consumer("no handler for missing");
        let json = serde_json::to_value(&exception).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"message": "no handler for missing", "type": "WrongConsumer"})
        );

        let parsed: RpcException =
            serde_json::from_str(r#"{"message":"boom","type":"ZeroDivisionError","traceback":"line 1"}"#)
                .unwrap();
        assert_eq!(parsed.type_name, "ZeroDivisionError");
        assert_eq!(parsed.kind(), ExceptionKind::Generic);
        assert_eq!(parsed.traceback.as_deref(), Some("line 1"));
    }

    #[test]
    fn test_exception_display() {
        let exception = RpcException::delivery_failed("peer unreachable");
        assert_eq!(exception.to_string(), "RPCDeliveryFailed: peer unreachable");
        assert!(exception.is(ExceptionKind::DeliveryFailed));
    }

    #[test]
    fn test_handler_error_preserves_type_name() {
        let io = std::io::Error::other("disk full");
        let exception = HandlerError::from_error(&io).into_exception().unwrap();
        assert_eq!(exception.message, "disk full");
        assert!(exception.type_name.starts_with("std::io::"));
    }

    #[test]
    fn test_not_to_handle_has_no_wire_form() {
        assert!(HandlerError::NotToHandle.into_exception().is_none());
    }

    #[test]
    fn test_anyhow_keeps_rpc_exception() {
        let error = anyhow::Error::new(RpcException::wrong_consumer("nope"));
        let exception = HandlerError::from(error).into_exception().unwrap();
        assert!(exception.is(ExceptionKind::WrongConsumer));

        let error = anyhow::anyhow!("inner").context("outer");
        let exception = HandlerError::from(error).into_exception().unwrap();
        assert_eq!(exception.message, "outer: inner");
    }
}
