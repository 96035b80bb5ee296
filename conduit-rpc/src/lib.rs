//! # Conduit RPC
//!
//! Correlated request/response calls over any [`conduit_core::transport::Transport`].
//!
//! ## Architecture
//!
//! ```text
//! caller ─► RpcEngine::call ─► Message (JSON frame) ─► Transport ─► peer RpcEngine
//!                                                                     │
//!                                        MethodTable ◄── dispatch ◄───┘
//! ```
//!
//! - [`message`]: the wire envelope (`Request` / `Response`)
//! - [`exception`]: the exception taxonomy carried in responses
//! - [`dispatch`]: the handler interface and the per-engine method table
//! - [`engine`]: the correlation-tracking engine
//! - [`packets`]: typed payloads and the packet-keyed engine

pub mod dispatch;
pub mod engine;
pub mod error;
pub mod exception;
pub mod message;
pub mod packets;

pub use dispatch::{CallContext, DispatchKey, Handler, HandlerResult, MethodTable, SyncHandler};
pub use engine::{CallOptions, EngineOptions, RpcEngine, new_correlation_id};
pub use error::RpcError;
pub use exception::{ExceptionKind, HandlerError, RpcException};
pub use message::{Message, MessageType, Request, Response, ResponseType};
pub use packets::{
    DecodedPacket, IntoReply, Packet, PacketId, ResponseModels, TypedRpcEngine, TypedValue,
    decode_packet, encode_packet, packet_key,
};
