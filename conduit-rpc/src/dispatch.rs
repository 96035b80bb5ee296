//! Dispatch table and the handler interface.
//!
//! A [`MethodTable`] is built once at composition time and moved into an engine; nothing is
//! registered process-wide, so several engines with different method sets can coexist.

use crate::error::RpcError;
use crate::exception::{HandlerError, RpcException};
use crate::packets::{IntoReply, Packet, decode_packet, packet_key};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Result of a handler invocation.
pub type HandlerResult = Result<Value, HandlerError>;

/// How a request's `method` field maps to a table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchKey {
    /// `method` is the handler name.
    #[default]
    Name,
    /// `method` is a typed payload; its embedded identifier is the key.
    PacketId,
}

impl DispatchKey {
    /// Table key for `method`.
    pub fn key_of(&self, method: &Value) -> Result<String, RpcException> {
        match self {
            DispatchKey::Name => method.as_str().map(str::to_string).ok_or_else(|| {
                RpcException::wrong_consumer(format!("Callable method for {method} is not registered"))
            }),
            DispatchKey::PacketId => packet_key(method)
                .ok_or_else(|| RpcException::new(format!("No packet id in request: {method}"))),
        }
    }
}

/// Everything a handler sees about one inbound request.
#[derive(Debug)]
pub struct CallContext<A> {
    pub app: Arc<A>,
    pub correlation_id: String,
    pub app_id: String,
    pub headers: Map<String, Value>,
    pub method: Value,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl<A> CallContext<A> {
    /// Positional argument `index`, deserialized.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, HandlerError> {
        let value = self.args.get(index).ok_or_else(|| {
            HandlerError::failed(format!("missing positional argument {index}"))
        })?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Named argument, deserialized; `None` when absent.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, HandlerError> {
        match self.kwargs.get(name) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// The request payload decoded as `P`.
    pub fn packet<P: Packet>(&self) -> Result<P, HandlerError> {
        Ok(decode_packet(&self.method)?)
    }
}

/// One callable entry of the table, synchronous or asynchronous.
#[async_trait]
pub trait Handler<A>: Send + Sync + 'static {
    async fn call(&self, context: CallContext<A>) -> HandlerResult;
}

#[async_trait]
impl<A, F, Fut> Handler<A> for F
where
    A: Send + Sync + 'static,
    F: Fn(CallContext<A>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn call(&self, context: CallContext<A>) -> HandlerResult {
        (self)(context).await
    }
}

/// Adapter for handlers that never suspend.
pub struct SyncHandler<F>(pub F);

#[async_trait]
impl<A, F> Handler<A> for SyncHandler<F>
where
    A: Send + Sync + 'static,
    F: Fn(CallContext<A>) -> HandlerResult + Send + Sync + 'static,
{
    async fn call(&self, context: CallContext<A>) -> HandlerResult {
        (self.0)(context)
    }
}

/// Decodes the payload as `P` before calling `F`, and encodes the reply.
struct PacketHandler<P, F> {
    handler: F,
    _packet: PhantomData<fn() -> P>,
}

#[async_trait]
impl<A, P, F, Fut, R> Handler<A> for PacketHandler<P, F>
where
    A: Send + Sync + 'static,
    P: Packet,
    F: Fn(Arc<A>, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    R: IntoReply + Send + 'static,
{
    async fn call(&self, context: CallContext<A>) -> HandlerResult {
        let packet = context.packet::<P>()?;
        (self.handler)(context.app, packet).await?.into_reply()
    }
}

/// Dispatch key → handler.
pub struct MethodTable<A> {
    methods: HashMap<String, Arc<dyn Handler<A>>>,
}

impl<A> Clone for MethodTable<A> {
    fn clone(&self) -> Self {
        Self {
            methods: self.methods.clone(),
        }
    }
}

impl<A> std::fmt::Debug for MethodTable<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&String> = self.methods.keys().collect();
        keys.sort();
        f.debug_struct("MethodTable").field("methods", &keys).finish()
    }
}

impl<A: Send + Sync + 'static> Default for MethodTable<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Send + Sync + 'static> MethodTable<A> {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// Register an async handler under `name`.
    pub fn register(self, name: impl Into<String>, handler: impl Handler<A>) -> Result<Self, RpcError> {
        self.insert(name.into(), Arc::new(handler))
    }

    /// Register a handler that completes without suspending.
    pub fn register_sync<F>(self, name: impl Into<String>, handler: F) -> Result<Self, RpcError>
    where
        F: Fn(CallContext<A>) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert(name.into(), Arc::new(SyncHandler(handler)))
    }

    /// Register a typed handler keyed by `P`'s packet identifier.
    pub fn register_packet<P, F, Fut, R>(self, handler: F) -> Result<Self, RpcError>
    where
        P: Packet,
        F: Fn(Arc<A>, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
        R: IntoReply + Send + 'static,
    {
        let handler = PacketHandler {
            handler,
            _packet: PhantomData::<fn() -> P>,
        };
        self.insert(P::packet_id().key(), Arc::new(handler))
    }

    fn insert(mut self, key: String, handler: Arc<dyn Handler<A>>) -> Result<Self, RpcError> {
        if self.methods.contains_key(&key) {
            return Err(RpcError::DuplicateMethod { key });
        }
        self.methods.insert(key, handler);
        Ok(self)
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Handler<A>>> {
        self.methods.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.methods.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.methods.keys().cloned().collect();
        keys.sort();
        keys
    }
}
