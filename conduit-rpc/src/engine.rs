//! Correlation-tracking request/response engine over one transport.
//!
//! The engine installs itself as the transport's handler. Outbound calls register a pending
//! entry keyed by correlation id before the request is written; the entry is owned by the
//! awaiting call and removed when that call finishes for any reason. Inbound requests run on
//! their own task, registered as pending dispatches until they complete or are aborted.
//!
//! ```text
//! call() ──► pending_calls[id] ──► Request ──► Transport ──► peer
//!                   ▲                                          │
//!                   └──────────── Response ◄── Transport ◄─────┘
//! ```

use crate::dispatch::{CallContext, DispatchKey, HandlerResult, MethodTable};
use crate::error::RpcError;
use crate::exception::{ExceptionKind, HandlerError, RpcException};
use crate::message::{Message, Request, Response, ResponseType};
use async_trait::async_trait;
use bytes::Bytes;
use conduit_core::TransportError;
use conduit_core::config::RpcConfig;
use conduit_core::transport::{Transport, TransportHandler};
use futures::FutureExt;
use futures::future::join_all;
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fresh random correlation id.
pub fn new_correlation_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Engine behavior.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Answer unknown methods with `WrongConsumer`; otherwise drop them silently.
    pub raise_on_unregistered: bool,
    /// Ignore inbound requests entirely.
    pub dont_receive: bool,
    /// Bound used by the stop triggered on connection loss.
    pub stop_timeout: Option<Duration>,
    /// Wait bound for calls that do not set their own.
    pub call_timeout: Option<Duration>,
    /// Resolve still-pending calls with `RPCSenderStopped` as soon as `stop()` begins.
    pub fail_pending_on_stop: bool,
    pub dispatch_key: DispatchKey,
    /// Stamped on outbound requests that do not set their own.
    pub app_id: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_config(&RpcConfig::default())
    }
}

impl EngineOptions {
    pub fn from_config(config: &RpcConfig) -> Self {
        Self {
            raise_on_unregistered: config.raise_on_unregistered,
            dont_receive: config.dont_receive,
            stop_timeout: config.stop_timeout(),
            call_timeout: config.call_timeout(),
            fail_pending_on_stop: config.fail_pending_on_stop,
            dispatch_key: DispatchKey::Name,
            app_id: String::new(),
        }
    }

    pub fn with_dispatch_key(mut self, dispatch_key: DispatchKey) -> Self {
        self.dispatch_key = dispatch_key;
        self
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }
}

/// Per-call settings.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub response_required: bool,
    pub correlation_id: Option<String>,
    pub timeout: Option<Duration>,
    pub headers: Map<String, Value>,
    pub app_id: Option<String>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            kwargs: Map::new(),
            response_required: true,
            correlation_id: None,
            timeout: None,
            headers: Map::new(),
            app_id: None,
        }
    }
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.args.extend(values);
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    /// Do not wait for (or ask for) a response.
    pub fn fire_and_forget(mut self) -> Self {
        self.response_required = false;
        self
    }
}

type CallOutcome = Result<Value, RpcException>;

struct PendingCall {
    /// Taken by whoever resolves the call first.
    tx: Option<oneshot::Sender<CallOutcome>>,
    /// Fires when the entry is removed.
    done: CancellationToken,
}

struct PendingDispatch {
    seq: u64,
    abort: AbortHandle,
    done: CancellationToken,
}

type CallMap = Mutex<HashMap<String, PendingCall>>;

/// Removes a pending call when the awaiting call finishes, fails, or is dropped.
struct CallGuard<'a> {
    calls: &'a CallMap,
    correlation_id: String,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if let Some(entry) = lock(self.calls).remove(&self.correlation_id) {
            entry.done.cancel();
        }
    }
}

/// Removes a pending dispatch when its task completes or is aborted.
struct DispatchGuard<A> {
    inner: Arc<EngineInner<A>>,
    correlation_id: String,
    seq: u64,
    done: CancellationToken,
}

impl<A> Drop for DispatchGuard<A> {
    fn drop(&mut self) {
        let mut dispatches = lock(&self.inner.pending_dispatches);
        if dispatches
            .get(&self.correlation_id)
            .is_some_and(|entry| entry.seq == self.seq)
        {
            dispatches.remove(&self.correlation_id);
        }
        drop(dispatches);
        self.done.cancel();
    }
}

struct EngineInner<A> {
    app: Arc<A>,
    transport: Arc<dyn Transport>,
    methods: MethodTable<A>,
    options: EngineOptions,
    stopped: AtomicBool,
    pending_calls: CallMap,
    pending_dispatches: Mutex<HashMap<String, PendingDispatch>>,
    dispatch_seq: AtomicU64,
    stop_lock: tokio::sync::Mutex<()>,
}

impl<A: Send + Sync + 'static> EngineInner<A> {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn send(&self, message: Message) -> Result<(), RpcError> {
        let frame = message.encode()?;
        self.transport.write(frame).await?;
        Ok(())
    }

    fn register_call(
        &self,
        correlation_id: &str,
    ) -> Result<oneshot::Receiver<CallOutcome>, RpcError> {
        let mut calls = lock(&self.pending_calls);
        if calls.contains_key(correlation_id) {
            return Err(RpcError::InvalidCall {
                message: format!("correlation id {correlation_id} is already pending"),
            });
        }
        let (tx, rx) = oneshot::channel();
        calls.insert(
            correlation_id.to_string(),
            PendingCall {
                tx: Some(tx),
                done: CancellationToken::new(),
            },
        );
        Ok(rx)
    }

    fn receive(self: &Arc<Self>, frame: Bytes) {
        match Message::decode(&frame) {
            Ok(Message::Request(request)) => self.recv_request(request),
            Ok(Message::Response(response)) => self.recv_response(response),
            Err(e) => warn!(error = %e, len = frame.len(), "Dropping undecodable message"),
        }
    }

    fn recv_request(self: &Arc<Self>, request: Request) {
        if self.options.dont_receive {
            debug!(correlation_id = %request.correlation_id, "Receiving is disabled, ignoring request");
            return;
        }

        let correlation_id = request.correlation_id.clone();
        let seq = self.dispatch_seq.fetch_add(1, Ordering::Relaxed);
        let done = CancellationToken::new();
        let guard = DispatchGuard {
            inner: Arc::clone(self),
            correlation_id: correlation_id.clone(),
            seq,
            done: done.clone(),
        };
        let owner = Arc::clone(self);

        // Hold the map while spawning so the guard cannot run before the entry exists.
        let mut dispatches = lock(&self.pending_dispatches);
        let task = tokio::spawn(async move {
            let _guard = guard;
            owner.process_request(request).await;
        });
        dispatches.insert(
            correlation_id,
            PendingDispatch {
                seq,
                abort: task.abort_handle(),
                done,
            },
        );
    }

    async fn process_request(&self, request: Request) {
        let required = request.requires_response();
        if self.is_stopped() {
            debug!(correlation_id = %request.correlation_id, "Request arrived after stop");
            if required {
                let exception = RpcException::dispatcher_stopped("RPC dispatcher is stopped");
                self.respond(Response::exception(&request, exception)).await;
            }
            return;
        }

        let response = match self.dispatch(&request).await {
            Ok(result) => Response::result(&request, result),
            Err(HandlerError::NotToHandle) => {
                debug!(correlation_id = %request.correlation_id, "Handler declined the message");
                return;
            }
            Err(e) => {
                let Some(exception) = e.into_exception() else {
                    return;
                };
                if exception.is(ExceptionKind::WrongConsumer) && !self.options.raise_on_unregistered
                {
                    warn!(
                        correlation_id = %request.correlation_id,
                        method = %request.method,
                        "No handler registered, dropping request"
                    );
                    return;
                }
                warn!(
                    correlation_id = %request.correlation_id,
                    error = %exception,
                    "Request handling failed"
                );
                Response::exception(&request, exception)
            }
        };

        if required {
            self.respond(response).await;
        }
    }

    async fn dispatch(&self, request: &Request) -> HandlerResult {
        let key = self.options.dispatch_key.key_of(&request.method)?;
        let handler = self.methods.get(&key).ok_or_else(|| {
            RpcException::wrong_consumer(format!(
                "Callable method for {} is not registered",
                request.method
            ))
        })?;

        let context = CallContext {
            app: Arc::clone(&self.app),
            correlation_id: request.correlation_id.clone(),
            app_id: request.app_id.clone(),
            headers: request.headers.clone(),
            method: request.method.clone(),
            args: request.args.clone(),
            kwargs: request.kwargs.clone(),
        };
        match AssertUnwindSafe(handler.call(context)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(HandlerError::Failed {
                message: panic_message(panic.as_ref()),
                type_name: "panic".to_string(),
                traceback: None,
            }),
        }
    }

    async fn respond(&self, response: Response) {
        let correlation_id = response.correlation_id.clone();
        if let Err(e) = self.send(Message::Response(response)).await {
            warn!(correlation_id = %correlation_id, error = %e, "Failed to write response");
        }
    }

    fn recv_response(&self, response: Response) {
        let slot = lock(&self.pending_calls)
            .get_mut(&response.correlation_id)
            .map(|entry| entry.tx.take());

        match slot {
            None if self.options.raise_on_unregistered => {
                error!(correlation_id = %response.correlation_id, "Response for an unknown call");
            }
            None => {
                debug!(correlation_id = %response.correlation_id, "Response for an unknown call");
            }
            Some(None) => {
                warn!(correlation_id = %response.correlation_id, "Call is already complete, ignoring response");
            }
            Some(Some(tx)) => {
                let correlation_id = response.correlation_id.clone();
                if tx.send(response.into_outcome()).is_err() {
                    debug!(correlation_id = %correlation_id, "Caller went away before the response");
                }
            }
        }
    }

    fn returned(&self, frame: Bytes) {
        match Message::decode(&frame) {
            Ok(Message::Request(request)) => {
                warn!(correlation_id = %request.correlation_id, "Request could not be delivered");
                if request.requires_response() {
                    let exception = RpcException::delivery_failed("Request could not be delivered");
                    self.recv_response(Response::exception(&request, exception));
                }
            }
            Ok(Message::Response(response)) => {
                error!(correlation_id = %response.correlation_id, "Response could not be delivered");
            }
            Err(e) => warn!(error = %e, "Returned message could not be decoded"),
        }
    }

    fn fail_pending_calls(&self) {
        let senders: Vec<_> = lock(&self.pending_calls)
            .values_mut()
            .filter_map(|entry| entry.tx.take())
            .collect();
        for tx in senders {
            let _ = tx.send(Err(RpcException::sender_stopped("RPC is stopped")));
        }
    }

    fn cancel_stragglers(&self) {
        let senders: Vec<_> = lock(&self.pending_calls)
            .values_mut()
            .filter_map(|entry| entry.tx.take())
            .collect();
        let calls = senders.len();
        drop(senders);

        let dispatches: Vec<PendingDispatch> = lock(&self.pending_dispatches)
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in &dispatches {
            entry.abort.abort();
            entry.done.cancel();
        }
        warn!(calls, dispatches = dispatches.len(), "Cancelled unfinished RPC work");
    }

    async fn stop(&self, timeout: Option<Duration>) {
        let _serial = self.stop_lock.lock().await;
        if !self.stopped.swap(true, Ordering::SeqCst) {
            let pending_calls = lock(&self.pending_calls).len();
            let pending_dispatches = lock(&self.pending_dispatches).len();
            info!(pending_calls, pending_dispatches, "Stopping RPC engine");
        }
        if self.options.fail_pending_on_stop {
            self.fail_pending_calls();
        }

        let mut waiting: Vec<CancellationToken> = lock(&self.pending_calls)
            .values()
            .map(|entry| entry.done.clone())
            .collect();
        waiting.extend(
            lock(&self.pending_dispatches)
                .values()
                .map(|entry| entry.done.clone()),
        );

        if !waiting.is_empty() {
            let settled = join_all(waiting.iter().map(|done| done.cancelled()));
            let finished = match timeout {
                Some(timeout) => tokio::time::timeout(timeout, settled).await.is_ok(),
                None => {
                    settled.await;
                    true
                }
            };
            if !finished {
                self.cancel_stragglers();
            }
        }

        if self.transport.is_connected() {
            if let Err(e) = self.transport.close().await {
                warn!(error = %e, "Failed to close transport");
            }
        }
        debug!("RPC engine stopped");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Transport handler that feeds the engine.
struct EngineHandler<A> {
    inner: Arc<EngineInner<A>>,
}

#[async_trait]
impl<A: Send + Sync + 'static> TransportHandler for EngineHandler<A> {
    async fn on_connection_made(&self, peer: Option<SocketAddr>) {
        debug!(peer = ?peer, "RPC connection made");
    }

    async fn on_connection_lost(&self, error: &TransportError) {
        warn!(error = %error, "Connection lost, stopping RPC engine");
        let inner = Arc::clone(&self.inner);
        let timeout = inner.options.stop_timeout;
        tokio::spawn(async move { inner.stop(timeout).await });
    }

    async fn on_message_received(&self, message: Bytes) {
        self.inner.receive(message);
    }

    async fn on_message_returned(&self, message: Bytes) {
        self.inner.returned(message);
    }
}

/// Correlated request/response endpoint bound to one transport.
///
/// Cheap to clone; clones share the same pending state.
pub struct RpcEngine<A> {
    inner: Arc<EngineInner<A>>,
}

impl<A> Clone for RpcEngine<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A> std::fmt::Debug for RpcEngine<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcEngine")
            .field("methods", &self.inner.methods)
            .field("stopped", &self.inner.stopped.load(Ordering::SeqCst))
            .field("pending_calls", &lock(&self.inner.pending_calls).len())
            .field(
                "pending_dispatches",
                &lock(&self.inner.pending_dispatches).len(),
            )
            .finish()
    }
}

impl<A: Send + Sync + 'static> RpcEngine<A> {
    /// Build an engine and install it as `transport`'s handler.
    ///
    /// Must happen before the transport connects.
    pub fn attach(
        app: Arc<A>,
        transport: Arc<dyn Transport>,
        methods: MethodTable<A>,
        options: EngineOptions,
    ) -> Result<Self, TransportError> {
        let inner = Arc::new(EngineInner {
            app,
            transport: Arc::clone(&transport),
            methods,
            options,
            stopped: AtomicBool::new(false),
            pending_calls: Mutex::new(HashMap::new()),
            pending_dispatches: Mutex::new(HashMap::new()),
            dispatch_seq: AtomicU64::new(0),
            stop_lock: tokio::sync::Mutex::new(()),
        });
        transport.set_handler(Arc::new(EngineHandler {
            inner: Arc::clone(&inner),
        }))?;
        Ok(Self { inner })
    }

    pub fn app(&self) -> &Arc<A> {
        &self.inner.app
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    /// Outbound calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        lock(&self.inner.pending_calls).len()
    }

    /// Inbound requests still being processed.
    pub fn pending_dispatches(&self) -> usize {
        lock(&self.inner.pending_dispatches).len()
    }

    /// Call a remote method and wait for its result.
    ///
    /// With [`CallOptions::fire_and_forget`] the request is written and `Value::Null` is
    /// returned at once.
    pub async fn call(
        &self,
        method: impl Into<Value>,
        options: CallOptions,
    ) -> Result<Value, RpcError> {
        let method = method.into();
        let inner = &self.inner;
        if inner.is_stopped() {
            return Err(RpcException::sender_stopped("RPC is stopped").into());
        }
        if !options.response_required && options.timeout.is_some() {
            return Err(RpcError::InvalidCall {
                message: "a fire-and-forget call cannot have a wait timeout".into(),
            });
        }

        let correlation_id = options.correlation_id.unwrap_or_else(new_correlation_id);
        let request = Request {
            correlation_id: correlation_id.clone(),
            headers: options.headers,
            app_id: options
                .app_id
                .unwrap_or_else(|| inner.options.app_id.clone()),
            method,
            response_type: if options.response_required {
                ResponseType::Result
            } else {
                ResponseType::None
            },
            args: options.args,
            kwargs: options.kwargs,
        };

        if !options.response_required {
            inner.send(Message::Request(request)).await?;
            return Ok(Value::Null);
        }

        // Registered before writing: a delivery failure may be reported during the write.
        let rx = inner.register_call(&correlation_id)?;
        let _guard = CallGuard {
            calls: &inner.pending_calls,
            correlation_id: correlation_id.clone(),
        };
        inner.send(Message::Request(request)).await?;

        let outcome = match options.timeout.or(inner.options.call_timeout) {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!(correlation_id = %correlation_id, "Call timed out");
                    return Err(RpcError::Timeout {
                        correlation_id,
                        timeout,
                    });
                }
            },
            None => rx.await,
        };

        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(exception)) => Err(RpcError::Exception(exception)),
            Err(_) => Err(RpcError::Cancelled { correlation_id }),
        }
    }

    /// Send a request without waiting for (or asking for) a response.
    pub async fn notify(
        &self,
        method: impl Into<Value>,
        options: CallOptions,
    ) -> Result<(), RpcError> {
        self.call(method, options.fire_and_forget()).await.map(|_| ())
    }

    /// Stop serving.
    ///
    /// New calls fail with `RPCSenderStopped` and inbound requests are answered with
    /// `RPCDispatcherStopped`. Pending calls and dispatches get up to `timeout` to finish
    /// (`None` waits without bound) before being cancelled; then the transport is closed.
    /// Safe to call repeatedly.
    pub async fn stop(&self, timeout: Option<Duration>) {
        self.inner.stop(timeout).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exception::HandlerError;
    use conduit_core::transport::ChannelTransport;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct App {
        notified: AtomicUsize,
    }

    fn methods() -> MethodTable<App> {
        MethodTable::new()
            .register_sync("echo", |ctx: CallContext<App>| ctx.arg::<Value>(0))
            .unwrap()
            .register("slow", |ctx: CallContext<App>| async move {
                let millis: u64 = ctx.arg(0)?;
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok::<_, HandlerError>(json!("done"))
            })
            .unwrap()
            .register_sync("fail", |_ctx: CallContext<App>| {
                Err(HandlerError::failed("boom"))
            })
            .unwrap()
            .register_sync("ignore", |_ctx: CallContext<App>| {
                Err(HandlerError::NotToHandle)
            })
            .unwrap()
            .register_sync("count", |ctx: CallContext<App>| {
                ctx.app.notified.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            })
            .unwrap()
            .register_sync("explode", |_ctx: CallContext<App>| -> HandlerResult {
                panic!("handler exploded")
            })
            .unwrap()
    }

    async fn linked(
        server_options: EngineOptions,
        client_options: EngineOptions,
    ) -> (RpcEngine<App>, RpcEngine<App>) {
        let (client_side, server_side) = ChannelTransport::pair(16);
        let client_side = Arc::new(client_side);
        let server_side = Arc::new(server_side);
        let client = RpcEngine::attach(
            Arc::new(App::default()),
            client_side.clone(),
            MethodTable::new(),
            client_options,
        )
        .unwrap();
        let server = RpcEngine::attach(
            Arc::new(App::default()),
            server_side.clone(),
            methods(),
            server_options,
        )
        .unwrap();
        client_side.connect().await.unwrap();
        server_side.connect().await.unwrap();
        (client, server)
    }

    async fn default_pair() -> (RpcEngine<App>, RpcEngine<App>) {
        linked(EngineOptions::default(), EngineOptions::default()).await
    }

    fn short() -> CallOptions {
        CallOptions::new().timeout(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (client, _server) = default_pair().await;
        let result = client.call("echo", short().arg("hello")).await.unwrap();
        assert_eq!(result, json!("hello"));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_isolated() {
        let (client, _server) = default_pair().await;
        let calls = (0..20).map(|i| {
            let client = client.clone();
            async move { client.call("echo", short().arg(i)).await }
        });
        let results = join_all(calls).await;
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), json!(i));
        }
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_method_raises_wrong_consumer() {
        let (client, _server) = default_pair().await;
        let err = client.call("missing", short()).await.unwrap_err();
        let exception = err.exception().unwrap();
        assert!(exception.is(ExceptionKind::WrongConsumer));
    }

    #[tokio::test]
    async fn test_unregistered_method_dropped_without_raise() {
        let server_options = EngineOptions {
            raise_on_unregistered: false,
            ..EngineOptions::default()
        };
        let (client, _server) = linked(server_options, EngineOptions::default()).await;
        let err = client
            .call("missing", CallOptions::new().timeout(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_handler_failure_becomes_exception() {
        let (client, _server) = default_pair().await;
        let err = client.call("fail", short()).await.unwrap_err();
        let exception = err.exception().unwrap();
        assert_eq!(exception.message, "boom");
        assert_eq!(exception.kind(), ExceptionKind::Generic);
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_exception() {
        let (client, server) = default_pair().await;
        let err = client.call("explode", short()).await.unwrap_err();
        let exception = err.exception().unwrap();
        assert_eq!(exception.type_name, "panic");
        assert_eq!(exception.message, "handler exploded");

        // The engine keeps serving.
        let result = client.call("echo", short().arg(1)).await.unwrap();
        assert_eq!(result, json!(1));
        assert!(!server.is_stopped());
    }

    #[tokio::test]
    async fn test_not_to_handle_suppresses_response() {
        let (client, _server) = default_pair().await;
        let err = client
            .call("ignore", CallOptions::new().timeout(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_notify_is_fire_and_forget() {
        let (client, server) = default_pair().await;
        client.notify("count", CallOptions::new()).await.unwrap();
        client.notify("count", CallOptions::new()).await.unwrap();
        assert_eq!(client.pending_calls(), 0);

        tokio::time::timeout(Duration::from_secs(2), async {
            while server.app().notified.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_fire_and_forget_with_timeout_rejected() {
        let (client, _server) = default_pair().await;
        let err = client
            .call(
                "count",
                CallOptions::new()
                    .fire_and_forget()
                    .timeout(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidCall { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_correlation_id_rejected() {
        let (client, _server) = default_pair().await;
        let first = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call("slow", short().arg(200).correlation_id("fixed"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = client
            .call("echo", short().arg(1).correlation_id("fixed"))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidCall { .. }));
        assert_eq!(first.await.unwrap().unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn test_delivery_failure_resolves_call() {
        let transport = Arc::new(ChannelTransport::unrouted());
        let engine = RpcEngine::attach(
            Arc::new(App::default()),
            transport.clone(),
            MethodTable::new(),
            EngineOptions::default(),
        )
        .unwrap();
        transport.connect().await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(1), engine.call("echo", CallOptions::new()))
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.exception().unwrap().is(ExceptionKind::DeliveryFailed));
        assert_eq!(engine.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_call_after_stop_is_rejected() {
        let (client, _server) = default_pair().await;
        client.stop(Some(Duration::from_millis(100))).await;
        client.stop(Some(Duration::from_millis(100))).await;
        assert!(client.is_stopped());

        let err = client.call("echo", short().arg(1)).await.unwrap_err();
        assert!(err.exception().unwrap().is(ExceptionKind::SenderStopped));
        assert!(!client.transport().is_connected());
    }

    #[tokio::test]
    async fn test_request_during_stop_answered_dispatcher_stopped() {
        let (client, server) = default_pair().await;
        let slow = {
            let client = client.clone();
            tokio::spawn(async move { client.call("slow", short().arg(300)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stopping = {
            let server = server.clone();
            tokio::spawn(async move { server.stop(Some(Duration::from_secs(2))).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.is_stopped());

        let err = client.call("echo", short().arg(1)).await.unwrap_err();
        assert!(err.exception().unwrap().is(ExceptionKind::DispatcherStopped));

        // The in-flight dispatch was allowed to finish.
        assert_eq!(slow.await.unwrap().unwrap(), json!("done"));
        stopping.await.unwrap();
        assert_eq!(server.pending_dispatches(), 0);
    }

    #[tokio::test]
    async fn test_stop_cancels_stragglers_after_timeout() {
        let client_options = EngineOptions {
            stop_timeout: Some(Duration::from_millis(50)),
            ..EngineOptions::default()
        };
        let (client, server) = linked(EngineOptions::default(), client_options).await;
        let waiting = {
            let client = client.clone();
            tokio::spawn(async move { client.call("slow", CallOptions::new().arg(10_000)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.pending_dispatches(), 1);

        tokio::time::timeout(
            Duration::from_secs(2),
            server.stop(Some(Duration::from_millis(50))),
        )
        .await
        .unwrap();
        assert_eq!(server.pending_dispatches(), 0);

        // The client sees the connection go away and gives up on its call.
        let result = tokio::time::timeout(Duration::from_secs(2), waiting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(RpcError::Cancelled { .. })));
        assert!(client.is_stopped());
    }

    #[tokio::test]
    async fn test_fail_pending_on_stop() {
        let client_options = EngineOptions {
            fail_pending_on_stop: true,
            ..EngineOptions::default()
        };
        let (client, _server) = linked(EngineOptions::default(), client_options).await;
        let waiting = {
            let client = client.clone();
            tokio::spawn(async move { client.call("slow", CallOptions::new().arg(10_000)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        client.stop(Some(Duration::from_secs(1))).await;
        let err = waiting.await.unwrap().unwrap_err();
        assert!(err.exception().unwrap().is(ExceptionKind::SenderStopped));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_dont_receive_ignores_requests() {
        let server_options = EngineOptions {
            dont_receive: true,
            ..EngineOptions::default()
        };
        let (client, server) = linked(server_options, EngineOptions::default()).await;
        let err = client
            .call("echo", CallOptions::new().arg(1).timeout(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(server.pending_dispatches(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_caller_removes_pending_entry() {
        let (client, _server) = default_pair().await;
        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.call("slow", CallOptions::new().arg(10_000)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.pending_calls(), 1);

        call.abort();
        let _ = call.await;
        assert_eq!(client.pending_calls(), 0);
    }

    #[test]
    fn test_options_from_config() {
        let config = RpcConfig {
            raise_on_unregistered: false,
            call_timeout_secs: Some(1.5),
            ..RpcConfig::default()
        };
        let options = EngineOptions::from_config(&config).with_app_id("svc");
        assert!(!options.raise_on_unregistered);
        assert_eq!(options.call_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(options.stop_timeout, Some(Duration::from_secs(5)));
        assert_eq!(options.app_id, "svc");
        assert_eq!(options.dispatch_key, DispatchKey::Name);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;
        use std::collections::HashSet;

        proptest! {
            #[test]
            fn correlation_ids_are_unique(count in 1usize..500) {
                let ids: HashSet<String> = (0..count).map(|_| new_correlation_id()).collect();
                prop_assert_eq!(ids.len(), count);
                prop_assert!(ids.iter().all(|id| id.len() == 32));
            }
        }
    }
}
