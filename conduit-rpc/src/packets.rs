//! Typed payloads identified by an embedded packet id.
//!
//! A [`Packet`] serializes to a JSON object carrying its identifier under `"_"`. The
//! [`TypedRpcEngine`] uses that identifier as the dispatch key for inbound requests and to
//! pick a response model for results.

use crate::dispatch::{DispatchKey, MethodTable};
use crate::engine::{CallOptions, EngineOptions, RpcEngine};
use crate::error::RpcError;
use crate::exception::{HandlerError, RpcException};
use conduit_core::TransportError;
use conduit_core::transport::Transport;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Field holding the packet identifier.
pub const PACKET_ID_FIELD: &str = "_";

/// Identifier embedded in a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketId {
    Int(i64),
    Name(&'static str),
}

impl PacketId {
    /// Dispatch-table key.
    pub fn key(&self) -> String {
        match self {
            PacketId::Int(id) => id.to_string(),
            PacketId::Name(name) => (*name).to_string(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            PacketId::Int(id) => Value::from(*id),
            PacketId::Name(name) => Value::from(*name),
        }
    }
}

impl std::fmt::Display for PacketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// A self-identifying payload.
pub trait Packet: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn packet_id() -> PacketId;
}

/// Serialize `packet` and stamp its identifier.
pub fn encode_packet<P: Packet>(packet: &P) -> Result<Value, serde_json::Error> {
    let mut value = serde_json::to_value(packet)?;
    match &mut value {
        Value::Object(map) => {
            map.insert(PACKET_ID_FIELD.to_string(), P::packet_id().to_value());
            Ok(value)
        }
        other => Err(serde::ser::Error::custom(format!(
            "packet {} must serialize to an object, got {other}",
            P::packet_id()
        ))),
    }
}

/// Decode `value` as `P`, checking the embedded identifier.
pub fn decode_packet<P: Packet>(value: &Value) -> Result<P, serde_json::Error> {
    let expected = P::packet_id().key();
    match packet_key(value) {
        Some(key) if key == expected => serde_json::from_value(value.clone()),
        Some(key) => Err(serde::de::Error::custom(format!(
            "expected packet {expected}, got {key}"
        ))),
        None => Err(serde::de::Error::custom(format!(
            "no packet id in {value}"
        ))),
    }
}

/// Dispatch key of a serialized packet, if it carries one.
pub fn packet_key(value: &Value) -> Option<String> {
    match value.as_object()?.get(PACKET_ID_FIELD)? {
        Value::Number(id) => id.as_i64().map(|id| id.to_string()),
        Value::String(name) => Some(name.clone()),
        _ => None,
    }
}

/// Conversion of a typed handler's result into the response value.
pub trait IntoReply {
    fn into_reply(self) -> Result<Value, HandlerError>;
}

impl IntoReply for Value {
    fn into_reply(self) -> Result<Value, HandlerError> {
        Ok(self)
    }
}

impl IntoReply for () {
    fn into_reply(self) -> Result<Value, HandlerError> {
        Ok(Value::Null)
    }
}

impl<P: Packet> IntoReply for P {
    fn into_reply(self) -> Result<Value, HandlerError> {
        Ok(encode_packet(&self)?)
    }
}

/// A response decoded into its registered model.
pub struct DecodedPacket {
    id: String,
    type_name: &'static str,
    packet: Box<dyn Any + Send + Sync>,
}

impl std::fmt::Debug for DecodedPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedPacket")
            .field("id", &self.id)
            .field("type", &self.type_name)
            .finish()
    }
}

impl DecodedPacket {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<P: Packet>(&self) -> bool {
        self.packet.is::<P>()
    }

    pub fn downcast_ref<P: Packet>(&self) -> Option<&P> {
        self.packet.downcast_ref::<P>()
    }

    /// Take the model out, or get `self` back if it is not a `P`.
    pub fn downcast<P: Packet>(self) -> Result<P, Self> {
        if !self.packet.is::<P>() {
            return Err(self);
        }
        let DecodedPacket {
            id,
            type_name,
            packet,
        } = self;
        packet.downcast::<P>().map(|packet| *packet).map_err(|packet| DecodedPacket {
            id,
            type_name,
            packet,
        })
    }
}

type Decoder = Arc<dyn Fn(&Value) -> Result<DecodedPacket, serde_json::Error> + Send + Sync>;

/// Packet id → response model.
#[derive(Clone, Default)]
pub struct ResponseModels {
    models: HashMap<String, Decoder>,
}

impl std::fmt::Debug for ResponseModels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<&String> = self.models.keys().collect();
        ids.sort();
        f.debug_struct("ResponseModels").field("ids", &ids).finish()
    }
}

impl ResponseModels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<P: Packet>(mut self) -> Self {
        self.register::<P>();
        self
    }

    pub fn register<P: Packet>(&mut self) {
        let id = P::packet_id().key();
        let decoder_id = id.clone();
        let decoder: Decoder = Arc::new(move |value: &Value| {
            let packet: P = decode_packet(value)?;
            Ok(DecodedPacket {
                id: decoder_id.clone(),
                type_name: std::any::type_name::<P>(),
                packet: Box::new(packet),
            })
        });
        self.models.insert(id, decoder);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.models.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Decode `value` with the model registered for its id; `None` when there is none.
    pub fn decode(&self, value: &Value) -> Option<Result<DecodedPacket, serde_json::Error>> {
        let decoder = self.models.get(&packet_key(value)?)?;
        Some(decoder(value))
    }
}

/// Result of a typed call.
#[derive(Debug)]
pub enum TypedValue {
    /// Decoded into a registered response model.
    Model(DecodedPacket),
    /// Passed through undecoded.
    Raw(Value),
}

impl TypedValue {
    pub fn into_model<P: Packet>(self) -> Option<P> {
        match self {
            TypedValue::Model(packet) => packet.downcast().ok(),
            TypedValue::Raw(_) => None,
        }
    }
}

/// RPC engine speaking typed packets.
///
/// Inbound requests dispatch on the request payload's packet id; responses are decoded
/// through the registered [`ResponseModels`].
pub struct TypedRpcEngine<A> {
    engine: RpcEngine<A>,
    models: ResponseModels,
}

impl<A> Clone for TypedRpcEngine<A> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            models: self.models.clone(),
        }
    }
}

impl<A> std::fmt::Debug for TypedRpcEngine<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedRpcEngine")
            .field("engine", &self.engine)
            .field("models", &self.models)
            .finish()
    }
}

impl<A: Send + Sync + 'static> TypedRpcEngine<A> {
    /// Build a packet-keyed engine and install it as `transport`'s handler.
    pub fn attach(
        app: Arc<A>,
        transport: Arc<dyn Transport>,
        methods: MethodTable<A>,
        models: ResponseModels,
        options: EngineOptions,
    ) -> Result<Self, TransportError> {
        let options = options.with_dispatch_key(DispatchKey::PacketId);
        Ok(Self {
            engine: RpcEngine::attach(app, transport, methods, options)?,
            models,
        })
    }

    /// The untyped engine underneath.
    pub fn engine(&self) -> &RpcEngine<A> {
        &self.engine
    }

    pub fn models(&self) -> &ResponseModels {
        &self.models
    }

    /// Send `request` and decode the result through the response models.
    pub async fn call<P: Packet>(
        &self,
        request: &P,
        options: CallOptions,
    ) -> Result<TypedValue, RpcError> {
        let result = self.engine.call(encode_packet(request)?, options).await?;
        self.resolve(result)
    }

    /// Send `request` and decode the result as `R` directly.
    pub async fn call_as<P: Packet, R: Packet>(
        &self,
        request: &P,
        options: CallOptions,
    ) -> Result<R, RpcError> {
        let result = self.engine.call(encode_packet(request)?, options).await?;
        Ok(decode_packet(&result)?)
    }

    /// Send `request` without waiting for a response.
    pub async fn notify<P: Packet>(
        &self,
        request: &P,
        options: CallOptions,
    ) -> Result<(), RpcError> {
        self.engine.notify(encode_packet(request)?, options).await
    }

    pub async fn stop(&self, timeout: Option<Duration>) {
        self.engine.stop(timeout).await;
    }

    fn resolve(&self, result: Value) -> Result<TypedValue, RpcError> {
        if result.is_null() || self.models.is_empty() {
            return Ok(TypedValue::Raw(result));
        }
        match self.models.decode(&result) {
            Some(decoded) => Ok(TypedValue::Model(decoded?)),
            None if self.engine.options().raise_on_unregistered => Err(RpcException::new(
                format!("There is no model for response: {result}"),
            )
            .into()),
            None => Ok(TypedValue::Raw(result)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::transport::ChannelTransport;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    impl Packet for Ping {
        fn packet_id() -> PacketId {
            PacketId::Int(1)
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pong {
        seq: u32,
    }

    impl Packet for Pong {
        fn packet_id() -> PacketId {
            PacketId::Int(2)
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Status {
        healthy: bool,
    }

    impl Packet for Status {
        fn packet_id() -> PacketId {
            PacketId::Name("status")
        }
    }

    #[test]
    fn test_encode_stamps_id() {
        let value = encode_packet(&Ping { seq: 4 }).unwrap();
        assert_eq!(value, json!({"_": 1, "seq": 4}));
        assert_eq!(packet_key(&value).as_deref(), Some("1"));

        let value = encode_packet(&Status { healthy: true }).unwrap();
        assert_eq!(packet_key(&value).as_deref(), Some("status"));
    }

    #[test]
    fn test_decode_checks_id() {
        let ping: Ping = decode_packet(&json!({"_": 1, "seq": 9})).unwrap();
        assert_eq!(ping, Ping { seq: 9 });

        let err = decode_packet::<Ping>(&json!({"_": 2, "seq": 9})).unwrap_err();
        assert!(err.to_string().contains("expected packet 1, got 2"));
        assert!(decode_packet::<Ping>(&json!({"seq": 9})).is_err());
    }

    #[test]
    fn test_response_models_downcast() {
        let models = ResponseModels::new().with::<Pong>().with::<Status>();
        assert!(models.contains("2"));
        assert!(models.contains("status"));

        let decoded = models.decode(&json!({"_": 2, "seq": 3})).unwrap().unwrap();
        assert_eq!(decoded.id(), "2");
        assert!(decoded.is::<Pong>());
        assert!(!decoded.is::<Status>());
        let decoded = decoded.downcast::<Status>().unwrap_err();
        assert_eq!(decoded.downcast::<Pong>().unwrap(), Pong { seq: 3 });

        assert!(models.decode(&json!({"_": 99})).is_none());
        assert!(models.decode(&json!("plain")).is_none());
    }

    #[test]
    fn test_into_reply() {
        assert_eq!(Pong { seq: 1 }.into_reply().unwrap(), json!({"_": 2, "seq": 1}));
        assert_eq!(().into_reply().unwrap(), Value::Null);
        assert_eq!(json!([1, 2]).into_reply().unwrap(), json!([1, 2]));
    }

    struct Server;

    fn server_methods() -> MethodTable<Server> {
        MethodTable::new()
            .register_packet(|_app: Arc<Server>, ping: Ping| async move {
                Ok::<_, HandlerError>(Pong { seq: ping.seq + 1 })
            })
            .unwrap()
            .register_packet(|_app: Arc<Server>, _status: Status| async move {
                Ok::<_, HandlerError>(json!({"_": 77}))
            })
            .unwrap()
    }

    async fn typed_pair(
        models: ResponseModels,
        client_options: EngineOptions,
    ) -> (TypedRpcEngine<()>, TypedRpcEngine<Server>) {
        let (client_side, server_side) = ChannelTransport::pair(16);
        let client_side = Arc::new(client_side);
        let server_side = Arc::new(server_side);
        let client = TypedRpcEngine::attach(
            Arc::new(()),
            client_side.clone(),
            MethodTable::new(),
            models,
            client_options,
        )
        .unwrap();
        let server = TypedRpcEngine::attach(
            Arc::new(Server),
            server_side.clone(),
            server_methods(),
            ResponseModels::new(),
            EngineOptions::default(),
        )
        .unwrap();
        client_side.connect().await.unwrap();
        server_side.connect().await.unwrap();
        (client, server)
    }

    fn short() -> CallOptions {
        CallOptions::new().timeout(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_typed_dispatch_and_response_model() {
        let (client, _server) =
            typed_pair(ResponseModels::new().with::<Pong>(), EngineOptions::default()).await;
        let result = client.call(&Ping { seq: 1 }, short()).await.unwrap();
        assert_eq!(result.into_model::<Pong>(), Some(Pong { seq: 2 }));

        let pong: Pong = client.call_as(&Ping { seq: 41 }, short()).await.unwrap();
        assert_eq!(pong, Pong { seq: 42 });
    }

    #[tokio::test]
    async fn test_unknown_response_model_raises() {
        let (client, _server) =
            typed_pair(ResponseModels::new().with::<Pong>(), EngineOptions::default()).await;
        let err = client.call(&Status { healthy: true }, short()).await.unwrap_err();
        let exception = err.exception().unwrap();
        assert!(exception.message.starts_with("There is no model for response"));
    }

    #[tokio::test]
    async fn test_unknown_response_model_passes_raw() {
        let options = EngineOptions {
            raise_on_unregistered: false,
            ..EngineOptions::default()
        };
        let (client, _server) = typed_pair(ResponseModels::new().with::<Pong>(), options).await;
        let result = client.call(&Status { healthy: true }, short()).await.unwrap();
        assert!(matches!(result, TypedValue::Raw(value) if value == json!({"_": 77})));
    }

    #[tokio::test]
    async fn test_unregistered_packet_is_wrong_consumer() {
        #[derive(Serialize, Deserialize)]
        struct Unknown {}

        impl Packet for Unknown {
            fn packet_id() -> PacketId {
                PacketId::Int(404)
            }
        }

        let (client, _server) = typed_pair(ResponseModels::new(), EngineOptions::default()).await;
        let err = client.call(&Unknown {}, short()).await.unwrap_err();
        assert!(
            err.exception()
                .unwrap()
                .is(crate::exception::ExceptionKind::WrongConsumer)
        );
    }
}
