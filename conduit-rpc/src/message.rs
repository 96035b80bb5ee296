//! Wire envelope for requests and responses.
//!
//! Messages are JSON objects. `message_type` (`0` request, `1` response) selects the shape;
//! `response_type` (`0` none, `1` result) tells the receiver whether an answer is expected.
//! Responses additionally carry a `content_type` marker so an observer can tell an exception
//! payload from a result without decoding it.

use crate::exception::RpcException;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// `content_type` of a response carrying a result.
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// `content_type` of a response carrying an exception.
pub const CONTENT_TYPE_EXCEPTION: &str = "application/x-rpc-exception";

const MESSAGE_TYPE_FIELD: &str = "message_type";

/// Discriminant of the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request = 0,
    Response = 1,
}

impl MessageType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(MessageType::Request),
            1 => Some(MessageType::Response),
            _ => None,
        }
    }
}

/// Whether the sender waits for a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    None = 0,
    #[default]
    Result = 1,
}

impl Serialize for ResponseType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for ResponseType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match u8::deserialize(deserializer)? {
            0 => Ok(ResponseType::None),
            1 => Ok(ResponseType::Result),
            other => Err(serde::de::Error::custom(format!(
                "unknown response_type: {other}"
            ))),
        }
    }
}

/// An outbound or inbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub correlation_id: String,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default)]
    pub app_id: String,
    /// Dispatch key, or a typed payload carrying its own identifier.
    pub method: Value,
    #[serde(default)]
    pub response_type: ResponseType,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl Request {
    pub fn new(correlation_id: impl Into<String>, method: impl Into<Value>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            headers: Map::new(),
            app_id: String::new(),
            method: method.into(),
            response_type: ResponseType::Result,
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn requires_response(&self) -> bool {
        self.response_type == ResponseType::Result
    }
}

/// Answer to a [`Request`], correlated by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub correlation_id: String,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<RpcException>,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_content_type() -> String {
    CONTENT_TYPE_JSON.to_string()
}

impl Response {
    /// Successful answer to `request`.
    pub fn result(request: &Request, result: Value) -> Self {
        Self {
            correlation_id: request.correlation_id.clone(),
            headers: request.headers.clone(),
            app_id: request.app_id.clone(),
            result,
            exception: None,
            content_type: CONTENT_TYPE_JSON.to_string(),
        }
    }

    /// Failed answer to `request`.
    pub fn exception(request: &Request, exception: RpcException) -> Self {
        Self {
            correlation_id: request.correlation_id.clone(),
            headers: request.headers.clone(),
            app_id: request.app_id.clone(),
            result: Value::Null,
            exception: Some(exception),
            content_type: CONTENT_TYPE_EXCEPTION.to_string(),
        }
    }

    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }

    pub fn into_outcome(self) -> Result<Value, RpcException> {
        match self.exception {
            Some(exception) => Err(exception),
            None => Ok(self.result),
        }
    }
}

/// Either side of the envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Request(_) => MessageType::Request,
            Message::Response(_) => MessageType::Response,
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Message::Request(request) => &request.correlation_id,
            Message::Response(response) => &response.correlation_id,
        }
    }

    /// Serialize to one JSON frame.
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        let mut value = match self {
            Message::Request(request) => serde_json::to_value(request)?,
            Message::Response(response) => serde_json::to_value(response)?,
        };
        if let Value::Object(map) = &mut value {
            map.insert(
                MESSAGE_TYPE_FIELD.to_string(),
                Value::from(self.message_type().code()),
            );
        }
        Ok(Bytes::from(serde_json::to_vec(&value)?))
    }

    /// Parse one JSON frame, picking the shape by `message_type`.
    pub fn decode(frame: &[u8]) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_slice(frame)?;
        let code = value.get(MESSAGE_TYPE_FIELD).and_then(Value::as_u64);
        match code.and_then(MessageType::from_code) {
            Some(MessageType::Request) => Ok(Message::Request(serde_json::from_value(value)?)),
            Some(MessageType::Response) => Ok(Message::Response(serde_json::from_value(value)?)),
            None => Err(serde::de::Error::custom(format!(
                "unknown message_type: {}",
                value.get(MESSAGE_TYPE_FIELD).unwrap_or(&Value::Null)
            ))),
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}
