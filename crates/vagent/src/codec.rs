//! Payload codec: RPC calls and replies to and from frame bodies.
//!
//! The channel core only ever sees bodies as bytes. Everything that looks
//! inside a body goes through [`PayloadCodec`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A method call as carried in a request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcCall {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcCall {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Application-level error returned by a method.
///
/// Sent back to the caller as a normal response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("fault {code}: {message}")]
pub struct Fault {
    pub code: i32,
    pub message: String,
}

impl Fault {
    pub const UNKNOWN_METHOD: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL: i32 = -32603;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unknown_method(method: &str) -> Self {
        Self::new(Self::UNKNOWN_METHOD, format!("unknown method: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL, message)
    }
}

/// Method result: a value or a fault.
pub type Reply = Result<Value, Fault>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode payload: {0}")]
    Encode(String),

    #[error("failed to decode payload: {0}")]
    Decode(String),
}

pub trait PayloadCodec: Send + Sync {
    fn content_type(&self) -> &'static str;

    fn encode_call(&self, call: &RpcCall) -> Result<Bytes, CodecError>;

    fn decode_call(&self, body: &[u8]) -> Result<RpcCall, CodecError>;

    fn encode_reply(&self, reply: &Reply) -> Result<Bytes, CodecError>;

    fn decode_reply(&self, body: &[u8]) -> Result<Reply, CodecError>;
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum WireReply {
    Result(Value),
    Fault(Fault),
}

/// JSON bodies:
///
/// - call: `{"method": "va.ping", "params": ...}`
/// - reply: `{"result": ...}` or `{"fault": {"code": N, "message": "..."}}`
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRpcCodec;

impl PayloadCodec for JsonRpcCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode_call(&self, call: &RpcCall) -> Result<Bytes, CodecError> {
        serde_json::to_vec(call)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_call(&self, body: &[u8]) -> Result<RpcCall, CodecError> {
        let call: RpcCall =
            serde_json::from_slice(body).map_err(|e| CodecError::Decode(e.to_string()))?;
        if call.method.is_empty() {
            return Err(CodecError::Decode("empty method name".to_string()));
        }
        Ok(call)
    }

    fn encode_reply(&self, reply: &Reply) -> Result<Bytes, CodecError> {
        let wire = match reply {
            Ok(v) => WireReply::Result(v.clone()),
            Err(f) => WireReply::Fault(f.clone()),
        };
        serde_json::to_vec(&wire)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_reply(&self, body: &[u8]) -> Result<Reply, CodecError> {
        let wire: WireReply =
            serde_json::from_slice(body).map_err(|e| CodecError::Decode(e.to_string()))?;
        Ok(match wire {
            WireReply::Result(v) => Ok(v),
            WireReply::Fault(f) => Err(f),
        })
    }
}
