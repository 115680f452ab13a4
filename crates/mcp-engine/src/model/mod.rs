//! JSON-RPC 2.0 message model and the MCP data types carried inside it.
//!
//! The wire unit is [`JsonRpcMessage`], a four-way union classified purely by
//! shape: a message with an `id` and a `method` is a request, an `id` with a
//! `result` or `error` is a response, a `method` without an `id` is a
//! notification. [`parse`] and [`serialize`] are structural inverses.

mod capabilities;
mod content;
mod params;

use std::borrow::Cow;

use serde::{Deserialize, Serialize, de, ser};
use serde_json::Value;

pub use capabilities::*;
pub use content::*;
pub use params::*;

/// The only JSON-RPC version this engine speaks.
pub const JSONRPC_VERSION: &str = "2.0";

/// Zero-sized marker for the `jsonrpc` field. Serializes to the literal
/// `"2.0"` and refuses anything else on the way in, so a message with a
/// wrong or missing version never classifies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonRpcVersion2_0;

impl Serialize for JsonRpcVersion2_0 {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion2_0 {
    fn deserialize<D: de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let version: Cow<'de, str> = Deserialize::deserialize(deserializer)?;
        if version == JSONRPC_VERSION {
            Ok(JsonRpcVersion2_0)
        } else {
            Err(de::Error::custom(format!(
                "expected jsonrpc version {JSONRPC_VERSION}, got {version}"
            )))
        }
    }
}

/// A request id chosen by the sender, echoed verbatim in the response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum NumberOrString {
    Number(i64),
    String(String),
}

impl std::fmt::Display for NumberOrString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NumberOrString::Number(n) => n.fmt(f),
            NumberOrString::String(s) => s.fmt(f),
        }
    }
}

impl From<i64> for NumberOrString {
    fn from(value: i64) -> Self {
        NumberOrString::Number(value)
    }
}

impl From<String> for NumberOrString {
    fn from(value: String) -> Self {
        NumberOrString::String(value)
    }
}

pub type RequestId = NumberOrString;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub result: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub error: ErrorData,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcNotification {
    pub jsonrpc: JsonRpcVersion2_0,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// The four message shapes of JSON-RPC 2.0. Variant order matters: serde
/// tries them top to bottom, and the field sets are disjoint enough that the
/// first match is the right one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Error(JsonRpcError),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    pub fn request(method: impl Into<String>, id: RequestId, params: Option<Value>) -> Self {
        JsonRpcMessage::Request(JsonRpcRequest {
            jsonrpc: JsonRpcVersion2_0,
            id,
            method: method.into(),
            params,
        })
    }

    pub fn response(id: RequestId, result: Value) -> Self {
        JsonRpcMessage::Response(JsonRpcResponse {
            jsonrpc: JsonRpcVersion2_0,
            id,
            result,
        })
    }

    pub fn error(id: RequestId, error: ErrorData) -> Self {
        JsonRpcMessage::Error(JsonRpcError {
            jsonrpc: JsonRpcVersion2_0,
            id,
            error,
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        JsonRpcMessage::Notification(JsonRpcNotification {
            jsonrpc: JsonRpcVersion2_0,
            method: method.into(),
            params,
        })
    }

    /// The correlation id, for the three variants that carry one.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.id),
            JsonRpcMessage::Response(r) => Some(&r.id),
            JsonRpcMessage::Error(e) => Some(&e.id),
            JsonRpcMessage::Notification(_) => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.method),
            JsonRpcMessage::Notification(n) => Some(&n.method),
            _ => None,
        }
    }

    pub fn into_request(self) -> Option<JsonRpcRequest> {
        match self {
            JsonRpcMessage::Request(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_notification(self) -> Option<JsonRpcNotification> {
        match self {
            JsonRpcMessage::Notification(n) => Some(n),
            _ => None,
        }
    }
}

impl JsonRpcResponse {
    /// An empty-object result is the liveness "pong" shape; the dispatcher
    /// discards it after acknowledging the pending request.
    pub fn is_pong(&self) -> bool {
        self.result.as_object().is_some_and(|o| o.is_empty())
    }
}

/// Parse one wire message. Malformed JSON maps to `parse_error`; valid JSON
/// that fails the version check or does not classify maps to
/// `invalid_request`.
pub fn parse(input: &str) -> Result<JsonRpcMessage, ErrorData> {
    let value: Value =
        serde_json::from_str(input).map_err(|e| ErrorData::parse_error(e.to_string()))?;
    serde_json::from_value(value).map_err(|e| ErrorData::invalid_request(e.to_string()))
}

/// Serialize one wire message. Infallible for the types this crate builds.
pub fn serialize(message: &JsonRpcMessage) -> String {
    serde_json::to_string(message).unwrap_or_else(|e| {
        // Value-backed payloads cannot fail to serialize; keep the wire alive
        // if that assumption is ever broken.
        tracing::error!("failed to serialize message: {e}");
        String::new()
    })
}

/// Symbolic JSON-RPC error codes with the fixed numeric table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const PARSE_ERROR: Self = Self(-32700);
    pub const INVALID_REQUEST: Self = Self(-32600);
    pub const METHOD_NOT_FOUND: Self = Self(-32601);
    pub const INVALID_PARAMS: Self = Self(-32602);
    pub const INTERNAL_ERROR: Self = Self(-32603);
    /// MCP domain code: the requested protocol version is not supported.
    pub const UNSUPPORTED_PROTOCOL_VERSION: Self = Self(-32000);
    /// MCP domain code: a resource read missed.
    pub const RESOURCE_NOT_FOUND: Self = Self(-32002);
}

/// Error object carried by [`JsonRpcMessage::Error`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorData {
    pub code: ErrorCode,
    pub message: Cow<'static, str>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorData {
    pub fn new(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        data: Option<Value>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn parse_error(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::PARSE_ERROR, message, None)
    }

    pub fn invalid_request(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::INVALID_REQUEST, message, None)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::METHOD_NOT_FOUND,
            format!("method not found: {method}"),
            None,
        )
    }

    pub fn invalid_params(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::INVALID_PARAMS, message, data)
    }

    pub fn internal_error(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::INTERNAL_ERROR, message, None)
    }

    pub fn resource_not_found(uri: &str) -> Self {
        Self::new(
            ErrorCode::RESOURCE_NOT_FOUND,
            format!("resource not found: {uri}"),
            None,
        )
    }
}

/// MCP protocol revision, date-formatted. The date form sorts lexically, so
/// the derived ordering is the chronological one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct ProtocolVersion(Cow<'static, str>);

impl ProtocolVersion {
    pub const V_2024_11_05: Self = Self(Cow::Borrowed("2024-11-05"));
    pub const V_2025_03_26: Self = Self(Cow::Borrowed("2025-03-26"));
    pub const V_2025_06_18: Self = Self(Cow::Borrowed("2025-06-18"));
    pub const LATEST: Self = Self::V_2025_06_18;

    /// Every revision this engine can negotiate, oldest first.
    pub fn supported() -> &'static [ProtocolVersion] {
        const SUPPORTED: &[ProtocolVersion] = &[
            ProtocolVersion::V_2024_11_05,
            ProtocolVersion::V_2025_03_26,
            ProtocolVersion::V_2025_06_18,
        ];
        SUPPORTED
    }

    pub fn is_supported(&self) -> bool {
        Self::supported().contains(self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ProtocolVersion {
    fn from(value: &str) -> Self {
        Self(Cow::Owned(value.to_string()))
    }
}

impl From<String> for ProtocolVersion {
    fn from(value: String) -> Self {
        Self(Cow::Owned(value))
    }
}

/// Wire method names, grouped the way the dispatcher routes them.
pub mod method {
    pub const INITIALIZE: &str = "initialize";
    pub const PING: &str = "ping";

    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_TEMPLATES_LIST: &str = "resources/templates/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";
    pub const COMPLETION_COMPLETE: &str = "completion/complete";
    pub const SET_LOGGING_LEVEL: &str = "client/setLoggingLevel";

    pub const ROOTS_LIST: &str = "roots/list";
    pub const SAMPLING_CREATE_MESSAGE: &str = "sampling/createMessage";

    pub const NOTIFICATION_INITIALIZED: &str = "notifications/initialized";
    pub const NOTIFICATION_CANCELLED: &str = "notifications/cancelled";
    pub const NOTIFICATION_PROGRESS: &str = "notifications/progress";
    pub const NOTIFICATION_TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    pub const NOTIFICATION_PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";
    pub const NOTIFICATION_RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
    pub const NOTIFICATION_RESOURCES_UPDATED: &str = "notifications/resources/updated";
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_classify_request() {
        let message = parse(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
        let JsonRpcMessage::Request(request) = message else {
            panic!("expected request, got {message:?}");
        };
        assert_eq!(request.id, NumberOrString::Number(1));
        assert_eq!(request.method, "ping");
        assert!(request.params.is_none());
    }

    #[test]
    fn test_classify_response() {
        let message = parse(r#"{"jsonrpc":"2.0","id":"a1","result":{"ok":true}}"#).unwrap();
        assert!(matches!(message, JsonRpcMessage::Response(_)));
    }

    #[test]
    fn test_classify_error() {
        let message =
            parse(r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32601,"message":"nope"}}"#).unwrap();
        let JsonRpcMessage::Error(error) = message else {
            panic!("expected error, got {message:?}");
        };
        assert_eq!(error.error.code, ErrorCode::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_classify_notification() {
        let message =
            parse(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        assert!(matches!(message, JsonRpcMessage::Notification(_)));
    }

    #[test]
    fn test_wrong_version_is_invalid_request() {
        let err = parse(r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::INVALID_REQUEST);
    }

    #[test]
    fn test_missing_version_is_invalid_request() {
        let err = parse(r#"{"id":1,"method":"ping"}"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::INVALID_REQUEST);
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let err = parse(r#"{"jsonrpc":"2.0","#).unwrap_err();
        assert_eq!(err.code, ErrorCode::PARSE_ERROR);
    }

    #[test]
    fn test_round_trip_all_variants() {
        let messages = [
            JsonRpcMessage::request("tools/call", 7.into(), Some(json!({"name": "echo"}))),
            JsonRpcMessage::response("r-1".to_string().into(), json!({"tools": []})),
            JsonRpcMessage::error(2.into(), ErrorData::method_not_found("nope/nope")),
            JsonRpcMessage::notification("notifications/progress", Some(json!({"progress": 5}))),
        ];
        for message in messages {
            let round_tripped = parse(&serialize(&message)).unwrap();
            assert_eq!(round_tripped, message);
        }
    }

    #[test]
    fn test_response_pong_shape() {
        let pong = JsonRpcResponse {
            jsonrpc: JsonRpcVersion2_0,
            id: 1.into(),
            result: json!({}),
        };
        assert!(pong.is_pong());
        let real = JsonRpcResponse {
            jsonrpc: JsonRpcVersion2_0,
            id: 1.into(),
            result: json!({"tools": []}),
        };
        assert!(!real.is_pong());
    }

    #[test]
    fn test_protocol_version_ordering() {
        assert!(ProtocolVersion::V_2024_11_05 < ProtocolVersion::V_2025_06_18);
        assert!(!ProtocolVersion::from("1.0.0").is_supported());
        assert!(ProtocolVersion::LATEST.is_supported());
    }
}
