//! Wire protocol
//!
//! Newline-delimited JSON-RPC 2.0 over the service sockets. Callers use the
//! `accounts.*` and `signon.*` methods on the caller socket; the dialog
//! renderer drives requests through `ui.*` on its own socket.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ErrorKind;
use crate::params::Parameters;
use crate::request::{Interface, Reply, RequestId};
use crate::window::WindowHandle;

/// JSON-RPC 2.0 Request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data: None,
            }),
        }
    }

    /// Error reply carrying one of the broker's named errors
    pub fn broker_error(id: Option<Value>, kind: ErrorKind, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code: BROKER_ERROR,
                message,
                data: Some(json!({ "name": kind.wire_name() })),
            }),
        }
    }

    pub fn from_reply(id: Option<Value>, reply: Reply) -> Self {
        match reply {
            Reply::Result(result) => Self::success(id, Value::Object(result)),
            Reply::Error { kind, message } => Self::broker_error(id, kind, message),
        }
    }
}

/// JSON-RPC 2.0 Error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// Standard JSON-RPC error codes
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// Application errors; `data.name` carries the error name
pub const BROKER_ERROR: i32 = -32000;

/// Socket a connection was accepted on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Applications and the credential store asking for access
    Caller,
    /// The dialog renderer; may see and complete every request
    Renderer,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Caller => write!(f, "caller"),
            Self::Renderer => write!(f, "renderer"),
        }
    }
}

/// Methods understood by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    RequestAccess(Interface),
    CancelUiRequest,
    List,
    Present,
    Complete,
    Fail,
    Cancel,
}

impl Method {
    pub fn parse(name: &str) -> Option<Self> {
        let method = match name {
            "accounts.requestAccess" => Self::RequestAccess(Interface::Accounts),
            "signon.requestAccess" => Self::RequestAccess(Interface::SignOn),
            "signon.cancelUiRequest" => Self::CancelUiRequest,
            "ui.list" => Self::List,
            "ui.present" => Self::Present,
            "ui.complete" => Self::Complete,
            "ui.fail" => Self::Fail,
            "ui.cancel" => Self::Cancel,
            _ => return None,
        };
        Some(method)
    }

    /// The only channel a method is served on
    pub fn channel(&self) -> Channel {
        match self {
            Self::RequestAccess(_) | Self::CancelUiRequest => Channel::Caller,
            Self::List | Self::Present | Self::Complete | Self::Fail | Self::Cancel => {
                Channel::Renderer
            }
        }
    }
}

/// Parameters of `signon.cancelUiRequest`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelUiRequestParams {
    pub request_id: String,
}

/// Parameters of `ui.present`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresentParams {
    pub request: RequestId,
    pub window: WindowHandle,
}

/// Parameters of `ui.complete`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteParams {
    pub request: RequestId,
    #[serde(default)]
    pub result: Parameters,
}

/// Parameters of `ui.fail`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailParams {
    pub request: RequestId,
    /// Short or fully qualified error name
    pub error: String,
    #[serde(default)]
    pub message: String,
}

/// Parameters of `ui.cancel`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestParams {
    pub request: RequestId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_shape() {
        let response = JsonRpcResponse::from_reply(
            Some(json!(4)),
            Reply::error(ErrorKind::Forbidden, "Access denied by the user"),
        );
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(
            value,
            json!({
                "jsonrpc": "2.0",
                "id": 4,
                "error": {
                    "code": -32000,
                    "message": "Access denied by the user",
                    "data": {"name": "org.authbroker.Error.Forbidden"}
                }
            })
        );
    }

    #[test]
    fn test_success_shape() {
        let response = JsonRpcResponse::from_reply(Some(json!("a")), Reply::empty());
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value, json!({"jsonrpc": "2.0", "id": "a", "result": {}}));
    }

    #[test]
    fn test_method_names() {
        assert_eq!(
            Method::parse("signon.requestAccess"),
            Some(Method::RequestAccess(Interface::SignOn))
        );
        assert_eq!(Method::parse("ui.present"), Some(Method::Present));
        assert_eq!(Method::parse("tools/list"), None);
    }

    #[test]
    fn test_method_channels() {
        assert_eq!(
            Method::RequestAccess(Interface::Accounts).channel(),
            Channel::Caller
        );
        assert_eq!(Method::CancelUiRequest.channel(), Channel::Caller);
        for name in ["ui.list", "ui.present", "ui.complete", "ui.fail", "ui.cancel"] {
            assert_eq!(Method::parse(name).unwrap().channel(), Channel::Renderer);
        }
    }

    #[test]
    fn test_ui_params() {
        let params: PresentParams =
            serde_json::from_value(json!({"request": 3, "window": 11})).unwrap();
        assert_eq!(params.request, RequestId(3));
        assert_eq!(params.window, WindowHandle(11));

        let params: FailParams =
            serde_json::from_value(json!({"request": 3, "error": "UserCanceled"})).unwrap();
        assert_eq!(params.message, "");

        let params: CancelUiRequestParams =
            serde_json::from_value(json!({"requestId": "r1"})).unwrap();
        assert_eq!(params.request_id, "r1");
    }
}
