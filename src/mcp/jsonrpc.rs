//! JSON-RPC 2.0 framing for the stdio tool server.
//!
//! The method surface is deliberately small: the MCP handshake plus the
//! four team tools. Anything else is rejected with a protocol error
//! rather than silently ignored, and `tools/call` params are parsed
//! into a typed shape so a missing tool name surfaces as invalid-params
//! instead of an unknown-tool lookup for `""`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::tools;
use crate::jobs::JobSupervisor;

/// MCP protocol revision this server speaks.
const PROTOCOL_VERSION: &str = "2024-11-05";

const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const PARSE_ERROR: i64 = -32700;

/// An incoming request line.
#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    #[serde(default = "empty_params")]
    params: Value,
}

fn empty_params() -> Value {
    Value::Object(Default::default())
}

/// An outgoing response line: exactly one of `result` or `error`.
#[derive(Debug, Serialize)]
pub struct Response {
    jsonrpc: &'static str,
    id: Value,
    #[serde(flatten)]
    body: Body,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum Body {
    Result(Value),
    Error(ErrorBody),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: i64,
    message: String,
}

impl Response {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            body: Body::Result(result),
        }
    }

    fn fail(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            body: Body::Error(ErrorBody {
                code,
                message: message.into(),
            }),
        }
    }

    /// Response for a line that was not valid JSON-RPC at all.
    pub fn parse_error(e: serde_json::Error) -> Self {
        Self::fail(Value::Null, PARSE_ERROR, format!("parse error: {}", e))
    }
}

/// `tools/call` params, parsed up front.
#[derive(Debug, Deserialize)]
struct ToolCall {
    name: String,
    #[serde(default = "empty_params")]
    arguments: Value,
}

/// Dispatch one request against the supervisor.
pub async fn handle_request(supervisor: &JobSupervisor, request: Request) -> Response {
    let id = request.id.unwrap_or(Value::Null);

    // Notifications carry no version requirements worth fighting over,
    // but real calls must be JSON-RPC 2.0.
    if !request.jsonrpc.is_empty() && request.jsonrpc != "2.0" {
        return Response::fail(
            id,
            INVALID_REQUEST,
            format!("unsupported jsonrpc version '{}'", request.jsonrpc),
        );
    }

    match request.method.as_str() {
        "initialize" => Response::ok(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        ),

        "notifications/initialized" => Response::ok(id, Value::Null),

        "tools/list" => Response::ok(id, json!({ "tools": tools::list_tools() })),

        "tools/call" => {
            let call: ToolCall = match serde_json::from_value(request.params) {
                Ok(call) => call,
                Err(e) => {
                    return Response::fail(
                        id,
                        INVALID_PARAMS,
                        format!("invalid tools/call params: {}", e),
                    );
                }
            };
            let result = tools::call_tool(supervisor, &call.name, &call.arguments).await;
            Response::ok(id, serde_json::to_value(result).unwrap_or(Value::Null))
        }

        other => Response::fail(
            id,
            METHOD_NOT_FOUND,
            format!("method '{}' is not served here", other),
        ),
    }
}
