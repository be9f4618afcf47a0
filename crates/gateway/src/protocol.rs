//! JSON-RPC 2.0 message construction and the fixed protocol constants.
//!
//! Both wire surfaces (client TCP and subprocess stdio) use the same
//! newline-delimited single-object framing, so the helpers here serve both.

use serde_json::{json, Value};

// Error codes on the client-facing wire.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Doubles as "no credentials found" and "tool disabled".
pub const CREDENTIALS_NOT_FOUND: i64 = -32001;
pub const TOOL_DISABLED: i64 = -32001;
pub const CATEGORY_DENIED: i64 = -32003;
pub const ALLOWLIST_DENIED: i64 = -32004;
pub const USER_BLOCKED: i64 = -32005;

/// Request id the supervisor reserves for its own `initialize` handshake.
pub const SUPERVISOR_INIT_ID: i64 = 1;
/// Request id the supervisor reserves for `tools/list` discovery.
pub const TOOLS_QUERY_ID: i64 = 999;
/// Request id a session reserves for its `initialize` handshake.
pub const SESSION_INIT_ID: i64 = 999;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Allowlist entry that denies every tool for the user it applies to.
pub const BLOCK_ALL_MARKER: &str = "__BLOCK_ALL__";

pub fn request(id: Value, method: &str, params: Value) -> Value {
    let mut msg = json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
    });
    if !params.is_null() {
        msg["params"] = params;
    }
    msg
}

pub fn notification(method: &str, params: Value) -> Value {
    let mut msg = json!({
        "jsonrpc": "2.0",
        "method": method,
    });
    if !params.is_null() {
        msg["params"] = params;
    }
    msg
}

pub fn success(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

pub fn error(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": code,
            "message": message.into(),
        },
    })
}

/// True when the message carries exactly the given numeric id.
pub fn has_id(msg: &Value, id: i64) -> bool {
    msg.get("id").and_then(Value::as_i64) == Some(id)
}

/// The `initialize` request sent to a freshly spawned subprocess.
pub fn initialize_request(id: i64) -> Value {
    request(
        json!(id),
        "initialize",
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "toolgate",
                "version": env!("CARGO_PKG_VERSION"),
            },
        }),
    )
}
