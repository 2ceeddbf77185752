//! Wire payloads for the two protocol variants
//!
//! The stateless variant sends plain JSON bodies; the stateful variant
//! wraps everything in JSON-RPC 2.0 envelopes. Bodies are materialized so
//! byte counts come from real encodings rather than estimates.

use serde_json::{json, Value};

use crate::server::TurnMessage;

/// Fixed per-request framing (headers etc.) charged on top of each body.
pub const REQUEST_FRAMING_BYTES: u64 = 100;

/// Full-context chat body: the new message plus every prior turn.
pub fn chat_body(history: &[TurnMessage], message: &str) -> Vec<u8> {
    json!({ "message": message, "history": history })
        .to_string()
        .into_bytes()
}

/// Task start body for the polling endpoint.
pub fn start_task_body(duration_ms: u64) -> Vec<u8> {
    json!({ "duration_ms": duration_ms }).to_string().into_bytes()
}

/// Tool invocation body for the stateless endpoint.
pub fn tool_body(name: &str, input: &str) -> Vec<u8> {
    json!({ "name": name, "input": input }).to_string().into_bytes()
}

/// JSON-RPC 2.0 envelope.
pub fn rpc_body(method: &str, params: Value, id: u64) -> Vec<u8> {
    json!({ "jsonrpc": "2.0", "method": method, "params": params, "id": id })
        .to_string()
        .into_bytes()
}

/// String field of a JSON response body, if present.
pub fn str_field(body: &[u8], field: &str) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    value.get(field)?.as_str().map(str::to_owned)
}

/// Unsigned integer field of a JSON response body, if present.
pub fn u64_field(body: &[u8], field: &str) -> Option<u64> {
    let value: Value = serde_json::from_slice(body).ok()?;
    value.get(field)?.as_u64()
}
