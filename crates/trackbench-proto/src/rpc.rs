//! JSON-RPC envelope types for the worker's stdio protocol.
//!
//! The worker speaks one JSON object per line. Requests carry a
//! `tools/call` method with a named tool and its arguments; responses
//! echo the request id with either a `result` payload or an `error`
//! member. The same stream may interleave non-protocol diagnostic
//! text, so parsing is tolerant: lines that are not standalone JSON
//! objects are skipped, never treated as protocol violations.

use serde::{Deserialize, Serialize};

/// Protocol version written into every request envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// The single logical request type the worker understands.
pub const TOOLS_CALL_METHOD: &str = "tools/call";

/// A request envelope written to the worker's stdin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: ToolCallParams,
    pub id: u64,
}

/// Parameters for a `tools/call` request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallParams {
    pub name: String,
    pub arguments: serde_json::Value,
}

impl RpcRequest {
    /// Builds a `tools/call` request for the named tool.
    pub fn tool_call(id: u64, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: TOOLS_CALL_METHOD.to_string(),
            params: ToolCallParams {
                name: name.into(),
                arguments,
            },
            id,
        }
    }
}

/// A response object read from the worker's stdout.
///
/// `id` is optional so that notifications and unrelated JSON objects on
/// the shared stream deserialize without error; the channel ignores
/// anything whose id matches no pending call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

/// The `error` member of a failed response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcErrorBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

impl RpcResponse {
    /// Parse a single line of worker stdout.
    ///
    /// Returns `None` for empty lines and for anything that is not a
    /// standalone JSON object (logged at debug level). The worker mixes
    /// human-readable diagnostics into the same stream, so a parse
    /// failure is expected traffic, not an error.
    pub fn parse_line(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        match serde_json::from_str::<Self>(trimmed) {
            Ok(response) => Some(response),
            Err(e) => {
                tracing::debug!(
                    "Skipping non-protocol line: {} (error: {})",
                    truncate(trimmed, 100),
                    e
                );
                None
            }
        }
    }
}

/// Truncates a string to a maximum length, adding "..." if truncated.
fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let mut end = max_len;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_envelope_shape() {
        let request = RpcRequest::tool_call(42, "list_tracks", json!({}));
        let line = serde_json::to_string(&request).unwrap();

        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "tools/call");
        assert_eq!(value["params"]["name"], "list_tracks");
        assert_eq!(value["id"], 42);
    }

    #[test]
    fn test_parse_success_response() {
        let response =
            RpcResponse::parse_line(r#"{"id":1,"result":{"tracks":["Bass","Drums"]}}"#).unwrap();
        assert_eq!(response.id, Some(1));
        assert_eq!(response.result.unwrap()["tracks"][0], "Bass");
        assert!(response.error.is_none());
    }

    #[test]
    fn test_parse_error_response() {
        let response =
            RpcResponse::parse_line(r#"{"id":7,"error":{"message":"unknown tool"}}"#).unwrap();
        assert_eq!(response.id, Some(7));
        assert_eq!(response.error.unwrap().message, "unknown tool");
    }

    #[test]
    fn test_parse_skips_diagnostic_lines() {
        assert!(RpcResponse::parse_line("Server started on stdio").is_none());
        assert!(RpcResponse::parse_line("").is_none());
        assert!(RpcResponse::parse_line("   ").is_none());
        assert!(RpcResponse::parse_line("{not json").is_none());
    }

    #[test]
    fn test_parse_tolerates_unrelated_json_objects() {
        // A notification without an id parses but carries nothing to match on.
        let response = RpcResponse::parse_line(r#"{"method":"log","params":{}}"#).unwrap();
        assert_eq!(response.id, None);
        assert!(response.result.is_none());
        assert!(response.error.is_none());
    }

    #[test]
    fn test_truncate_utf8_boundary() {
        let s = "ééééé";
        let out = truncate(s, 3);
        assert!(out.ends_with("..."));
    }
}
