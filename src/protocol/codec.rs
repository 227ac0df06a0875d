//! Newline-delimited JSON framing for the stdio transport.
//!
//! `encode` yields exactly one line per message (serde_json escapes any
//! newline inside string values, so the single-line invariant holds for
//! arbitrary payloads). `decode` classifies an incoming line without
//! panicking; a bad line is the caller's problem to log and skip.

use super::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::error::McpError;
use serde::Serialize;
use serde_json::Value;

/// A decoded line from a tool-server's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// id without method: answer to one of our requests.
    Response(JsonRpcResponse),
    /// id and method: the server wants something from us.
    Request(JsonRpcRequest),
    /// method without id: out-of-band event.
    Notification(JsonRpcNotification),
}

pub fn encode<T: Serialize>(message: &T) -> Result<String, McpError> {
    let mut line =
        serde_json::to_string(message).map_err(|source| McpError::Encode { source })?;
    line.push('\n');
    Ok(line)
}

pub fn decode(line: &str) -> Result<InboundMessage, McpError> {
    let value: Value =
        serde_json::from_str(line).map_err(|source| McpError::Decode { source })?;
    classify(value)
}

fn classify(value: Value) -> Result<InboundMessage, McpError> {
    let Some(object) = value.as_object() else {
        return Err(McpError::Malformed {
            reason: "JSON-RPC message must be an object".to_string(),
        });
    };

    match (object.contains_key("id"), object.contains_key("method")) {
        (true, true) => {
            let request: JsonRpcRequest =
                serde_json::from_value(value).map_err(|source| McpError::Decode { source })?;
            Ok(InboundMessage::Request(request))
        }
        (true, false) => {
            let response: JsonRpcResponse =
                serde_json::from_value(value).map_err(|source| McpError::Decode { source })?;
            if response.result.is_none() && response.error.is_none() {
                return Err(McpError::Malformed {
                    reason: format!("response {} carries neither result nor error", response.id),
                });
            }
            Ok(InboundMessage::Response(response))
        }
        (false, true) => {
            let notification: JsonRpcNotification =
                serde_json::from_value(value).map_err(|source| McpError::Decode { source })?;
            Ok(InboundMessage::Notification(notification))
        }
        (false, false) => Err(McpError::Malformed {
            reason: "message carries neither id nor method".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trip_preserves_all_fields() {
        let request = JsonRpcRequest::new(7, "tools/call", Some(json!({"name": "grep"})));
        let line = encode(&request).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        match decode(line.trim_end()).unwrap() {
            InboundMessage::Request(decoded) => assert_eq!(decoded, request),
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn newline_inside_payload_stays_escaped() {
        let request = JsonRpcRequest::new(1, "tools/call", Some(json!({"text": "a\nb"})));
        let line = encode(&request).unwrap();
        // one terminator, nothing embedded
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn classifies_result_response() {
        let line = r#"{"jsonrpc":"2.0","id":3,"result":{"tools":[]}}"#;
        match decode(line).unwrap() {
            InboundMessage::Response(response) => {
                assert_eq!(response.id, 3);
                assert!(response.result.is_some());
                assert!(response.error.is_none());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn classifies_error_response() {
        let line = r#"{"jsonrpc":"2.0","id":4,"error":{"code":-32601,"message":"no such method"}}"#;
        match decode(line).unwrap() {
            InboundMessage::Response(response) => {
                let error = response.error.expect("error payload");
                assert_eq!(error.code, -32601);
                assert_eq!(error.message, "no such method");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn classifies_notification() {
        let line = r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#;
        match decode(line).unwrap() {
            InboundMessage::Notification(notification) => {
                assert_eq!(notification.method, "notifications/tools/list_changed");
                assert!(notification.params.is_none());
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn classifies_server_initiated_request() {
        let line = r#"{"jsonrpc":"2.0","id":9,"method":"ping"}"#;
        match decode(line).unwrap() {
            InboundMessage::Request(request) => {
                assert_eq!(request.id, 9);
                assert_eq!(request.method, "ping");
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn rejects_invalid_json() {
        assert!(matches!(decode("not json at all"), Err(McpError::Decode { .. })));
    }

    #[test]
    fn rejects_response_without_result_or_error() {
        let line = r#"{"jsonrpc":"2.0","id":5}"#;
        assert!(matches!(decode(line), Err(McpError::Malformed { .. })));
    }

    #[test]
    fn rejects_non_object_payload() {
        assert!(matches!(decode("[1,2,3]"), Err(McpError::Malformed { .. })));
    }

    #[test]
    fn notification_never_serializes_an_id() {
        let notification = JsonRpcNotification::new("notifications/initialized", None);
        let line = encode(&notification).unwrap();
        assert!(!line.contains("\"id\""));
        assert!(!line.contains("\"params\""));
    }
}
