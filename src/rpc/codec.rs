// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Envelope classification and response normalization.
//!
//! A request has a method and a non-null id; a notification has a method
//! and an absent or null id; a response has an id and a result xor error.
//! Batches are inbound-only: an array is expanded element-wise before
//! classification, outbound frames are always a single object.

use serde_json::{json, Value};

use crate::error::RpcError;

/// A classified inbound JSON-RPC frame.
#[derive(Debug, Clone)]
pub enum Envelope {
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
}

/// Classify one decoded JSON value as a request or notification.
///
/// Bare responses are not expected inbound from a WebSocket client in this
/// dialect, so a `result`/`error`-bearing object with no `method` is
/// rejected as malformed rather than silently accepted.
pub fn classify(value: &Value) -> Result<Envelope, RpcError> {
    let obj = value.as_object().ok_or(RpcError::NotAnObject)?;

    let method = obj
        .get("method")
        .and_then(Value::as_str)
        .ok_or(RpcError::MissingMethod)?
        .to_string();

    let params = obj.get("params").cloned().unwrap_or(Value::Null);

    match obj.get("id") {
        Some(id) if !id.is_null() => Ok(Envelope::Request {
            id: id.clone(),
            method,
            params,
        }),
        _ => Ok(Envelope::Notification { method, params }),
    }
}

/// Expand a top-level decoded value into one or more frames to classify.
///
/// A JSON array is treated as a batch and expanded element-wise; anything
/// else is a single frame.
pub fn expand_batch(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        other => vec![other],
    }
}

/// Build a JSON-RPC error envelope.
pub fn build_error_envelope(id: &Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": code,
            "message": message.into(),
        }
    })
}

/// Normalize a child agent's raw reply `raw` against the original request
/// `id`, per the response-normalization rule: a `result`/`error`-bearing
/// object is copied through with `jsonrpc`/`id` forced; anything else is
/// wrapped as a bare result, falling back to `null`.
pub fn normalize_response(raw: &Value, id: &Value) -> Value {
    if let Some(obj) = raw.as_object() {
        if let Some(result) = obj.get("result") {
            return json!({ "jsonrpc": "2.0", "id": id, "result": result });
        }
        if let Some(error) = obj.get("error") {
            return json!({ "jsonrpc": "2.0", "id": id, "error": normalize_error(error) });
        }
    }
    json!({ "jsonrpc": "2.0", "id": id, "result": raw })
}

fn normalize_error(error: &Value) -> Value {
    let code = error
        .get("code")
        .and_then(Value::as_i64)
        .unwrap_or(-32000);
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("Unknown error")
        .to_string();
    json!({ "code": code, "message": message })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_request_has_non_null_id() {
        let v = json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});
        match classify(&v).unwrap() {
            Envelope::Request { id, method, .. } => {
                assert_eq!(id, json!(1));
                assert_eq!(method, "ping");
            }
            _ => panic!("expected request"),
        }
    }

    #[test]
    fn test_classify_notification_has_null_or_absent_id() {
        let v = json!({"jsonrpc": "2.0", "method": "session/cancel", "params": {"sessionId": "s1"}});
        assert!(matches!(classify(&v).unwrap(), Envelope::Notification { .. }));

        let v = json!({"jsonrpc": "2.0", "id": null, "method": "session/cancel"});
        assert!(matches!(classify(&v).unwrap(), Envelope::Notification { .. }));
    }

    #[test]
    fn test_classify_missing_method_is_malformed() {
        let v = json!({"jsonrpc": "2.0", "id": 1});
        assert!(matches!(classify(&v), Err(RpcError::MissingMethod)));
    }

    #[test]
    fn test_classify_non_object_is_malformed() {
        let v = json!([1, 2, 3]);
        assert!(matches!(classify(&v), Err(RpcError::NotAnObject)));
    }

    #[test]
    fn test_expand_batch_array() {
        let v = json!([{"method": "a"}, {"method": "b"}]);
        let frames = expand_batch(v);
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_expand_batch_single_object_passthrough() {
        let v = json!({"method": "a"});
        let frames = expand_batch(v);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_normalize_response_with_result() {
        let raw = json!({"result": {"stopReason": "end_turn"}});
        let out = normalize_response(&raw, &json!(7));
        assert_eq!(out["id"], json!(7));
        assert_eq!(out["result"]["stopReason"], json!("end_turn"));
    }

    #[test]
    fn test_normalize_response_with_error_defaults() {
        let raw = json!({"error": {}});
        let out = normalize_response(&raw, &json!(7));
        assert_eq!(out["error"]["code"], json!(-32000));
        assert_eq!(out["error"]["message"], json!("Unknown error"));
    }

    #[test]
    fn test_normalize_response_bare_value_wrapped_as_result() {
        let raw = json!("end_turn");
        let out = normalize_response(&raw, &json!(7));
        assert_eq!(out["result"], json!("end_turn"));
    }

    #[test]
    fn test_build_error_envelope() {
        let env = build_error_envelope(&json!(1), -32602, "missing sessionId");
        assert_eq!(env["error"]["code"], json!(-32602));
        assert_eq!(env["jsonrpc"], json!("2.0"));
    }
}
