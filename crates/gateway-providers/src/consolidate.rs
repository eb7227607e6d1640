//! Folds a stream of Ollama response chunks into one consolidated object.
//!
//! This is the one place that enumerates known chunk keys; anything foreign
//! aborts consolidation rather than guessing.

use serde_json::{Map, Value};
use tracing::warn;

use gateway_core::json::safe_str;
use gateway_core::GatewayError;

/// Extracts the token text from either wire shape: `/api/generate` uses
/// `response`, `/api/chat` uses `message.content`.
pub fn ollama_log_indexer(chunk: &Value) -> String {
    safe_str(chunk, &["response"])
        .or_else(|| safe_str(chunk, &["message", "content"]))
        .unwrap_or_default()
        .to_string()
}

/// Per-key folding rules:
/// a later `created_at` is renamed `terminal_created_at`; a repeated `done`
/// after `done:true` warns; a `model` change is fatal; `response` strings and
/// `message.content` strings concatenate; `status` is volatile (last write
/// wins); any other repeated key aborts consolidation.
pub fn ollama_response_consolidator(chunk: Value, acc: Value) -> Result<Value, GatewayError> {
    let is_empty = match &acc {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    };
    if is_empty {
        return Ok(chunk);
    }

    let mut acc = match acc {
        Value::Object(map) => map,
        other => {
            return Err(GatewayError::Consolidation(format!(
                "consolidated response is not an object: {other}"
            )))
        }
    };
    let chunk = match chunk {
        Value::Object(map) => map,
        other => {
            return Err(GatewayError::Consolidation(format!(
                "streamed chunk is not an object: {other}"
            )))
        }
    };

    for (key, value) in chunk {
        if !acc.contains_key(&key) {
            acc.insert(key, value);
            continue;
        }

        match key.as_str() {
            "created_at" => {
                acc.insert("terminal_created_at".to_string(), value);
            }
            "done" => {
                if acc["done"].as_bool().unwrap_or(false) {
                    warn!("received additional JSON after streaming indicated done={value}");
                }
                acc.insert(key, value);
            }
            "model" => {
                if acc["model"] != value {
                    return Err(GatewayError::Consolidation(format!(
                        "model changed mid-stream: expected {}, got {value}",
                        acc["model"]
                    )));
                }
            }
            "response" => {
                let appended = value.as_str().unwrap_or_default();
                let combined = format!(
                    "{}{appended}",
                    acc["response"].as_str().unwrap_or_default()
                );
                acc.insert(key, Value::String(combined));
            }
            "message" => merge_message(&mut acc, value)?,
            "status" => {
                acc.insert(key, value);
            }
            _ => {
                return Err(GatewayError::Consolidation(format!(
                    "unidentified repeated key \"{key}\", abandoning consolidation"
                )));
            }
        }
    }

    Ok(Value::Object(acc))
}

fn merge_message(acc: &mut Map<String, Value>, incoming: Value) -> Result<(), GatewayError> {
    let incoming = match incoming {
        Value::Object(map) => map,
        other => {
            return Err(GatewayError::Consolidation(format!(
                "message chunk is not an object: {other}"
            )))
        }
    };

    let expected: Vec<&str> = vec!["content", "role"];
    if incoming.keys().map(String::as_str).collect::<Vec<_>>() != expected {
        warn!(
            "unexpected message content with keys: {:?}",
            incoming.keys().collect::<Vec<_>>()
        );
    }
    if incoming.get("role").and_then(Value::as_str) != Some("assistant") {
        warn!(
            "received content for unexpected role {:?}, continuing anyway",
            incoming.get("role")
        );
    }

    let appended = incoming
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let existing = acc
        .get_mut("message")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| {
            GatewayError::Consolidation("consolidated message is not an object".to_string())
        })?;
    let combined = format!(
        "{}{appended}",
        existing.get("content").and_then(Value::as_str).unwrap_or_default()
    );
    existing.insert("content".to_string(), Value::String(combined));
    Ok(())
}
