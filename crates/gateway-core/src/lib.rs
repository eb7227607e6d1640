//! Core domain types, error definitions, and JSON helpers.
//!
//! This crate defines the fundamental types shared across the gateway:
//! errors, record ids, chat messages, and the JSON conventions used for
//! provider/model identity.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod json;

/// Row id of a stored chat message.
pub type MessageId = i64;
/// Row id of a chat sequence node.
pub type SequenceId = i64;
/// Row id of a foundation-model record.
pub type ModelRecordId = i64;
/// Row id of an inference event.
pub type InferenceEventId = i64;

/// Errors that can occur while servicing a gateway request.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("no model template available: {0}")]
    ModelTemplateMissing(String),

    #[error("template substitution failed: {0}")]
    TemplateMalformed(String),

    #[error("upstream stream error: {0}")]
    UpstreamStream(String),

    #[error("store commit failed: {0}")]
    StoreCommit(String),

    #[error("stream consolidation failed: {0}")]
    Consolidation(String),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::UpstreamStream(format!("JSON decode: {err}"))
    }
}

/// A single immutable chat utterance.
///
/// `role` is free-form; `system`/`user`/`assistant` by convention, plus the
/// synthetic `model config` role for interleaved parameter diffs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            created_at: None,
        }
    }
}

/// Formats a timestamp the way Ollama does on the wire: RFC-3339 UTC with a
/// trailing `Z`.
pub fn wire_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_timestamp_ends_in_z() {
        let stamped = wire_timestamp(Utc::now());
        assert!(stamped.ends_with('Z'), "got {stamped}");
    }

    #[test]
    fn chat_message_roundtrips_without_timestamp() {
        let msg = ChatMessage::new("user", "hello");
        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(!encoded.contains("created_at"));
        let back: ChatMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(back, msg);
    }
}
