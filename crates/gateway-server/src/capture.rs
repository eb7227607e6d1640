//! Captures a third-party client's resent chat history into the sequence
//! DAG, deduplicating messages and reusing matching chains.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use gateway_core::json::{safe_get, safe_str};
use gateway_core::{ChatMessage, GatewayError};
use gateway_history::{ChatSequenceRow, HistoryStore, NewSequence};

/// Walks the inbound `/api/chat` message list, storing anything new and
/// building (or reusing) the sequence chain that mirrors it.
///
/// Returns the leaf of that chain plus the system message, if one was
/// provided. Ollama clients resend the system message as the first list
/// entry on every turn; on the first pass a matching system-rooted chain is
/// reused, but when the first non-system message turns out to be new, the
/// capture restarts with `commit_system_messages_as_new` so the system turn
/// gets a fresh node instead of grafting onto an unrelated old chain.
pub fn capture_chat_messages(
    history: &HistoryStore,
    chat_messages: &[Value],
) -> Result<(Option<ChatSequenceRow>, Option<String>), GatewayError> {
    capture_inner(history, chat_messages, false)
}

fn capture_inner(
    history: &HistoryStore,
    chat_messages: &[Value],
    commit_system_messages_as_new: bool,
) -> Result<(Option<ChatSequenceRow>, Option<String>), GatewayError> {
    let mut prior_sequence: Option<ChatSequenceRow> = None;
    let mut system_message: Option<String> = None;

    for (index, raw) in chat_messages.iter().enumerate() {
        let role = safe_str(raw, &["role"]).unwrap_or_default().to_string();
        let content = safe_get(raw, &["content"])
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if role == "system" {
            if system_message.is_some() {
                warn!("received several \"system\" messages, keeping the newest");
            }
            if !content.is_empty() {
                system_message = Some(content.clone());
            }
        } else if role != "user" && role != "assistant" {
            warn!("received unknown chat role \"{role}\", continuing anyway");
        }
        if safe_get(raw, &["images"]).is_some_and(|images| !images.is_null()) {
            warn!("client submitted images for upload, ignoring");
        }

        let created_at = safe_str(raw, &["created_at"])
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc));
        let message = ChatMessage {
            role: role.clone(),
            content,
            created_at,
        };
        let (message_id, _) = history.create_message(&message)?;

        // Check for an existing chain node covering the same history.
        let reusable = if role == "system" && commit_system_messages_as_new {
            None
        } else {
            history.latest_sequence_for_message(message_id)?
        };
        if let Some(candidate) = reusable {
            let parents_match = match &prior_sequence {
                None => candidate.parent_sequence.is_none(),
                Some(prior) => candidate.parent_sequence == Some(prior.id),
            };
            if parents_match {
                debug!(
                    "found matching histories, reusing {} node #{}",
                    role, candidate.id
                );
                prior_sequence = Some(candidate);
                continue;
            }
        }

        // The client re-sent an old system message but the conversation
        // itself is new: start over with fresh nodes for system turns.
        if index == 1
            && safe_str(&chat_messages[0], &["role"]) == Some("system")
            && !commit_system_messages_as_new
        {
            debug!("first non-system message is new, restarting capture with a fresh chain");
            return capture_inner(history, chat_messages, true);
        }

        let inference_error = match &prior_sequence {
            Some(_) if role != "user" => Some("[unknown, skimmed from /api/chat]".to_string()),
            _ => None,
        };
        let node = NewSequence {
            human_desc: prior_sequence.as_ref().and_then(|p| p.human_desc.clone()),
            user_pinned: false,
            current_message: message_id,
            parent_sequence: prior_sequence.as_ref().map(|p| p.id),
            generated_at: Some(Utc::now()),
            generation_complete: true,
            inference_job_id: None,
            inference_error,
        };
        // A restarted capture deliberately mints a fresh node for the system
        // turn; everything else may deduplicate.
        let sequence_id = if role == "system" && commit_system_messages_as_new {
            history.append_sequence_node(&node)?
        } else {
            history.create_sequence(&node)?.0
        };
        prior_sequence = history.get_sequence(sequence_id)?;
    }

    Ok((prior_sequence, system_message))
}
