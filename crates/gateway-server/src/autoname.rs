//! Lazily names chat threads with a one-line summary from the same model
//! that produced the conversation.

use std::pin::pin;
use std::sync::Arc;

use futures::StreamExt;

use gateway_core::{ChatMessage, GatewayError};
use gateway_history::FoundationModelRow;
use gateway_providers::{ollama_log_indexer, InferenceOptions, OllamaProvider, Provider};
use gateway_stream::ServerStatusHolder;

use crate::state::ServerState;

const AUTONAME_INSTRUCTION: &str = "Summarize the above messages, suitable as a short \
     description for a tab title. Answer with that title only, do not provide additional \
     information. Reply with exactly one title.\n\n";

/// Hard ceiling on stored titles; anything longer is nonsense anyway.
const AUTONAME_MAX_CHARS: usize = 279;

/// Asks the model for a tab title covering `messages`. The stream is cut at
/// the first newline so a rambling model costs one line, not a paragraph.
pub async fn autoname_sequence(
    state: &Arc<ServerState>,
    messages: &[ChatMessage],
    model: &FoundationModelRow,
    status: &ServerStatusHolder,
) -> Result<String, GatewayError> {
    let _scope = status.scope(format!(
        "autonaming chat with {} message(s) via {}",
        messages.len(),
        model.human_id
    ));

    let mut naming_messages = messages.to_vec();
    naming_messages.push(ChatMessage::new("user", AUTONAME_INSTRUCTION));
    let options = InferenceOptions {
        seed_assistant_response: Some("Tab title: ".into()),
        ..Default::default()
    };

    let provider = match state.registry.provider_for_model(model).await {
        Some(provider) => provider,
        None => Arc::new(OllamaProvider::new(state.upstream.clone())) as Arc<dyn Provider>,
    };
    let chunks = provider
        .chat_nolog(
            &naming_messages,
            model,
            &options,
            "autoname",
            status.clone(),
            state.history.clone(),
            state.audit.clone(),
        )
        .await?;

    let mut raw = String::new();
    let mut chunks = pin!(chunks);
    while let Some(chunk) = chunks.next().await {
        raw.push_str(&ollama_log_indexer(&chunk?));
        // Ignore the first couple of characters, in case the model likes
        // prepending a newline.
        if raw.chars().skip(2).any(|c| c == '\n') {
            break;
        }
    }

    Ok(tidy_autoname(&raw))
}

/// First line only, stripped of wrapping quotes, capped in length.
pub fn tidy_autoname(raw: &str) -> String {
    let mut first_line = String::new();
    for (position, ch) in raw.chars().enumerate() {
        if ch == '\n' && position >= 2 {
            break;
        }
        if ch != '\n' {
            first_line.push(ch);
        }
    }

    let trimmed = first_line
        .trim()
        .trim_matches(|c| matches!(c, '"' | '\'' | '\u{201c}' | '\u{201d}' | '\u{2018}' | '\u{2019}'))
        .trim();

    trimmed.chars().take(AUTONAME_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_quotes_and_whitespace() {
        assert_eq!(tidy_autoname("  \"Sky colours explained\"  "), "Sky colours explained");
        assert_eq!(tidy_autoname("\u{201c}Curly quoted\u{201d}"), "Curly quoted");
    }

    #[test]
    fn cuts_at_the_first_newline_past_the_lead_in() {
        assert_eq!(
            tidy_autoname("Sky colours\nand a second line of rambling"),
            "Sky colours"
        );
        // A leading newline from the model is tolerated.
        assert_eq!(tidy_autoname("\nSky colours\nmore"), "Sky colours");
    }

    #[test]
    fn caps_the_length_below_280() {
        let long = "t".repeat(1000);
        assert!(tidy_autoname(&long).chars().count() < 280);
    }
}
