//! Converts an Ollama `/api/chat` request into a raw `/api/generate` request
//! by templating the message list, and streams the response back in chat
//! shape.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, warn};

use gateway_audit::{scrub_images, AuditStore};
use gateway_core::json::{safe_get, safe_str};
use gateway_core::GatewayError;
use gateway_history::{FoundationModelRow, HistoryStore};
use gateway_stream::{consolidate_and_call, stream_bytes_to_json, JsonResult};
use gateway_template::{apply_model_template, TemplateError};

use crate::consolidate::ollama_response_consolidator;
use crate::ollama::OllamaUpstream;
use crate::registry::{InferenceOptions, JsonStream};

/// The product of chat-to-generate conversion.
pub struct ConvertedRequest {
    /// The exact prompt handed to `/api/generate`; stored on the
    /// InferenceEvent before any bytes arrive.
    pub prompt_with_templating: String,
    /// Complete `/api/generate` body: `{model, prompt, raw: true, stream,
    /// options?}` with `messages`/`template`/`system`/`context` stripped.
    pub generate_body: Value,
}

/// Templates the chat message list into one raw prompt.
///
/// The effective system message resolves in priority order: the explicitly
/// captured system message, the request's `options.system`, then the model's
/// reconciled parameters. An explicitly captured empty string is a valid
/// value and suppresses the system block entirely.
pub fn convert_chat_to_generate(
    chat_body: &Value,
    model: &FoundationModelRow,
    options: &InferenceOptions,
    requested_system_message: Option<&str>,
    prompt_override: Option<&str>,
) -> Result<ConvertedRequest, GatewayError> {
    let model_parameters = model.combined_inference_parameters.as_ref();

    let template = options
        .override_model_template
        .clone()
        .or_else(|| safe_str(chat_body, &["options", "template"]).map(str::to_string))
        .or_else(|| {
            model_parameters
                .and_then(|params| safe_str(params, &["template"]))
                .map(str::to_string)
        })
        .filter(|template| !template.is_empty())
        .ok_or_else(|| GatewayError::ModelTemplateMissing(model.human_id.clone()))?;

    let system_message: String = match requested_system_message {
        Some(explicit) => explicit.to_string(),
        None => options
            .override_system_prompt
            .clone()
            .or_else(|| safe_str(chat_body, &["options", "system"]).map(str::to_string))
            .or_else(|| {
                model_parameters
                    .and_then(|params| safe_str(params, &["system"]))
                    .map(str::to_string)
            })
            .unwrap_or_default(),
    };

    let messages = chat_body
        .get("messages")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut templated: Vec<String> = Vec::with_capacity(messages.len() + 1);
    let mut used_assistant_seed = false;

    for (index, message) in messages.iter().enumerate() {
        let is_first = index == 0;
        let is_last = index == messages.len() - 1 && prompt_override.is_none();

        let role = safe_str(message, &["role"]).unwrap_or_default();
        let content = safe_get(message, &["content"]).and_then(Value::as_str);

        let user_prompt = (role == "user").then_some(content).flatten();
        let assistant_response = if role == "assistant" {
            content
        } else if is_last {
            used_assistant_seed = true;
            options.seed_assistant_response.as_deref()
        } else {
            None
        };

        let converted = apply_model_template(
            &template,
            is_first.then_some(system_message.as_str()),
            user_prompt,
            assistant_response,
            is_last && used_assistant_seed,
        )
        .map_err(template_err)?;
        templated.push(converted);
    }

    // The last turn may have been an assistant message; open a fresh
    // assistant block so the model continues instead of replaying.
    if !used_assistant_seed && prompt_override.is_none() {
        templated.push(
            apply_model_template(
                &template,
                None,
                None,
                options.seed_assistant_response.as_deref(),
                true,
            )
            .map_err(template_err)?,
        );
    }

    if let Some(override_text) = prompt_override {
        if messages.is_empty() {
            templated = vec![apply_model_template(
                &template,
                Some(system_message.as_str()),
                Some(override_text),
                options.seed_assistant_response.as_deref(),
                true,
            )
            .map_err(template_err)?];
        } else {
            debug!(
                "appending retrieval override of {} chars to {} templated message(s)",
                override_text.len(),
                templated.len()
            );
            templated.push(
                apply_model_template(&template, None, Some(override_text), None, true)
                    .map_err(template_err)?,
            );
        }
    }

    let prompt_with_templating = templated.join("\n");

    let mut generate_body = chat_body.clone();
    if let Some(body) = generate_body.as_object_mut() {
        for unsupported in ["messages", "template", "system", "context"] {
            body.remove(unsupported);
        }
        body.insert("model".into(), json!(model.human_id));
        body.insert("prompt".into(), json!(prompt_with_templating));
        body.insert("raw".into(), json!(true));
        if !body.contains_key("stream") {
            body.insert("stream".into(), json!(true));
        }
        if body.get("options").is_some_and(Value::is_null) {
            body.remove("options");
        }
    }

    Ok(ConvertedRequest {
        prompt_with_templating,
        generate_body,
    })
}

fn template_err(err: TemplateError) -> GatewayError {
    GatewayError::TemplateMalformed(err.to_string())
}

/// Rewrites each `/api/generate` chunk `{response, …}` into the `/api/chat`
/// shape `{message: {role, content}, …}` so the client sees a wire-compatible
/// stream.
pub fn translate_generate_to_chat<S>(src: S) -> impl Stream<Item = JsonResult>
where
    S: Stream<Item = JsonResult>,
{
    src.map(|item| {
        item.map(|mut chunk| {
            if let Some(fields) = chunk.as_object_mut() {
                let content = fields
                    .remove("response")
                    .and_then(|response| response.as_str().map(str::to_string))
                    .unwrap_or_default();
                fields.insert(
                    "message".to_string(),
                    json!({
                        "content": content,
                        "role": "assistant",
                    }),
                );
            }
            chunk
        })
    })
}

/// Sends a fully-templated `/api/generate` body upstream, recording its own
/// InferenceEvent and audit row. The returned stream yields raw generate
/// chunks; finalisation happens after the last chunk (or on stream error).
pub async fn do_generate_raw_templated(
    upstream: &OllamaUpstream,
    history: Arc<HistoryStore>,
    audit: Arc<AuditStore>,
    model: &FoundationModelRow,
    generate_body: Value,
    reason: &str,
) -> Result<JsonStream, GatewayError> {
    let prompt = safe_str(&generate_body, &["prompt"]);
    let event_id = history.create_inference_event(model.id, reason, prompt)?;

    let mut audited_body = generate_body.clone();
    scrub_images(&mut audited_body);
    let audit_event = audit.begin_http_event("ollama:/api/generate", &audited_body);

    let byte_stream = match upstream.generate_stream(&generate_body).await {
        Ok(stream) => stream,
        Err(err) => {
            // The preliminary event stays as evidence of the failed call.
            history.finalize_inference_event(event_id, &json!({}), Some(&err.to_string()))?;
            return Err(err);
        }
    };

    let chunks = stream_bytes_to_json(byte_stream);
    let recorded = consolidate_and_call(
        chunks,
        ollama_response_consolidator,
        Value::Null,
        move |consolidated: Value, stream_err: Option<GatewayError>| async move {
            if stream_err.is_none() && !safe_get(&consolidated, &["done"]).and_then(Value::as_bool).unwrap_or(false) {
                warn!("/api/generate stream ended without done=true");
            }

            let error_text = stream_err.as_ref().map(ToString::to_string);
            history.finalize_inference_event(event_id, &consolidated, error_text.as_deref())?;

            if let Some(audit_event) = audit_event {
                audit.set_http_response(audit_event, &json!({"content": consolidated}));
            }

            match stream_err {
                Some(err) => Err(err),
                None => Ok(()),
            }
        },
    );

    Ok(Box::pin(recorded))
}
