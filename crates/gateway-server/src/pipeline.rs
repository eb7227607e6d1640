//! The continuation pipeline: one streaming response per request, composed
//! from capture, retrieval, templating, the upstream stream, and the
//! finalisation commit.
//!
//! The whole chain runs in a spawned task that writes into a channel; the
//! HTTP response body reads from the channel. A client disconnect only drops
//! the receiver, so inference and finalisation always run to completion.

use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use async_trait::async_trait;
use axum::response::Response;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use gateway_audit::scrub_images;
use gateway_core::json::{safe_get, safe_str};
use gateway_core::{ChatMessage, GatewayError, InferenceEventId};
use gateway_history::{ChatSequenceRow, FoundationModelRow};
use gateway_providers::{
    convert_chat_to_generate, do_generate_raw_templated, ollama_log_indexer,
    ollama_response_consolidator, translate_generate_to_chat, InferenceOptions, JsonStream,
};
use gateway_retrieval::{with_retrieval, GenerateHelper, RetrievalLabel};
use gateway_stream::{
    consolidate_and_yield, keepalive_wrapper, stream_bytes_to_json, tee_to_console_output,
    JsonResult, ServerStatusHolder,
};
use gateway_template::apply_model_template;

use crate::autoname::autoname_sequence;
use crate::error::AppError;
use crate::response::{ndjson_response, AUGMENTED_STREAM_STATUS};
use crate::state::ServerState;

/// A client-visible chunk at least this often, even while the upstream or
/// the retrieval sub-pipeline is silent.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(3);

/// Everything the pipeline needs to continue one conversation.
pub struct ContinuationInput {
    pub messages: Vec<ChatMessage>,
    pub original_sequence: ChatSequenceRow,
    pub model: FoundationModelRow,
    pub options: InferenceOptions,
    pub retrieval: RetrievalLabel,
    /// System message captured from an intercepted `/api/chat` list; takes
    /// precedence over every other source, empty included.
    pub requested_system_message: Option<String>,
    pub reason: String,
}

/// Runs the full PREPARE → RETRIEVE → TEMPLATE → STREAM → FINALISE pipeline,
/// returning the streaming HTTP response immediately.
pub async fn run_continuation(
    state: Arc<ServerState>,
    input: ContinuationInput,
) -> Result<Response, AppError> {
    let status = ServerStatusHolder::new(format!(
        "{}: preparing continuation",
        input.model.human_id
    ));
    let event_id =
        state
            .history
            .create_inference_event(input.model.id, &input.reason, None)?;

    let (tx, rx) = mpsc::channel::<JsonResult>(32);
    let model_human_id = input.model.human_id.clone();
    let driver_status = status.clone();
    tokio::spawn(async move {
        drive_continuation(state, input, event_id, driver_status, tx).await;
    });

    let chunks = keepalive_wrapper(
        model_human_id,
        ReceiverStream::new(rx),
        KEEPALIVE_PERIOD,
        status,
        true,
    );
    Ok(ndjson_response(AUGMENTED_STREAM_STATUS, chunks))
}

async fn drive_continuation(
    state: Arc<ServerState>,
    input: ContinuationInput,
    event_id: InferenceEventId,
    status: ServerStatusHolder,
    tx: mpsc::Sender<JsonResult>,
) {
    match build_chain(state.clone(), input, event_id, status).await {
        Ok(chain) => {
            let mut chain = pin!(chain);
            while let Some(item) = chain.next().await {
                // A failed send means the client went away; inference is
                // expensive, so keep draining to completion regardless.
                let _ = tx.send(item).await;
            }
        }
        Err(err) => {
            let _ = state.history.finalize_inference_event(
                event_id,
                &json!({}),
                Some(&err.to_string()),
            );
            let _ = tx.send(Err(err)).await;
        }
    }
}

async fn build_chain(
    state: Arc<ServerState>,
    input: ContinuationInput,
    event_id: InferenceEventId,
    status: ServerStatusHolder,
) -> Result<JsonStream, GatewayError> {
    let ContinuationInput {
        messages,
        original_sequence,
        model,
        options,
        retrieval,
        requested_system_message,
        ..
    } = input;

    // RETRIEVE: optional prompt augmentation, with its own sub-inferences.
    let helper = PipelineGenerateHelper {
        state: state.clone(),
        model: model.clone(),
        options: options.clone(),
    };
    let prompt_override = with_retrieval(
        &retrieval,
        &messages,
        &helper,
        state.knowledge.as_ref(),
        &status,
    )
    .await?;

    // TEMPLATE & FORWARD.
    let mut chat_body = json!({
        "model": model.human_id.clone(),
        "messages": &messages,
    });
    if let Some(request_options) = &options.request_options {
        chat_body["options"] = request_options.clone();
    }

    status.set(format!(
        "{}: forwarding {} message(s) to /api/generate",
        model.human_id,
        messages.len()
    ));

    let converted = convert_chat_to_generate(
        &chat_body,
        &model,
        &options,
        requested_system_message.as_deref(),
        prompt_override.as_deref(),
    );

    let (prompt_with_templating, upstream_chunks, audit_event): (String, JsonStream, Option<i64>) =
        match converted {
            Ok(converted) => {
                state
                    .history
                    .set_event_prompt(event_id, &converted.prompt_with_templating)?;

                let mut audited = converted.generate_body.clone();
                scrub_images(&mut audited);
                let audit_event = state
                    .audit
                    .begin_http_event("ollama:/api/generate", &audited);

                let bytes = state.upstream.generate_stream(&converted.generate_body).await?;
                let chunks = translate_generate_to_chat(stream_bytes_to_json(bytes));
                (
                    converted.prompt_with_templating,
                    Box::pin(chunks),
                    audit_event,
                )
            }
            Err(GatewayError::TemplateMalformed(detail)) => {
                // Forward the raw message list untouched; the upstream will
                // apply its own default template.
                warn!("template substitution failed ({detail}), forwarding raw /api/chat");
                let mut audited = chat_body.clone();
                scrub_images(&mut audited);
                let audit_event = state.audit.begin_http_event("ollama:/api/chat", &audited);

                let bytes = state.upstream.chat_stream(&chat_body).await?;
                (
                    String::new(),
                    Box::pin(stream_bytes_to_json(bytes)),
                    audit_event,
                )
            }
            Err(other) => return Err(other),
        };

    // STREAM: the stage order is load-bearing; each stage owns its upstream.
    let counted = update_status_stage(upstream_chunks, status.clone(), model.human_id.clone());
    let logged = tee_to_console_output(counted, ollama_log_indexer, 120);
    let with_prompt = prepend_prompt_text(logged, prompt_with_templating);
    let done_counter = Arc::new(AtomicUsize::new(0));
    let hidden = hide_done(with_prompt, done_counter.clone());

    let finalised = consolidate_and_yield(
        hidden,
        ollama_response_consolidator,
        Value::Null,
        move |consolidated, terminal_err| {
            append_response_chunk(
                state,
                original_sequence,
                model,
                options,
                messages,
                event_id,
                audit_event,
                done_counter,
                status,
                consolidated,
                terminal_err,
            )
        },
    );

    Ok(Box::pin(finalised))
}

/// Counts tokens and wall-clock on the status holder, stamping each chunk
/// with the current status line.
fn update_status_stage<S>(
    src: S,
    status: ServerStatusHolder,
    model_human_id: String,
) -> impl Stream<Item = JsonResult>
where
    S: Stream<Item = JsonResult>,
{
    stream! {
        let mut response_tokens = 0u64;
        let mut started: Option<Instant> = None;
        let mut src = pin!(src);

        while let Some(item) = src.next().await {
            match item {
                Ok(mut chunk) => {
                    let elapsed = started.get_or_insert_with(Instant::now).elapsed();
                    response_tokens += 1;
                    status.set(format!(
                        "{model_human_id}: {response_tokens} token(s) generated in {:.3} seconds",
                        elapsed.as_secs_f64()
                    ));
                    if let Some(fields) = chunk.as_object_mut() {
                        if !fields.contains_key("status") {
                            fields.insert("status".to_string(), json!(status.get()));
                        }
                    }
                    yield Ok(chunk);
                }
                Err(err) => yield Err(err),
            }
        }

        status.set(format!("{model_human_id}: done with inference"));
    }
}

/// First emitted element is a synthetic chunk carrying the exact prompt sent
/// upstream, so clients can inspect what the templating produced.
fn prepend_prompt_text<S>(src: S, prompt_with_templating: String) -> impl Stream<Item = JsonResult>
where
    S: Stream<Item = JsonResult>,
{
    stream! {
        if !prompt_with_templating.is_empty() {
            yield Ok(json!({"prompt_with_templating": prompt_with_templating}));
        }
        let mut src = pin!(src);
        while let Some(item) = src.next().await {
            yield item;
        }
    }
}

/// Rewrites the upstream's terminal `done:true` to `done:false` so the
/// finalisation chunk can still follow, remembering that it was seen.
fn hide_done<S>(src: S, done_counter: Arc<AtomicUsize>) -> impl Stream<Item = JsonResult>
where
    S: Stream<Item = JsonResult>,
{
    stream! {
        let mut src = pin!(src);
        while let Some(item) = src.next().await {
            match item {
                Ok(mut chunk) => {
                    if safe_get(&chunk, &["done"]).and_then(Value::as_bool).unwrap_or(false) {
                        done_counter.fetch_add(1, Ordering::SeqCst);
                        chunk["done"] = json!(false);
                        yield Ok(chunk);
                        continue;
                    }
                    if done_counter.load(Ordering::SeqCst) > 0 {
                        warn!("still yielding chunks after done=true");
                    }
                    yield Ok(chunk);
                }
                Err(err) => yield Err(err),
            }
        }

        if done_counter.load(Ordering::SeqCst) == 0 {
            warn!("finished streaming response without hitting done=true");
        }
    }
}

/// FINALISE: fill the event stats, commit the assistant message + child
/// sequence + pin transfer + back-patch in one store transaction, autoname a
/// pristine thread, and emit the terminal summary chunk.
#[allow(clippy::too_many_arguments)]
fn append_response_chunk(
    state: Arc<ServerState>,
    original_sequence: ChatSequenceRow,
    model: FoundationModelRow,
    options: InferenceOptions,
    messages: Vec<ChatMessage>,
    event_id: InferenceEventId,
    audit_event: Option<i64>,
    done_counter: Arc<AtomicUsize>,
    status: ServerStatusHolder,
    consolidated: Value,
    terminal_err: Option<GatewayError>,
) -> impl Stream<Item = JsonResult> {
    stream! {
        let stream_error_text = terminal_err.as_ref().map(ToString::to_string);
        if let Err(err) = state.history.finalize_inference_event(
            event_id,
            &consolidated,
            stream_error_text.as_deref(),
        ) {
            yield Err(err);
            return;
        }
        if let Some(audit_event) = audit_event {
            state
                .audit
                .set_http_response(audit_event, &json!({"content": consolidated.clone()}));
        }
        if let Some(err) = terminal_err {
            // The upstream died mid-stream: the event stands as evidence of
            // the failure; no ChatSequence is created.
            yield Err(err);
            return;
        }

        let seed = options.seed_assistant_response.clone().unwrap_or_default();
        let assistant_content = format!("{seed}{}", ollama_log_indexer(&consolidated));
        if assistant_content.is_empty() {
            yield Err(GatewayError::UpstreamStream(
                "assistant response was empty".into(),
            ));
            return;
        }

        let response_created_at = safe_str(&consolidated, &["created_at"])
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc));
        let generation_complete = done_counter.load(Ordering::SeqCst) > 0;

        let committed = state.history.commit_response_sequence(
            original_sequence.id,
            &assistant_content,
            response_created_at,
            event_id,
            generation_complete,
        );
        let (new_message_id, new_sequence_id) = match committed {
            Ok(ids) => ids,
            Err(err) => {
                status.set("failed to commit the response sequence");
                yield Err(err);
                return;
            }
        };

        // Autoname lazily: only threads that never got a title.
        let mut autoname = original_sequence.human_desc.clone();
        if autoname.is_none() {
            let mut with_response = messages.clone();
            with_response.push(ChatMessage::new("assistant", assistant_content.clone()));
            match autoname_sequence(&state, &with_response, &model, &status).await {
                Ok(name) if !name.is_empty() => {
                    info!("auto-generated chat title is {} chars: {name:?}", name.len());
                    if let Err(err) = state
                        .history
                        .set_sequence_description(new_sequence_id, &name)
                    {
                        warn!("failed to store autoname: {err}");
                    }
                    autoname = Some(name);
                }
                Ok(_) => {}
                Err(err) => warn!("autonaming failed, leaving the thread unnamed: {err}"),
            }
        }

        yield Ok(json!({
            "new_message_id": new_message_id,
            "new_sequence_id": new_sequence_id,
            "autoname": autoname,
            "done": true,
        }));
    }
}

/// The retrieval sub-pipeline's path back into inference: template one
/// prompt, run a non-streaming generate, and hand back the text.
struct PipelineGenerateHelper {
    state: Arc<ServerState>,
    model: FoundationModelRow,
    options: InferenceOptions,
}

#[async_trait]
impl GenerateHelper for PipelineGenerateHelper {
    async fn generate(
        &self,
        reason: &str,
        system_message: Option<&str>,
        user_prompt: &str,
        assistant_seed: Option<&str>,
    ) -> Result<String, GatewayError> {
        let model_parameters = self.model.combined_inference_parameters.as_ref();
        let template = self
            .options
            .override_model_template
            .clone()
            .or_else(|| {
                model_parameters
                    .and_then(|params| safe_str(params, &["template"]))
                    .map(str::to_string)
            })
            .unwrap_or_default();
        let system = system_message
            .map(str::to_string)
            .or_else(|| self.options.override_system_prompt.clone())
            .or_else(|| {
                model_parameters
                    .and_then(|params| safe_str(params, &["system"]))
                    .map(str::to_string)
            });

        let templated = if template.is_empty() {
            user_prompt.to_string()
        } else {
            apply_model_template(
                &template,
                system.as_deref(),
                Some(user_prompt),
                assistant_seed,
                true,
            )
            .map_err(|err| GatewayError::TemplateMalformed(err.to_string()))?
        };

        let body = json!({
            "model": self.model.human_id.clone(),
            "prompt": templated,
            "raw": false,
            "stream": false,
        });
        let chunks = do_generate_raw_templated(
            &self.state.upstream,
            self.state.history.clone(),
            self.state.audit.clone(),
            &self.model,
            body,
            reason,
        )
        .await?;

        let mut text = String::new();
        let mut chunks = pin!(chunks);
        while let Some(chunk) = chunks.next().await {
            text.push_str(&ollama_log_indexer(&chunk?));
        }
        Ok(text)
    }
}

/// Resolves which model continues a sequence: an explicit override, the
/// nearest ancestor's inference event, or a caller-supplied fallback.
pub fn select_continuation_model(
    state: &ServerState,
    sequence_id: Option<gateway_core::SequenceId>,
    requested_model_id: Option<gateway_core::ModelRecordId>,
    fallback_model_id: Option<gateway_core::ModelRecordId>,
) -> Result<FoundationModelRow, AppError> {
    if let Some(id) = requested_model_id {
        return state
            .history
            .get_foundation_model(id)?
            .ok_or_else(|| AppError::not_found(format!("model record {id}")));
    }

    if let Some(sequence_id) = sequence_id {
        if let Some(model) = state.history.model_for_sequence_chain(sequence_id)? {
            return Ok(model);
        }
    }

    if let Some(id) = fallback_model_id {
        return state
            .history
            .get_foundation_model(id)?
            .ok_or_else(|| AppError::not_found(format!("model record {id}")));
    }

    Err(AppError::Gateway(GatewayError::BadRequest(
        "couldn't find any model to continue with; pass continuation_model_id".into(),
    )))
}
