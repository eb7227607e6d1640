//! The transparent Ollama proxy surface: `/ollama-proxy/*`.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use gateway_core::json::safe_str;
use gateway_core::{ChatMessage, GatewayError};
use gateway_providers::{do_generate_raw_templated, reconcile_api_show, reconcile_api_tags, InferenceOptions};
use gateway_retrieval::{RetrievalLabel, RetrievalPolicy};
use gateway_stream::stream_bytes_to_json;

use crate::capture::capture_chat_messages;
use crate::error::AppError;
use crate::pipeline::{run_continuation, ContinuationInput};
use crate::response::ndjson_response;
use crate::state::ServerState;

fn parse_body(body: &Bytes) -> Result<Value, AppError> {
    serde_json::from_slice(body)
        .map_err(|err| GatewayError::BadRequest(format!("request body is not JSON: {err}")).into())
}

fn retrieval_label_from_body(state: &ServerState, body: &Value) -> Result<RetrievalLabel, AppError> {
    let mut policy = safe_str(body, &["retrieval_policy"])
        .map(str::parse::<RetrievalPolicy>)
        .transpose()?;
    if policy.is_none() && state.force_ollama_rag {
        policy = Some(RetrievalPolicy::Simple);
    }

    Ok(RetrievalLabel {
        policy: policy.unwrap_or_default(),
        search_args: safe_str(body, &["retrieval_search_args"]).map(str::to_string),
        preferred_embedding_model: body
            .get("preferred_embedding_model")
            .and_then(Value::as_i64),
    })
}

/// Transparent Ollama chat: captures the resent history into the sequence
/// DAG, optionally injects retrieval context, and streams back Ollama-shaped
/// chunks plus the gateway's terminal summary chunk.
pub async fn api_chat(
    State(state): State<Arc<ServerState>>,
    body: Bytes,
) -> Result<Response, AppError> {
    let body = parse_body(&body)?;

    let raw_messages = body
        .get("messages")
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| GatewayError::BadRequest("no 'messages' provided".into()))?;
    let human_id = safe_str(&body, &["model"])
        .ok_or_else(|| GatewayError::BadRequest("no 'model' provided".into()))?;

    let (prior_sequence, captured_system) =
        capture_chat_messages(&state.history, &raw_messages)?;
    let original_sequence = prior_sequence
        .ok_or_else(|| GatewayError::BadRequest("empty message list".into()))?;

    let model = state
        .history
        .lookup_foundation_model(human_id, &state.upstream.identifiers())?
        .ok_or_else(|| {
            GatewayError::ModelNotFound(format!(
                "{human_id}: GET /ollama-proxy/api/tags to reconcile models first"
            ))
        })?;

    let messages: Vec<ChatMessage> = raw_messages
        .iter()
        .map(|raw| {
            ChatMessage::new(
                safe_str(raw, &["role"]).unwrap_or_default(),
                raw.get("content").and_then(Value::as_str).unwrap_or_default(),
            )
        })
        .collect();

    let retrieval = retrieval_label_from_body(&state, &body)?;
    let reason = if retrieval.policy == RetrievalPolicy::Skip {
        "chat sequence"
    } else {
        "prompt+rag"
    };

    let options = InferenceOptions {
        request_options: body.get("options").cloned().filter(|v| !v.is_null()),
        ..Default::default()
    };

    run_continuation(
        state,
        ContinuationInput {
            messages,
            original_sequence,
            model,
            options,
            retrieval,
            requested_system_message: captured_system,
            reason: reason.to_string(),
        },
    )
    .await
}

/// Passthrough to upstream `/api/generate`, audited, with its own
/// InferenceEvent when the model is known.
pub async fn api_generate(
    State(state): State<Arc<ServerState>>,
    body: Bytes,
) -> Result<Response, AppError> {
    let body = parse_body(&body)?;

    let model = match safe_str(&body, &["model"]) {
        Some(human_id) => state
            .history
            .lookup_foundation_model(human_id, &state.upstream.identifiers())?,
        None => None,
    };

    match model {
        Some(model) => {
            let chunks = do_generate_raw_templated(
                &state.upstream,
                state.history.clone(),
                state.audit.clone(),
                &model,
                body,
                "prompt",
            )
            .await?;
            Ok(ndjson_response(200, chunks))
        }
        None => {
            // Unknown model: still forward, just without an event record.
            let bytes = state.upstream.generate_stream(&body).await?;
            Ok(ndjson_response(200, stream_bytes_to_json(bytes)))
        }
    }
}

/// Fetches upstream models and reconciles them into the history store.
pub async fn api_tags(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Value>, AppError> {
    let audit_event = state.audit.begin_http_event("ollama:/api/tags", &json!({}));
    let tags = state.upstream.api_tags().await?;
    if let Some(audit_event) = audit_event {
        state
            .audit
            .set_http_response(audit_event, &json!({"content": tags.clone()}));
    }

    state.history.upsert_provider_record(
        &state.upstream.identifiers(),
        Some(&state.upstream.machine_info()),
        Some(&format!("ollama at {}", state.upstream.base_url())),
    )?;
    reconcile_api_tags(&state.history, &state.upstream.identifiers(), Utc::now(), &tags)?;

    Ok(Json(tags))
}

/// Fetches one model's parameters and reconciles them.
pub async fn api_show(
    State(state): State<Arc<ServerState>>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let body = parse_body(&body)?;
    let name = safe_str(&body, &["name"])
        .ok_or_else(|| GatewayError::BadRequest("no 'name' provided".into()))?;

    let audit_event = state
        .audit
        .begin_http_event("ollama:/api/show", &json!({"name": name}));
    let show = state.upstream.api_show(name).await?;
    if let Some(audit_event) = audit_event {
        state
            .audit
            .set_http_response(audit_event, &json!({"content": show.clone()}));
    }

    reconcile_api_show(
        &state.history,
        &state.upstream.identifiers(),
        name,
        Utc::now(),
        &show,
    )?;

    Ok(Json(show))
}

/// Transparent HEAD passthrough, no audit.
pub async fn head_passthrough(
    State(state): State<Arc<ServerState>>,
    Path(rest): Path<String>,
) -> Result<Response, AppError> {
    let status = state.upstream.forward_head(&format!("/{rest}")).await?;
    Ok(Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY))
        .body(Body::empty())
        .unwrap_or_else(|_| Response::new(Body::empty())))
}
