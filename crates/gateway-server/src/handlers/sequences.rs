//! CRUD, continuation, and autonaming over chat sequences.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use gateway_core::{MessageId, SequenceId};
use gateway_history::NewSequence;
use gateway_providers::InferenceOptions;
use gateway_retrieval::{RetrievalLabel, RetrievalPolicy};
use gateway_stream::{keepalive_wrapper, ServerStatusHolder};

use crate::autoname::autoname_sequence;
use crate::dto::{
    AutonameParams, ContinueRequest, ExtendRequest, RecentSequencesParams,
    RecentSequencesResponse, SequenceAddResponse, SequenceDetailResponse, SequenceIn,
};
use crate::error::AppError;
use crate::pipeline::{run_continuation, select_continuation_model, ContinuationInput};
use crate::response::{ndjson_response, AUGMENTED_STREAM_STATUS};
use crate::state::ServerState;

/// Autoname streams update more slowly than inference; keep the cadence
/// under mobile screen-off timeouts anyway.
const AUTONAME_KEEPALIVE_PERIOD: Duration = Duration::from_millis(4_900);

fn retrieval_label(params: &ContinueRequest) -> Result<RetrievalLabel, AppError> {
    Ok(RetrievalLabel {
        policy: params
            .retrieval_policy
            .as_deref()
            .map(str::parse::<RetrievalPolicy>)
            .transpose()?
            .unwrap_or_default(),
        search_args: params.retrieval_search_args.clone(),
        preferred_embedding_model: params.preferred_embedding_model,
    })
}

pub async fn post_sequence(
    State(state): State<Arc<ServerState>>,
    Json(sequence_in): Json<SequenceIn>,
) -> Result<(StatusCode, Json<SequenceAddResponse>), AppError> {
    let (sequence_id, just_created) = state.history.create_sequence(&NewSequence {
        human_desc: sequence_in.human_desc,
        user_pinned: sequence_in.user_pinned,
        current_message: sequence_in.current_message,
        parent_sequence: sequence_in.parent_sequence,
        generated_at: sequence_in.generated_at,
        generation_complete: sequence_in.generation_complete,
        inference_job_id: sequence_in.inference_job_id,
        inference_error: sequence_in.inference_error,
    })?;

    let status = if just_created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(SequenceAddResponse {
            sequence_id,
            just_created,
        }),
    ))
}

pub async fn get_sequence(
    State(state): State<Arc<ServerState>>,
    Path(sequence_id): Path<SequenceId>,
) -> Result<Json<SequenceDetailResponse>, AppError> {
    let sequence = state
        .history
        .get_sequence(sequence_id)?
        .ok_or_else(|| AppError::not_found(format!("sequence {sequence_id}")))?;

    let messages = state.history.messages_for_sequence(sequence_id, true)?;
    let inference_model_id = state
        .history
        .model_for_sequence_chain(sequence_id)?
        .map(|model| model.id);

    Ok(Json(SequenceDetailResponse {
        sequence,
        messages,
        inference_model_id,
    }))
}

pub async fn recent_ids(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<RecentSequencesParams>,
) -> Result<Json<RecentSequencesResponse>, AppError> {
    let sequence_ids = state
        .history
        .recent_sequence_ids(params.lookback, params.limit)?;
    Ok(Json(RecentSequencesResponse { sequence_ids }))
}

/// Stacks an existing message onto a sequence without running inference.
pub async fn add_message(
    State(state): State<Arc<ServerState>>,
    Path((sequence_id, message_id)): Path<(SequenceId, MessageId)>,
) -> Result<Json<serde_json::Value>, AppError> {
    state
        .history
        .get_message(message_id)?
        .ok_or_else(|| AppError::not_found(format!("message {message_id}")))?;
    let node = state.history.extend_sequence(sequence_id, message_id)?;
    Ok(Json(json!({"sequence_id": node.id})))
}

/// Continue a stored sequence: the full-history front-end of the pipeline.
pub async fn continue_sequence(
    State(state): State<Arc<ServerState>>,
    Path(sequence_id): Path<SequenceId>,
    body: Bytes,
) -> Result<Response, AppError> {
    // The request body is optional; an empty POST continues with defaults.
    let params: ContinueRequest = if body.is_empty() {
        ContinueRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|err| {
            gateway_core::GatewayError::BadRequest(format!("bad continue request: {err}"))
        })?
    };

    let original_sequence = state
        .history
        .get_sequence(sequence_id)?
        .ok_or_else(|| AppError::not_found(format!("sequence {sequence_id}")))?;
    let messages = state.history.messages_for_sequence(sequence_id, false)?;
    let model = select_continuation_model(
        &state,
        Some(sequence_id),
        params.continuation_model_id,
        params.fallback_model_id,
    )?;

    let retrieval = retrieval_label(&params)?;
    let reason = if retrieval.policy == RetrievalPolicy::Skip {
        "chat sequence"
    } else {
        "prompt+rag"
    };

    run_continuation(
        state,
        ContinuationInput {
            messages,
            original_sequence,
            model,
            options: InferenceOptions::default(),
            retrieval,
            requested_system_message: None,
            reason: reason.to_string(),
        },
    )
    .await
}

/// Append a user message, then continue; same streaming contract.
pub async fn extend_sequence(
    State(state): State<Arc<ServerState>>,
    Path(sequence_id): Path<SequenceId>,
    Json(request): Json<ExtendRequest>,
) -> Result<Response, AppError> {
    state
        .history
        .get_sequence(sequence_id)?
        .ok_or_else(|| AppError::not_found(format!("sequence {sequence_id}")))?;

    let (message_id, _) = state.history.create_message(&request.next_message)?;
    let user_sequence = state.history.extend_sequence(sequence_id, message_id)?;

    let messages = state.history.messages_for_sequence(user_sequence.id, false)?;
    let model = select_continuation_model(
        &state,
        Some(user_sequence.id),
        request.continuation.continuation_model_id,
        request.continuation.fallback_model_id,
    )?;

    let retrieval = retrieval_label(&request.continuation)?;
    let reason = if retrieval.policy == RetrievalPolicy::Skip {
        "chat sequence"
    } else {
        "prompt+rag"
    };

    run_continuation(
        state,
        ContinuationInput {
            messages,
            original_sequence: user_sequence,
            model,
            options: InferenceOptions::default(),
            retrieval,
            requested_system_message: None,
            reason: reason.to_string(),
        },
    )
    .await
}

/// Trigger autonaming for one sequence, streaming or fire-and-forget.
pub async fn autoname_sequence_route(
    State(state): State<Arc<ServerState>>,
    Path(sequence_id): Path<SequenceId>,
    Query(params): Query<AutonameParams>,
) -> Result<Response, AppError> {
    let sequence = state
        .history
        .get_sequence(sequence_id)?
        .ok_or_else(|| AppError::not_found(format!("sequence {sequence_id}")))?;
    let model = select_continuation_model(
        &state,
        Some(sequence_id),
        params.preferred_autonaming_model,
        None,
    )?;
    let messages = state.history.messages_for_sequence(sequence_id, false)?;

    let status = ServerStatusHolder::new(format!("/sequences/{sequence_id}/autoname: setting up"));
    let model_human_id = model.human_id.clone();

    if params.wait_for_response {
        let (tx, rx) = mpsc::channel(4);
        let task_status = status.clone();
        tokio::spawn(async move {
            let autoname =
                do_autoname(state, sequence.id, &messages, &model, &task_status).await;
            let _ = tx
                .send(Ok(json!({"autoname": autoname, "done": true})))
                .await;
        });

        let chunks = keepalive_wrapper(
            model_human_id,
            ReceiverStream::new(rx),
            AUTONAME_KEEPALIVE_PERIOD,
            status,
            true,
        );
        Ok(ndjson_response(AUGMENTED_STREAM_STATUS, chunks))
    } else {
        tokio::spawn(async move {
            do_autoname(state, sequence.id, &messages, &model, &status).await;
        });
        Ok(StatusCode::ACCEPTED.into_response())
    }
}

async fn do_autoname(
    state: Arc<ServerState>,
    sequence_id: SequenceId,
    messages: &[gateway_core::ChatMessage],
    model: &gateway_history::FoundationModelRow,
    status: &ServerStatusHolder,
) -> Option<String> {
    match autoname_sequence(&state, messages, model, status).await {
        Ok(name) if !name.is_empty() => {
            if let Err(err) = state.history.set_sequence_description(sequence_id, &name) {
                warn!("failed to store autoname for sequence {sequence_id}: {err}");
            }
            status.set(format!(
                "done autonaming, chat title is {} chars",
                name.len()
            ));
            Some(name)
        }
        Ok(_) => {
            status.set("failed autonaming, chat title is unchanged");
            None
        }
        Err(err) => {
            warn!("autonaming sequence {sequence_id} failed: {err}");
            status.set("failed autonaming, chat title is unchanged");
            None
        }
    }
}
