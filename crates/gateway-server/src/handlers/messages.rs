//! CRUD over stored chat messages, with idempotent insert.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use gateway_core::{ChatMessage, MessageId};
use gateway_history::ChatMessageRow;

use crate::dto::MessageAddResponse;
use crate::error::AppError;
use crate::state::ServerState;

/// Existing content answers 200 with the existing id; new content answers
/// 201.
pub async fn post_message(
    State(state): State<Arc<ServerState>>,
    Json(message): Json<ChatMessage>,
) -> Result<(StatusCode, Json<MessageAddResponse>), AppError> {
    let (message_id, just_created) = state.history.create_message(&message)?;
    let status = if just_created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(MessageAddResponse {
            message_id,
            just_created,
        }),
    ))
}

pub async fn get_message(
    State(state): State<Arc<ServerState>>,
    Path(message_id): Path<MessageId>,
) -> Result<Json<ChatMessageRow>, AppError> {
    state
        .history
        .get_message(message_id)?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("message {message_id}")))
}
