//! Request/response DTOs for the client-facing HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gateway_core::{ChatMessage, InferenceEventId, MessageId, ModelRecordId, SequenceId};
use gateway_history::ChatSequenceRow;

#[derive(Debug, Deserialize, Default)]
pub struct ContinueRequest {
    pub continuation_model_id: Option<ModelRecordId>,
    /// Used when neither the request nor the sequence history names a model.
    pub fallback_model_id: Option<ModelRecordId>,

    pub retrieval_policy: Option<String>,
    pub retrieval_search_args: Option<String>,
    pub preferred_embedding_model: Option<ModelRecordId>,
}

#[derive(Debug, Deserialize)]
pub struct ExtendRequest {
    pub next_message: ChatMessage,
    #[serde(flatten)]
    pub continuation: ContinueRequest,
}

#[derive(Debug, Deserialize)]
pub struct AutonameParams {
    pub preferred_autonaming_model: Option<ModelRecordId>,
    #[serde(default)]
    pub wait_for_response: bool,
}

#[derive(Debug, Serialize)]
pub struct MessageAddResponse {
    pub message_id: MessageId,
    pub just_created: bool,
}

#[derive(Debug, Deserialize)]
pub struct SequenceIn {
    pub current_message: MessageId,
    pub parent_sequence: Option<SequenceId>,
    #[serde(default)]
    pub human_desc: Option<String>,
    #[serde(default)]
    pub user_pinned: bool,
    #[serde(default)]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub generation_complete: bool,
    #[serde(default)]
    pub inference_job_id: Option<InferenceEventId>,
    #[serde(default)]
    pub inference_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SequenceAddResponse {
    pub sequence_id: SequenceId,
    pub just_created: bool,
}

#[derive(Debug, Serialize)]
pub struct SequenceDetailResponse {
    #[serde(flatten)]
    pub sequence: ChatSequenceRow,
    pub messages: Vec<ChatMessage>,
    pub inference_model_id: Option<ModelRecordId>,
}

#[derive(Debug, Deserialize)]
pub struct RecentSequencesParams {
    /// Maximum age in seconds for returned items.
    pub lookback: Option<f64>,
    /// Maximum number of items to return.
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct RecentSequencesResponse {
    pub sequence_ids: Vec<SequenceId>,
}
