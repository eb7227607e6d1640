//! Inference events: the durable record of one upstream model invocation.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;

use gateway_core::json::safe_get;
use gateway_core::{GatewayError, InferenceEventId, ModelRecordId, SequenceId};

use crate::RESPONSE_PENDING;
use crate::{json_from_sql, json_to_sql, store_err, ts_from_sql, HistoryStore};

#[derive(Debug, Clone, Serialize)]
pub struct InferenceEventRow {
    pub id: InferenceEventId,
    pub model_record_id: ModelRecordId,
    pub prompt_tokens: Option<i64>,
    pub prompt_eval_time: Option<f64>,
    pub prompt_with_templating: Option<String>,
    pub response_created_at: Option<DateTime<Utc>>,
    pub response_tokens: Option<i64>,
    pub response_eval_time: Option<f64>,
    pub response_error: Option<String>,
    pub response_info: Option<Value>,
    pub parent_sequence: Option<SequenceId>,
    pub reason: Option<String>,
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<InferenceEventRow> {
    Ok(InferenceEventRow {
        id: row.get(0)?,
        model_record_id: row.get(1)?,
        prompt_tokens: row.get(2)?,
        prompt_eval_time: row.get(3)?,
        prompt_with_templating: row.get(4)?,
        response_created_at: ts_from_sql(row.get(5)?),
        response_tokens: row.get(6)?,
        response_eval_time: row.get(7)?,
        response_error: row.get(8)?,
        response_info: json_from_sql(row.get(9)?),
        parent_sequence: row.get(10)?,
        reason: row.get(11)?,
    })
}

impl HistoryStore {
    /// Creates the preliminary event before any bytes arrive, so a crash
    /// mid-stream leaves a visible, reproducible record.
    pub fn create_inference_event(
        &self,
        model_record_id: ModelRecordId,
        reason: &str,
        prompt_with_templating: Option<&str>,
    ) -> Result<InferenceEventId, GatewayError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO InferenceEvents
                 (model_record_id, prompt_with_templating, response_created_at,
                  response_error, reason)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                model_record_id,
                prompt_with_templating,
                Utc::now().to_rfc3339(),
                RESPONSE_PENDING,
                reason,
            ],
        )
        .map_err(store_err)?;
        Ok(conn.last_insert_rowid())
    }

    /// Stores the templated prompt on an already-created event.
    pub fn set_event_prompt(
        &self,
        id: InferenceEventId,
        prompt_with_templating: &str,
    ) -> Result<(), GatewayError> {
        self.lock()
            .execute(
                "UPDATE InferenceEvents SET prompt_with_templating = ?2 WHERE id = ?1",
                params![id, prompt_with_templating],
            )
            .map_err(store_err)?;
        Ok(())
    }

    /// Fills the event's stats from a consolidated upstream response.
    ///
    /// `response_error` becomes NULL on success; a `stream_error` (network
    /// drop mid-stream) or an upstream `error` field is recorded instead.
    /// Ollama's embedding-context vector is dropped from `response_info`.
    pub fn finalize_inference_event(
        &self,
        id: InferenceEventId,
        consolidated: &Value,
        stream_error: Option<&str>,
    ) -> Result<(), GatewayError> {
        let prompt_tokens = safe_get(consolidated, &["prompt_eval_count"]).and_then(Value::as_i64);
        let prompt_eval_time = safe_get(consolidated, &["prompt_eval_duration"])
            .and_then(Value::as_f64)
            .map(|ns| ns / 1e9);
        let response_tokens = safe_get(consolidated, &["eval_count"]).and_then(Value::as_i64);
        let response_eval_time = safe_get(consolidated, &["eval_duration"])
            .and_then(Value::as_f64)
            .map(|ns| ns / 1e9);
        let response_created_at = safe_get(consolidated, &["created_at"])
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let response_error = safe_get(consolidated, &["error"])
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| stream_error.map(str::to_string));

        let mut response_info = consolidated.clone();
        if let Some(info) = response_info.as_object_mut() {
            info.remove("context");
        }

        self.lock()
            .execute(
                "UPDATE InferenceEvents
                 SET prompt_tokens = ?2, prompt_eval_time = ?3,
                     response_created_at = ?4, response_tokens = ?5,
                     response_eval_time = ?6, response_error = ?7, response_info = ?8
                 WHERE id = ?1",
                params![
                    id,
                    prompt_tokens,
                    prompt_eval_time,
                    response_created_at.to_rfc3339(),
                    response_tokens,
                    response_eval_time,
                    response_error,
                    json_to_sql(Some(&response_info)),
                ],
            )
            .map_err(store_err)?;
        Ok(())
    }

    pub fn get_inference_event(
        &self,
        id: InferenceEventId,
    ) -> Result<Option<InferenceEventRow>, GatewayError> {
        self.lock()
            .query_row(
                "SELECT id, model_record_id, prompt_tokens, prompt_eval_time,
                        prompt_with_templating, response_created_at, response_tokens,
                        response_eval_time, response_error, response_info,
                        parent_sequence, reason
                 FROM InferenceEvents WHERE id = ?1",
                params![id],
                event_from_row,
            )
            .optional()
            .map_err(store_err)
    }
}
