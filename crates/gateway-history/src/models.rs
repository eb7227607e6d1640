//! Foundation-model records and provider records.
//!
//! Model identity is the four-tuple (human_id, provider_identifiers,
//! model_identifiers, combined_inference_parameters); identifier JSON is
//! stored canonically (sorted keys) so plain string equality works as a key.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;

use gateway_core::{GatewayError, InferenceEventId, ModelRecordId};

use crate::{json_from_sql, json_to_sql, store_err, ts_from_sql, ts_to_sql, HistoryStore};

#[derive(Debug, Clone, Serialize)]
pub struct FoundationModelRow {
    pub id: ModelRecordId,
    pub human_id: String,
    pub first_seen_at: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub provider_identifiers: String,
    pub model_identifiers: Option<Value>,
    pub combined_inference_parameters: Option<Value>,
}

/// An incoming model sighting, not yet matched against stored rows.
#[derive(Debug, Clone, Default)]
pub struct FoundationModelCandidate {
    pub human_id: String,
    pub provider_identifiers: String,
    pub model_identifiers: Option<Value>,
    pub combined_inference_parameters: Option<Value>,
    pub first_seen_at: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

const MODEL_COLUMNS: &str = "id, human_id, first_seen_at, last_seen, provider_identifiers, \
     model_identifiers, combined_inference_parameters";

fn model_from_row(row: &Row<'_>) -> rusqlite::Result<FoundationModelRow> {
    Ok(FoundationModelRow {
        id: row.get(0)?,
        human_id: row.get(1)?,
        first_seen_at: ts_from_sql(row.get(2)?),
        last_seen: ts_from_sql(row.get(3)?),
        provider_identifiers: row.get(4)?,
        model_identifiers: json_from_sql(row.get(5)?),
        combined_inference_parameters: json_from_sql(row.get(6)?),
    })
}

pub(crate) fn model_for_event_conn(
    conn: &Connection,
    event_id: InferenceEventId,
) -> rusqlite::Result<Option<FoundationModelRow>> {
    conn.query_row(
        "SELECT m.id, m.human_id, m.first_seen_at, m.last_seen, m.provider_identifiers,
                m.model_identifiers, m.combined_inference_parameters
         FROM FoundationModelRecords m
         JOIN InferenceEvents e ON e.model_record_id = m.id
         WHERE e.id = ?1",
        params![event_id],
        model_from_row,
    )
    .optional()
}

impl HistoryStore {
    pub fn get_foundation_model(
        &self,
        id: ModelRecordId,
    ) -> Result<Option<FoundationModelRow>, GatewayError> {
        self.lock()
            .query_row(
                &format!("SELECT {MODEL_COLUMNS} FROM FoundationModelRecords WHERE id = ?1"),
                params![id],
                model_from_row,
            )
            .optional()
            .map_err(store_err)
    }

    /// Most recently seen model for this provider under a display name.
    pub fn lookup_foundation_model(
        &self,
        human_id: &str,
        provider_identifiers: &str,
    ) -> Result<Option<FoundationModelRow>, GatewayError> {
        self.lock()
            .query_row(
                &format!(
                    "SELECT {MODEL_COLUMNS} FROM FoundationModelRecords
                     WHERE human_id = ?1 AND provider_identifiers = ?2
                     ORDER BY last_seen DESC LIMIT 1"
                ),
                params![human_id, provider_identifiers],
                model_from_row,
            )
            .optional()
            .map_err(store_err)
    }

    /// Exact match on all four identity fields. NULL never equals anything in
    /// SQL, so absent candidate fields are excluded from the comparison.
    pub fn lookup_foundation_model_detailed(
        &self,
        candidate: &FoundationModelCandidate,
    ) -> Result<Option<FoundationModelRow>, GatewayError> {
        self.lock()
            .query_row(
                &format!(
                    "SELECT {MODEL_COLUMNS} FROM FoundationModelRecords
                     WHERE human_id = ?1 AND provider_identifiers = ?2
                       AND (?3 IS NULL OR model_identifiers = ?3)
                       AND (?4 IS NULL OR combined_inference_parameters = ?4)
                     ORDER BY last_seen DESC LIMIT 1"
                ),
                params![
                    candidate.human_id,
                    candidate.provider_identifiers,
                    json_to_sql(candidate.model_identifiers.as_ref()),
                    json_to_sql(candidate.combined_inference_parameters.as_ref()),
                ],
                model_from_row,
            )
            .optional()
            .map_err(store_err)
    }

    /// A row previously created from `/api/tags` only: identifiers match and
    /// the inference parameters are still unfilled.
    pub fn lookup_tags_only_model(
        &self,
        human_id: &str,
        provider_identifiers: &str,
        model_identifiers: &Value,
    ) -> Result<Option<FoundationModelRow>, GatewayError> {
        self.lock()
            .query_row(
                &format!(
                    "SELECT {MODEL_COLUMNS} FROM FoundationModelRecords
                     WHERE human_id = ?1 AND provider_identifiers = ?2
                       AND model_identifiers = ?3
                       AND combined_inference_parameters IS NULL
                     ORDER BY last_seen DESC LIMIT 1"
                ),
                params![
                    human_id,
                    provider_identifiers,
                    json_to_sql(Some(model_identifiers)),
                ],
                model_from_row,
            )
            .optional()
            .map_err(store_err)
    }

    pub fn insert_foundation_model(
        &self,
        candidate: &FoundationModelCandidate,
    ) -> Result<FoundationModelRow, GatewayError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO FoundationModelRecords
                 (human_id, first_seen_at, last_seen, provider_identifiers,
                  model_identifiers, combined_inference_parameters)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                candidate.human_id,
                ts_to_sql(candidate.first_seen_at),
                ts_to_sql(candidate.last_seen),
                candidate.provider_identifiers,
                json_to_sql(candidate.model_identifiers.as_ref()),
                json_to_sql(candidate.combined_inference_parameters.as_ref()),
            ],
        )
        .map_err(store_err)?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_foundation_model(id)?
            .ok_or_else(|| GatewayError::StoreCommit("inserted model vanished".into()))
    }

    /// Widens the `[first_seen, last_seen]` window and fills nullable JSON
    /// fields from the candidate. Never narrows, never overwrites non-null
    /// JSON.
    pub fn merge_in_updates(
        &self,
        id: ModelRecordId,
        candidate: &FoundationModelCandidate,
    ) -> Result<FoundationModelRow, GatewayError> {
        let existing = self
            .get_foundation_model(id)?
            .ok_or_else(|| GatewayError::ModelNotFound(format!("model record {id}")))?;

        let first_seen_at = match (existing.first_seen_at, candidate.first_seen_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let last_seen = match (existing.last_seen, candidate.last_seen) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let model_identifiers = existing
            .model_identifiers
            .or_else(|| candidate.model_identifiers.clone());
        let combined_inference_parameters = existing
            .combined_inference_parameters
            .or_else(|| candidate.combined_inference_parameters.clone());

        self.lock()
            .execute(
                "UPDATE FoundationModelRecords
                 SET first_seen_at = ?2, last_seen = ?3,
                     model_identifiers = ?4, combined_inference_parameters = ?5
                 WHERE id = ?1",
                params![
                    id,
                    ts_to_sql(first_seen_at),
                    ts_to_sql(last_seen),
                    json_to_sql(model_identifiers.as_ref()),
                    json_to_sql(combined_inference_parameters.as_ref()),
                ],
            )
            .map_err(store_err)?;

        self.get_foundation_model(id)?
            .ok_or_else(|| GatewayError::StoreCommit("merged model vanished".into()))
    }

    /// Creates the provider row the first time a backend is contacted;
    /// effectively immutable afterwards.
    pub fn upsert_provider_record(
        &self,
        identifiers: &str,
        machine_info: Option<&Value>,
        human_info: Option<&str>,
    ) -> Result<(), GatewayError> {
        self.lock()
            .execute(
                "INSERT INTO ProviderRecords (identifiers, created_at, machine_info, human_info)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (identifiers) DO NOTHING",
                params![
                    identifiers,
                    Utc::now().to_rfc3339(),
                    json_to_sql(machine_info),
                    human_info,
                ],
            )
            .map_err(store_err)?;
        Ok(())
    }

    pub fn provider_record_exists(&self, identifiers: &str) -> Result<bool, GatewayError> {
        let found: Option<i64> = self
            .lock()
            .query_row(
                "SELECT 1 FROM ProviderRecords WHERE identifiers = ?1",
                params![identifiers],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        Ok(found.is_some())
    }
}
