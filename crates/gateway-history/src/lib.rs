//! SQLite persistence for chat history: messages, branching sequences,
//! foundation-model records, provider records, and inference events.
//!
//! One writer at a time per connection; callers share the store behind an
//! `Arc` and every method locks the single connection for its duration.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use gateway_core::GatewayError;

mod events;
mod messages;
mod models;
mod sequences;

pub use events::InferenceEventRow;
pub use messages::ChatMessageRow;
pub use models::{FoundationModelCandidate, FoundationModelRow};
pub use sequences::{ChatSequenceRow, NewSequence};

/// Sentinel recorded on a fresh InferenceEvent so a crash mid-stream is
/// visible in the data instead of looking like a silent success.
pub const RESPONSE_PENDING: &str = "[haven't received/finalized response info yet]";

pub struct HistoryStore {
    conn: Mutex<Connection>,
}

impl HistoryStore {
    /// Opens (creating if missing) the history database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let conn = Connection::open(path).map_err(store_err)?;
        Self::from_connection(conn)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self, GatewayError> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, GatewayError> {
        conn.execute_batch(SCHEMA).map_err(store_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock means another thread panicked mid-statement; the
        // connection itself is still usable.
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS ChatMessages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT
);
CREATE TABLE IF NOT EXISTS ChatSequences (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    human_desc TEXT,
    user_pinned INTEGER NOT NULL DEFAULT 0,
    current_message INTEGER NOT NULL REFERENCES ChatMessages(id),
    parent_sequence INTEGER REFERENCES ChatSequences(id),
    generated_at TEXT,
    generation_complete INTEGER NOT NULL DEFAULT 0,
    inference_job_id INTEGER,
    inference_error TEXT
);
CREATE TABLE IF NOT EXISTS FoundationModelRecords (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    human_id TEXT NOT NULL,
    first_seen_at TEXT,
    last_seen TEXT,
    provider_identifiers TEXT NOT NULL,
    model_identifiers TEXT,
    combined_inference_parameters TEXT,
    UNIQUE (human_id, provider_identifiers, model_identifiers, combined_inference_parameters)
);
CREATE TABLE IF NOT EXISTS ProviderRecords (
    identifiers TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    machine_info TEXT,
    human_info TEXT
);
CREATE TABLE IF NOT EXISTS InferenceEvents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    model_record_id INTEGER NOT NULL REFERENCES FoundationModelRecords(id),
    prompt_tokens INTEGER,
    prompt_eval_time REAL,
    prompt_with_templating TEXT,
    response_created_at TEXT,
    response_tokens INTEGER,
    response_eval_time REAL,
    response_error TEXT,
    response_info TEXT,
    parent_sequence INTEGER,
    reason TEXT
);
";

pub(crate) fn store_err(err: rusqlite::Error) -> GatewayError {
    GatewayError::StoreCommit(err.to_string())
}

pub(crate) fn ts_to_sql(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(|t| t.to_rfc3339())
}

pub(crate) fn ts_from_sql(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    })
}

pub(crate) fn json_to_sql(v: Option<&serde_json::Value>) -> Option<String> {
    v.map(gateway_core::json::canonical_string)
}

pub(crate) fn json_from_sql(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|raw| serde_json::from_str(&raw).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::ChatMessage;

    #[test]
    fn reopening_the_database_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests-history.db");

        let message_id = {
            let store = HistoryStore::open(&path).unwrap();
            store.create_message(&ChatMessage::new("user", "persisted")).unwrap().0
        };

        let reopened = HistoryStore::open(&path).unwrap();
        let row = reopened.get_message(message_id).unwrap().unwrap();
        assert_eq!(row.content, "persisted");
    }
}
