//! Append-only audit trail of HTTP traffic, server ingress and upstream
//! egress both.
//!
//! Auditing is best-effort by contract: a commit failure is logged (and
//! retried once) but never breaks user-visible traffic. Streaming response
//! bodies are re-committed every few KB so a crash loses at most one window
//! of bytes.

use std::path::Path;
use std::sync::{Arc, Mutex};

use base64::Engine;
use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::{json, Value};
use tracing::warn;

use gateway_core::GatewayError;

mod capture;
mod scrubber;

pub use capture::wrap_streaming_body;
pub use scrubber::scrub_images;

/// Bytes of streamed response accumulated between audit re-commits.
pub const COMMIT_CADENCE_BYTES: usize = 4_096;

pub struct AuditStore {
    conn: Mutex<Connection>,
}

impl AuditStore {
    /// Opens (creating if missing) the audit database; WAL journal mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let conn = Connection::open(path).map_err(store_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(store_err)?;
        Self::from_connection(conn)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self, GatewayError> {
        Self::from_connection(Connection::open_in_memory().map_err(store_err)?)
    }

    fn from_connection(conn: Connection) -> Result<Self, GatewayError> {
        conn.execute_batch(SCHEMA).map_err(store_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `operation`, retrying once; on persistent failure the row is
    /// dropped with a warning.
    fn best_effort<T>(
        &self,
        what: &str,
        operation: impl Fn(&Connection) -> rusqlite::Result<T>,
    ) -> Option<T> {
        let conn = self.lock();
        match operation(&conn) {
            Ok(value) => Some(value),
            Err(first) => match operation(&conn) {
                Ok(value) => {
                    warn!("audit {what} succeeded on retry after: {first}");
                    Some(value)
                }
                Err(second) => {
                    warn!("audit {what} dropped after retry: {second}");
                    None
                }
            },
        }
    }

    /// Records the inbound half of a raw HTTP exchange. Committed before any
    /// upstream call begins.
    pub fn begin_raw_event(
        &self,
        request_url: &str,
        request_method: &str,
        request_headers: &Value,
        request_content: &[u8],
    ) -> Option<i64> {
        self.best_effort("raw request insert", |conn| {
            conn.execute(
                "INSERT INTO RawHttpEvents
                     (accessed_at, request_url, request_method, request_headers,
                      request_content, response_content)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Utc::now().to_rfc3339(),
                    request_url,
                    request_method,
                    request_headers.to_string(),
                    request_content,
                    b"[not read yet]".as_slice(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Fills the response status/headers once the upstream answers.
    pub fn set_raw_response_meta(&self, event_id: i64, status_code: u16, headers: &Value) {
        let _ = self.best_effort("raw response meta", |conn| {
            conn.execute(
                "UPDATE RawHttpEvents
                 SET response_status_code = ?2, response_headers = ?3
                 WHERE id = ?1",
                params![event_id, i64::from(status_code), headers.to_string()],
            )
        });
    }

    /// Re-commits the accumulated (newline-delimited) response bytes.
    pub fn set_raw_response_content(&self, event_id: i64, content: &[u8]) {
        let _ = self.best_effort("raw response content", |conn| {
            conn.execute(
                "UPDATE RawHttpEvents SET response_content = ?2 WHERE id = ?1",
                params![event_id, content],
            )
        });
    }

    /// Records the request half of a JSON-level upstream exchange.
    pub fn begin_http_event(&self, api_bucket: &str, request: &Value) -> Option<i64> {
        let request = json!({
            "content": request,
        });
        self.best_effort("http event insert", |conn| {
            conn.execute(
                "INSERT INTO HttpEvents (accessed_at, api_bucket, request, response)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    Utc::now().to_rfc3339(),
                    api_bucket,
                    request.to_string(),
                    json!({"content": "[not recorded yet/interrupted during processing]"})
                        .to_string(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Replaces the response half of a JSON-level exchange; called once per
    /// commit window and once at stream end.
    pub fn set_http_response(&self, event_id: i64, response: &Value) {
        let _ = self.best_effort("http event response", |conn| {
            conn.execute(
                "UPDATE HttpEvents SET response = ?2 WHERE id = ?1",
                params![event_id, response.to_string()],
            )
        });
    }

    #[doc(hidden)]
    pub fn raw_response_content_for_test(&self, event_id: i64) -> Option<Vec<u8>> {
        self.lock()
            .query_row(
                "SELECT response_content FROM RawHttpEvents WHERE id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .ok()
    }
}

/// Shared handle used by streaming wrappers.
pub type SharedAuditStore = Arc<AuditStore>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS HttpEvents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    accessed_at TEXT NOT NULL,
    api_bucket TEXT,
    request TEXT,
    response TEXT
);
CREATE TABLE IF NOT EXISTS RawHttpEvents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    accessed_at TEXT NOT NULL,
    request_url TEXT NOT NULL,
    request_method TEXT NOT NULL,
    request_headers TEXT,
    request_content BLOB,
    response_status_code INTEGER,
    response_headers TEXT,
    response_content BLOB
);
";

fn store_err(err: rusqlite::Error) -> GatewayError {
    GatewayError::StoreCommit(err.to_string())
}

pub(crate) fn decoded_base64_len(encoded: &str) -> usize {
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map(|decoded| decoded.len())
        .unwrap_or(encoded.len())
}
