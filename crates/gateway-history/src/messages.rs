//! Chat message rows: idempotent insert and lookup.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use gateway_core::{ChatMessage, GatewayError, MessageId};

use crate::{store_err, ts_from_sql, ts_to_sql, HistoryStore};

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessageRow {
    pub id: MessageId,
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl ChatMessageRow {
    pub fn as_chat_message(&self) -> ChatMessage {
        ChatMessage {
            role: self.role.clone(),
            content: self.content.clone(),
            created_at: self.created_at,
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            role: row.get(1)?,
            content: row.get(2)?,
            created_at: ts_from_sql(row.get(3)?),
        })
    }
}

impl HistoryStore {
    /// Finds the newest message with this role and content.
    ///
    /// Third-party clients resend the whole history on every turn, so content
    /// equality is the dedup key; `created_at` is display metadata.
    pub fn lookup_message(
        &self,
        role: &str,
        content: &str,
    ) -> Result<Option<MessageId>, GatewayError> {
        self.lock()
            .query_row(
                "SELECT id FROM ChatMessages WHERE role = ?1 AND content = ?2
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                params![role, content],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)
    }

    /// Inserts a message, reusing an existing identical one.
    ///
    /// Returns the id plus whether a new row was created.
    pub fn create_message(
        &self,
        message: &ChatMessage,
    ) -> Result<(MessageId, bool), GatewayError> {
        if let Some(existing) = self.lookup_message(&message.role, &message.content)? {
            return Ok((existing, false));
        }

        let created_at = message.created_at.or_else(|| Some(Utc::now()));
        let conn = self.lock();
        conn.execute(
            "INSERT INTO ChatMessages (role, content, created_at) VALUES (?1, ?2, ?3)",
            params![message.role, message.content, ts_to_sql(created_at)],
        )
        .map_err(store_err)?;
        Ok((conn.last_insert_rowid(), true))
    }

    pub fn get_message(&self, id: MessageId) -> Result<Option<ChatMessageRow>, GatewayError> {
        self.lock()
            .query_row(
                "SELECT id, role, content, created_at FROM ChatMessages WHERE id = ?1",
                params![id],
                ChatMessageRow::from_row,
            )
            .optional()
            .map_err(store_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_insert_returns_existing_id() {
        let store = HistoryStore::open_in_memory().unwrap();
        let message = ChatMessage::new("user", "hello");

        let (first_id, just_created) = store.create_message(&message).unwrap();
        assert!(just_created);

        let (second_id, just_created) = store.create_message(&message).unwrap();
        assert!(!just_created);
        assert_eq!(first_id, second_id);
    }

    #[test]
    fn different_roles_are_distinct_messages() {
        let store = HistoryStore::open_in_memory().unwrap();
        let (a, _) = store.create_message(&ChatMessage::new("user", "hello")).unwrap();
        let (b, _) = store
            .create_message(&ChatMessage::new("assistant", "hello"))
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn missing_created_at_is_filled_on_insert() {
        let store = HistoryStore::open_in_memory().unwrap();
        let (id, _) = store.create_message(&ChatMessage::new("user", "hi")).unwrap();
        let row = store.get_message(id).unwrap().unwrap();
        assert!(row.created_at.is_some());
    }
}
