//! Chat sequence nodes: a branching linked list over messages.
//!
//! Pinning marks the node a client should treat as the live leaf of a
//! thread; committing a new node always transfers the pin in the same
//! transaction so at most one node along a chain stays pinned.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use gateway_core::{ChatMessage, GatewayError, InferenceEventId, MessageId, SequenceId};

use crate::models::model_for_event_conn;
use crate::{store_err, ts_from_sql, ts_to_sql, HistoryStore};

#[derive(Debug, Clone, Serialize)]
pub struct ChatSequenceRow {
    pub id: SequenceId,
    pub human_desc: Option<String>,
    pub user_pinned: bool,
    pub current_message: MessageId,
    pub parent_sequence: Option<SequenceId>,
    pub generated_at: Option<DateTime<Utc>>,
    pub generation_complete: bool,
    pub inference_job_id: Option<InferenceEventId>,
    pub inference_error: Option<String>,
}

/// Insert parameters for a sequence node.
#[derive(Debug, Clone, Default)]
pub struct NewSequence {
    pub human_desc: Option<String>,
    pub user_pinned: bool,
    pub current_message: MessageId,
    pub parent_sequence: Option<SequenceId>,
    pub generated_at: Option<DateTime<Utc>>,
    pub generation_complete: bool,
    pub inference_job_id: Option<InferenceEventId>,
    pub inference_error: Option<String>,
}

fn sequence_from_row(row: &Row<'_>) -> rusqlite::Result<ChatSequenceRow> {
    Ok(ChatSequenceRow {
        id: row.get(0)?,
        human_desc: row.get(1)?,
        user_pinned: row.get::<_, i64>(2)? != 0,
        current_message: row.get(3)?,
        parent_sequence: row.get(4)?,
        generated_at: ts_from_sql(row.get(5)?),
        generation_complete: row.get::<_, i64>(6)? != 0,
        inference_job_id: row.get(7)?,
        inference_error: row.get(8)?,
    })
}

const SEQUENCE_COLUMNS: &str = "id, human_desc, user_pinned, current_message, parent_sequence, \
     generated_at, generation_complete, inference_job_id, inference_error";

pub(crate) fn get_sequence_conn(
    conn: &Connection,
    id: SequenceId,
) -> rusqlite::Result<Option<ChatSequenceRow>> {
    conn.query_row(
        &format!("SELECT {SEQUENCE_COLUMNS} FROM ChatSequences WHERE id = ?1"),
        params![id],
        sequence_from_row,
    )
    .optional()
}

/// Walks from `leaf` to the root. The parent chain only ever references
/// already-committed rows, so this cannot cycle.
pub(crate) fn parents_conn(
    conn: &Connection,
    leaf: SequenceId,
) -> rusqlite::Result<Vec<ChatSequenceRow>> {
    let mut chain = Vec::new();
    let mut cursor = Some(leaf);
    while let Some(id) = cursor {
        match get_sequence_conn(conn, id)? {
            Some(sequence) => {
                cursor = sequence.parent_sequence;
                chain.push(sequence);
            }
            None => break,
        }
    }
    Ok(chain)
}

fn insert_sequence_conn(conn: &Connection, new: &NewSequence) -> rusqlite::Result<SequenceId> {
    conn.execute(
        "INSERT INTO ChatSequences (human_desc, user_pinned, current_message, parent_sequence,
             generated_at, generation_complete, inference_job_id, inference_error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            new.human_desc,
            new.user_pinned as i64,
            new.current_message,
            new.parent_sequence,
            ts_to_sql(new.generated_at),
            new.generation_complete as i64,
            new.inference_job_id,
            new.inference_error,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl HistoryStore {
    pub fn get_sequence(&self, id: SequenceId) -> Result<Option<ChatSequenceRow>, GatewayError> {
        get_sequence_conn(&self.lock(), id).map_err(store_err)
    }

    /// Inserts a sequence node, reusing an existing node with the same
    /// (current_message, parent_sequence). Returns the id plus whether a new
    /// row was created.
    pub fn create_sequence(&self, new: &NewSequence) -> Result<(SequenceId, bool), GatewayError> {
        let conn = self.lock();
        let existing: Option<SequenceId> = conn
            .query_row(
                "SELECT id FROM ChatSequences
                 WHERE current_message = ?1 AND parent_sequence IS ?2
                 LIMIT 1",
                params![new.current_message, new.parent_sequence],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        if let Some(id) = existing {
            return Ok((id, false));
        }

        let id = insert_sequence_conn(&conn, new).map_err(store_err)?;
        Ok((id, true))
    }

    /// Inserts a node unconditionally, bypassing the
    /// (current_message, parent_sequence) reuse check.
    pub fn append_sequence_node(&self, new: &NewSequence) -> Result<SequenceId, GatewayError> {
        insert_sequence_conn(&self.lock(), new).map_err(store_err)
    }

    /// Leaf-to-root walk from `leaf`.
    pub fn sequence_parents(&self, leaf: SequenceId) -> Result<Vec<ChatSequenceRow>, GatewayError> {
        parents_conn(&self.lock(), leaf).map_err(store_err)
    }

    /// Newest sequence node whose current message is `message_id`.
    pub fn latest_sequence_for_message(
        &self,
        message_id: MessageId,
    ) -> Result<Option<ChatSequenceRow>, GatewayError> {
        self.lock()
            .query_row(
                &format!(
                    "SELECT {SEQUENCE_COLUMNS} FROM ChatSequences
                     WHERE current_message = ?1
                     ORDER BY generated_at DESC, id DESC LIMIT 1"
                ),
                params![message_id],
                sequence_from_row,
            )
            .optional()
            .map_err(store_err)
    }

    /// Stacks an already-stored message onto a sequence, transferring the pin
    /// to the new node. No inference runs here.
    pub fn extend_sequence(
        &self,
        sequence_id: SequenceId,
        message_id: MessageId,
    ) -> Result<ChatSequenceRow, GatewayError> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(store_err)?;

        let original = get_sequence_conn(&tx, sequence_id)
            .map_err(store_err)?
            .ok_or_else(|| GatewayError::BadRequest(format!("no sequence {sequence_id}")))?;

        let new_id = insert_sequence_conn(
            &tx,
            &NewSequence {
                human_desc: original.human_desc.clone(),
                user_pinned: original.user_pinned,
                current_message: message_id,
                parent_sequence: Some(original.id),
                generated_at: Some(Utc::now()),
                generation_complete: true,
                ..Default::default()
            },
        )
        .map_err(store_err)?;
        tx.execute(
            "UPDATE ChatSequences SET user_pinned = 0 WHERE id = ?1",
            params![original.id],
        )
        .map_err(store_err)?;

        let row = get_sequence_conn(&tx, new_id)
            .map_err(store_err)?
            .ok_or_else(|| GatewayError::StoreCommit("inserted sequence vanished".into()))?;
        tx.commit().map_err(store_err)?;
        Ok(row)
    }

    pub fn set_sequence_description(
        &self,
        id: SequenceId,
        human_desc: &str,
    ) -> Result<(), GatewayError> {
        self.lock()
            .execute(
                "UPDATE ChatSequences SET human_desc = ?2 WHERE id = ?1",
                params![id, human_desc],
            )
            .map_err(store_err)?;
        Ok(())
    }

    pub fn recent_sequence_ids(
        &self,
        lookback_seconds: Option<f64>,
        limit: Option<u32>,
    ) -> Result<Vec<SequenceId>, GatewayError> {
        let cutoff = lookback_seconds
            .map(|secs| Utc::now() - Duration::milliseconds((secs * 1000.0) as i64));

        let conn = self.lock();
        let mut statement = conn
            .prepare(
                "SELECT id FROM ChatSequences
                 WHERE (?1 IS NULL OR generated_at > ?1)
                 ORDER BY generated_at DESC, id DESC
                 LIMIT ?2",
            )
            .map_err(store_err)?;
        let rows = statement
            .query_map(
                params![ts_to_sql(cutoff), limit.map(i64::from).unwrap_or(-1)],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(store_err)
    }

    /// Flat message list from root to leaf.
    ///
    /// With `include_model_info_diffs`, synthetic `role = "model config"`
    /// messages are interleaved wherever the foundation-model parameters
    /// changed between adjacent turns, plus one leading entry describing the
    /// first model seen.
    pub fn messages_for_sequence(
        &self,
        leaf: SequenceId,
        include_model_info_diffs: bool,
    ) -> Result<Vec<ChatMessage>, GatewayError> {
        let conn = self.lock();

        let mut collected: Vec<ChatMessage> = Vec::new();
        let mut last_seen_model: Option<crate::FoundationModelRow> = None;

        for sequence in parents_conn(&conn, leaf).map_err(store_err)? {
            let message: Option<(String, String, Option<String>)> = conn
                .query_row(
                    "SELECT role, content, created_at FROM ChatMessages WHERE id = ?1",
                    params![sequence.current_message],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
                .map_err(store_err)?;
            if let Some((role, content, created_at)) = message {
                collected.push(ChatMessage {
                    role,
                    content,
                    created_at: ts_from_sql(created_at),
                });
            }

            if let Some(event_id) = sequence.inference_job_id {
                let this_model = model_for_event_conn(&conn, event_id).map_err(store_err)?;
                if include_model_info_diffs {
                    if let (Some(previous), Some(current)) = (&last_seen_model, &this_model) {
                        if let Some(diff) = model_info_diff(previous, current) {
                            // Child-to-parent order here, so the diff lands
                            // just before the newer message after reversal.
                            collected.push(diff);
                        }
                    }
                }
                if this_model.is_some() {
                    last_seen_model = this_model;
                }
            }
        }

        if include_model_info_diffs {
            collected.push(initial_model_info(last_seen_model.as_ref()));
        }

        collected.reverse();
        Ok(collected)
    }

    /// Resolves the foundation model used by the nearest ancestor of `leaf`
    /// that has an inference event recorded.
    pub fn model_for_sequence_chain(
        &self,
        leaf: SequenceId,
    ) -> Result<Option<crate::FoundationModelRow>, GatewayError> {
        let conn = self.lock();
        for sequence in parents_conn(&conn, leaf).map_err(store_err)? {
            if let Some(event_id) = sequence.inference_job_id {
                if let Some(model) = model_for_event_conn(&conn, event_id).map_err(store_err)? {
                    return Ok(Some(model));
                }
            }
        }
        Ok(None)
    }

    /// The FINALISE commit: assistant message, child sequence with the pin
    /// transferred, and the InferenceEvent's `parent_sequence` back-patch,
    /// all in one transaction. A failure anywhere rolls the whole step back,
    /// leaving the already-finalised event as the only evidence.
    pub fn commit_response_sequence(
        &self,
        original_sequence_id: SequenceId,
        assistant_content: &str,
        response_created_at: Option<DateTime<Utc>>,
        inference_event_id: InferenceEventId,
        generation_complete: bool,
    ) -> Result<(MessageId, SequenceId), GatewayError> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(store_err)?;

        let original = get_sequence_conn(&tx, original_sequence_id)
            .map_err(store_err)?
            .ok_or_else(|| {
                GatewayError::StoreCommit(format!("no sequence {original_sequence_id}"))
            })?;

        tx.execute(
            "INSERT INTO ChatMessages (role, content, created_at) VALUES ('assistant', ?1, ?2)",
            params![assistant_content, ts_to_sql(response_created_at)],
        )
        .map_err(store_err)?;
        let message_id = tx.last_insert_rowid();

        let sequence_id = insert_sequence_conn(
            &tx,
            &NewSequence {
                human_desc: original.human_desc.clone(),
                user_pinned: true,
                current_message: message_id,
                parent_sequence: Some(original.id),
                generated_at: response_created_at,
                generation_complete,
                inference_job_id: Some(inference_event_id),
                inference_error: None,
            },
        )
        .map_err(store_err)?;

        tx.execute(
            "UPDATE ChatSequences SET user_pinned = 0 WHERE id = ?1",
            params![original.id],
        )
        .map_err(store_err)?;
        tx.execute(
            "UPDATE InferenceEvents SET parent_sequence = ?2 WHERE id = ?1",
            params![inference_event_id, sequence_id],
        )
        .map_err(store_err)?;

        tx.commit().map_err(store_err)?;
        Ok((message_id, sequence_id))
    }
}

fn initial_model_info(model: Option<&crate::FoundationModelRow>) -> ChatMessage {
    let content = match model {
        Some(model) => format!(
            "model config: {}",
            serde_json::to_string_pretty(model).unwrap_or_default()
        ),
        None => "no info available".to_string(),
    };
    ChatMessage::new("model config", content)
}

fn model_info_diff(
    previous: &crate::FoundationModelRow,
    current: &crate::FoundationModelRow,
) -> Option<ChatMessage> {
    if previous.id == current.id {
        return None;
    }
    let old = serde_json::to_string_pretty(previous).unwrap_or_default();
    let new = serde_json::to_string_pretty(current).unwrap_or_default();
    if old == new {
        return None;
    }
    Some(ChatMessage::new(
        "model config",
        format!("model configs changed:\n{old}\n{new}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::ChatMessage as Msg;

    fn seed_message(store: &HistoryStore, role: &str, content: &str) -> MessageId {
        store.create_message(&Msg::new(role, content)).unwrap().0
    }

    fn seed_sequence(
        store: &HistoryStore,
        message: MessageId,
        parent: Option<SequenceId>,
    ) -> SequenceId {
        store
            .create_sequence(&NewSequence {
                current_message: message,
                parent_sequence: parent,
                generated_at: Some(Utc::now()),
                generation_complete: true,
                ..Default::default()
            })
            .unwrap()
            .0
    }

    fn seed_model_and_event(store: &HistoryStore) -> InferenceEventId {
        let model = store
            .insert_foundation_model(&crate::FoundationModelCandidate {
                human_id: "m1".into(),
                provider_identifiers: "{}".into(),
                ..Default::default()
            })
            .unwrap();
        store
            .create_inference_event(model.id, "chat sequence", None)
            .unwrap()
    }

    #[test]
    fn sequence_insert_is_idempotent_on_message_and_parent() {
        let store = HistoryStore::open_in_memory().unwrap();
        let message = seed_message(&store, "user", "hi");

        let first = seed_sequence(&store, message, None);
        let (second, just_created) = store
            .create_sequence(&NewSequence {
                current_message: message,
                parent_sequence: None,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(first, second);
        assert!(!just_created);
    }

    #[test]
    fn parents_walk_from_leaf_to_root() {
        let store = HistoryStore::open_in_memory().unwrap();
        let root = seed_sequence(&store, seed_message(&store, "user", "a"), None);
        let mid = seed_sequence(&store, seed_message(&store, "assistant", "b"), Some(root));
        let leaf = seed_sequence(&store, seed_message(&store, "user", "c"), Some(mid));

        let chain: Vec<_> = store
            .sequence_parents(leaf)
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(chain, vec![leaf, mid, root]);
    }

    #[test]
    fn messages_come_back_in_root_to_leaf_order() {
        let store = HistoryStore::open_in_memory().unwrap();
        let root = seed_sequence(&store, seed_message(&store, "user", "a"), None);
        let leaf = seed_sequence(&store, seed_message(&store, "assistant", "b"), Some(root));

        let contents: Vec<_> = store
            .messages_for_sequence(leaf, false)
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["a", "b"]);
    }

    #[test]
    fn commit_response_sequence_transfers_pin_and_backpatches_event() {
        let store = HistoryStore::open_in_memory().unwrap();
        let message = seed_message(&store, "user", "hi");
        let (parent, _) = store
            .create_sequence(&NewSequence {
                current_message: message,
                user_pinned: true,
                ..Default::default()
            })
            .unwrap();
        let event = seed_model_and_event(&store);

        let (new_message, new_sequence) = store
            .commit_response_sequence(parent, "hi world", Some(Utc::now()), event, true)
            .unwrap();

        let child = store.get_sequence(new_sequence).unwrap().unwrap();
        assert!(child.user_pinned);
        assert_eq!(child.parent_sequence, Some(parent));
        assert_eq!(child.current_message, new_message);
        assert!(!store.get_sequence(parent).unwrap().unwrap().user_pinned);

        let pinned: Vec<_> = store
            .sequence_parents(new_sequence)
            .unwrap()
            .into_iter()
            .filter(|s| s.user_pinned)
            .map(|s| s.id)
            .collect();
        assert_eq!(pinned, vec![new_sequence]);

        let event_row = store.get_inference_event(event).unwrap().unwrap();
        assert_eq!(event_row.parent_sequence, Some(new_sequence));
    }

    #[test]
    fn failed_commit_leaves_no_orphan_rows() {
        let store = HistoryStore::open_in_memory().unwrap();
        let event = seed_model_and_event(&store);

        // Nonexistent parent sequence: the transaction rolls back entirely.
        let result = store.commit_response_sequence(9999, "orphan?", None, event, true);
        assert!(result.is_err());

        assert!(store.lookup_message("assistant", "orphan?").unwrap().is_none());
        let event_row = store.get_inference_event(event).unwrap().unwrap();
        assert_eq!(event_row.parent_sequence, None);
    }

    #[test]
    fn extend_sequence_inherits_pin() {
        let store = HistoryStore::open_in_memory().unwrap();
        let message = seed_message(&store, "user", "hi");
        let (parent, _) = store
            .create_sequence(&NewSequence {
                current_message: message,
                user_pinned: true,
                ..Default::default()
            })
            .unwrap();

        let next_message = seed_message(&store, "user", "more");
        let node = store.extend_sequence(parent, next_message).unwrap();
        assert!(node.user_pinned);
        assert!(!store.get_sequence(parent).unwrap().unwrap().user_pinned);
    }

    #[test]
    fn recent_ids_respect_limit_and_order() {
        let store = HistoryStore::open_in_memory().unwrap();
        let mut ids = Vec::new();
        for n in 0..3 {
            ids.push(seed_sequence(
                &store,
                seed_message(&store, "user", &format!("m{n}")),
                None,
            ));
        }

        let recent = store.recent_sequence_ids(None, Some(2)).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0], *ids.last().unwrap());
    }
}
