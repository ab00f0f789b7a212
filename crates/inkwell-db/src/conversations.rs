use rusqlite::Connection;
use uuid::Uuid;

use inkwell_types::models::{Conversation, canonical_pair};

use crate::models::{ConversationRow, OptionalExt, now};
use crate::{Database, Result, StoreError};

impl Database {
    /// Returns the single conversation for the unordered pair `{a, b}`,
    /// creating it on first use. The flag is true when it was created.
    pub fn find_or_create_conversation(&self, a: Uuid, b: Uuid) -> Result<(Conversation, bool)> {
        if a == b {
            return Err(StoreError::Conflict("a conversation needs two distinct users".into()));
        }
        let (user_a, user_b) = canonical_pair(a, b);

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            if let Some(existing) = query_conversation_by_pair(&tx, user_a, user_b)? {
                return Ok((existing, false));
            }

            let id = Uuid::new_v4();
            tx.execute(
                "INSERT INTO conversations (id, user_a, user_b, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id.to_string(), user_a.to_string(), user_b.to_string(), now()],
            )?;
            let created = query_conversation(&tx, id)?
                .ok_or_else(|| StoreError::Unavailable("conversation vanished after insert".into()))?;
            tx.commit()?;
            Ok((created, true))
        })
    }

    pub fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        self.with_conn(|conn| query_conversation(conn, id))
    }

    pub fn find_conversation(&self, a: Uuid, b: Uuid) -> Result<Option<Conversation>> {
        let (user_a, user_b) = canonical_pair(a, b);
        self.with_conn(|conn| query_conversation_by_pair(conn, user_a, user_b))
    }

    pub fn conversations_for_user(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_a, user_b, created_at FROM conversations
                 WHERE user_a = ?1 OR user_b = ?1
                 ORDER BY created_at, id",
            )?;
            let rows = stmt
                .query_map([user_id.to_string()], ConversationRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(ConversationRow::into_conversation).collect()
        })
    }
}

pub(crate) fn query_conversation(conn: &Connection, id: Uuid) -> Result<Option<Conversation>> {
    conn.query_row(
        "SELECT id, user_a, user_b, created_at FROM conversations WHERE id = ?1",
        [id.to_string()],
        ConversationRow::from_row,
    )
    .optional()?
    .map(ConversationRow::into_conversation)
    .transpose()
}

fn query_conversation_by_pair(conn: &Connection, user_a: Uuid, user_b: Uuid) -> Result<Option<Conversation>> {
    conn.query_row(
        "SELECT id, user_a, user_b, created_at FROM conversations WHERE user_a = ?1 AND user_b = ?2",
        [user_a.to_string(), user_b.to_string()],
        ConversationRow::from_row,
    )
    .optional()?
    .map(ConversationRow::into_conversation)
    .transpose()
}
