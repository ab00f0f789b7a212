use rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use inkwell_types::models::{ContainerId, Message};

use crate::groups::{query_channel, query_container_members, query_role};
use crate::models::{MESSAGE_COLUMNS, MessageRow, OptionalExt, now, seq_param};
use crate::{Database, Result, StoreError};

/// Result of an append. `created` is false when a retried send with the same
/// correlation id returned the already-stored message.
#[derive(Debug, Clone)]
pub struct Appended {
    pub message: Message,
    pub created: bool,
}

/// Unread count of one user in one container, and the highest sequence the
/// count accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnreadTail {
    pub count: u64,
    pub as_of: u64,
}

impl Database {
    /// Appends a message, assigning the next sequence number of `container`.
    ///
    /// Sequence assignment runs inside a transaction on the single writer
    /// connection, so each container has exactly one writer at a time.
    pub fn append_message(
        &self,
        container: ContainerId,
        author_id: Uuid,
        body: &str,
        correlation_id: Option<Uuid>,
    ) -> Result<Appended> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let members = query_container_members(&tx, container)?;
            if !members.contains(&author_id) {
                return Err(StoreError::Forbidden(format!("{author_id} is not a member of {container}")));
            }

            if let Some(correlation_id) = correlation_id {
                if let Some(existing) = query_by_correlation(&tx, author_id, correlation_id)? {
                    if existing.container != container || existing.body != body {
                        return Err(StoreError::Conflict(format!(
                            "correlation id {correlation_id} already used for another message"
                        )));
                    }
                    debug!("Replayed append {} in {}", correlation_id, container);
                    return Ok(Appended { message: existing, created: false });
                }
            }

            let next: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE container_kind = ?1 AND container_id = ?2",
                rusqlite::params![container.kind().as_str(), container.id().to_string()],
                |row| row.get(0),
            )?;

            let id = Uuid::new_v4();
            tx.execute(
                "INSERT INTO messages (id, container_kind, container_id, seq, author_id, body, correlation_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    id.to_string(),
                    container.kind().as_str(),
                    container.id().to_string(),
                    next,
                    author_id.to_string(),
                    body,
                    correlation_id.map(|c| c.to_string()),
                    now(),
                ],
            )?;

            let message = query_message(&tx, id)?
                .ok_or_else(|| StoreError::Unavailable("message vanished after insert".into()))?;
            tx.commit()?;
            Ok(Appended { message, created: true })
        })
    }

    pub fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        self.with_conn(|conn| query_message(conn, id))
    }

    /// Messages with a sequence strictly greater than `after`, ascending.
    /// Deleted messages are included with their flag set.
    pub fn messages_after(&self, container: ContainerId, after: u64, limit: u32) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE container_kind = ?1 AND container_id = ?2 AND seq > ?3
                 ORDER BY seq ASC
                 LIMIT ?4"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    rusqlite::params![
                        container.kind().as_str(),
                        container.id().to_string(),
                        seq_param(after),
                        limit
                    ],
                    MessageRow::from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(MessageRow::into_message).collect()
        })
    }

    /// Highest sequence in the container, 0 when empty.
    pub fn max_sequence(&self, container: ContainerId) -> Result<u64> {
        self.with_conn(|conn| {
            let max: i64 = conn.query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM messages WHERE container_kind = ?1 AND container_id = ?2",
                rusqlite::params![container.kind().as_str(), container.id().to_string()],
                |row| row.get(0),
            )?;
            Ok(max.max(0) as u64)
        })
    }

    /// Counts live messages after `after` not written by `user_id`.
    ///
    /// Range scan over the `(container, seq)` unique index; the tail past a
    /// read position is short in normal use.
    pub fn count_unread(&self, container: ContainerId, user_id: Uuid, after: u64) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE container_kind = ?1 AND container_id = ?2 AND seq > ?3
                   AND author_id != ?4 AND deleted = 0",
                rusqlite::params![
                    container.kind().as_str(),
                    container.id().to_string(),
                    seq_param(after),
                    user_id.to_string()
                ],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
    }

    /// Unread count after `after` together with the container's highest
    /// sequence, read in one statement so both come from the same snapshot.
    pub fn unread_tail(&self, container: ContainerId, user_id: Uuid, after: u64) -> Result<UnreadTail> {
        self.with_conn(|conn| {
            let (as_of, count): (i64, i64) = conn.query_row(
                "SELECT
                    (SELECT COALESCE(MAX(seq), 0) FROM messages
                     WHERE container_kind = ?1 AND container_id = ?2),
                    (SELECT COUNT(*) FROM messages
                     WHERE container_kind = ?1 AND container_id = ?2 AND seq > ?3
                       AND author_id != ?4 AND deleted = 0)",
                rusqlite::params![
                    container.kind().as_str(),
                    container.id().to_string(),
                    seq_param(after),
                    user_id.to_string()
                ],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(UnreadTail { count: count.max(0) as u64, as_of: as_of.max(0) as u64 })
        })
    }

    /// Marks a message deleted.
    ///
    /// Allowed for the author, and for moderators or administrators of the
    /// owning group when the message is in a channel. Conversations have no
    /// moderation. The flag is false when the message was already deleted.
    pub fn soft_delete(&self, message_id: Uuid, actor_id: Uuid) -> Result<(Message, bool)> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let message = query_message(&tx, message_id)?
                .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;

            if message.author_id != actor_id {
                let moderator = match message.container {
                    ContainerId::Conversation(_) => false,
                    ContainerId::Channel(channel_id) => {
                        let channel = query_channel(&tx, channel_id)?
                            .ok_or_else(|| StoreError::NotFound(format!("channel {channel_id}")))?;
                        query_role(&tx, channel.group_id, actor_id)?
                            .is_some_and(|role| role.can_moderate())
                    }
                };
                if !moderator {
                    return Err(StoreError::Forbidden(format!(
                        "{actor_id} may not delete message {message_id}"
                    )));
                }
            }

            if message.deleted {
                return Ok((message, false));
            }

            tx.execute("UPDATE messages SET deleted = 1 WHERE id = ?1", [message_id.to_string()])?;
            let updated = query_message(&tx, message_id)?
                .ok_or_else(|| StoreError::Unavailable("message vanished during delete".into()))?;
            tx.commit()?;
            Ok((updated, true))
        })
    }
}

pub(crate) fn query_message(conn: &Connection, id: Uuid) -> Result<Option<Message>> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
    conn.query_row(&sql, [id.to_string()], MessageRow::from_row)
        .optional()?
        .map(MessageRow::into_message)
        .transpose()
}

fn query_by_correlation(conn: &Connection, author_id: Uuid, correlation_id: Uuid) -> Result<Option<Message>> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE author_id = ?1 AND correlation_id = ?2");
    conn.query_row(&sql, [author_id.to_string(), correlation_id.to_string()], MessageRow::from_row)
        .optional()?
        .map(MessageRow::into_message)
        .transpose()
}
