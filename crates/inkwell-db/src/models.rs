//! Database row types. These map directly to SQLite rows.
//! Distinct from inkwell-types models to keep the DB layer independent;
//! conversion validates ids and timestamps.

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::warn;
use uuid::Uuid;

use inkwell_types::models::{
    Channel, ContainerId, ContainerKind, Conversation, Group, Message, Role,
};

use crate::{Result, StoreError};

pub struct MessageRow {
    pub id: String,
    pub container_kind: String,
    pub container_id: String,
    pub seq: i64,
    pub author_id: String,
    pub body: String,
    pub correlation_id: Option<String>,
    pub deleted: bool,
    pub created_at: String,
    pub group_id: Option<String>,
}

pub(crate) const MESSAGE_COLUMNS: &str =
    "id, container_kind, container_id, seq, author_id, body, correlation_id, deleted, created_at,
     (SELECT c.group_id FROM channels c
      WHERE messages.container_kind = 'channel' AND c.id = messages.container_id)";

impl MessageRow {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            container_kind: row.get(1)?,
            container_id: row.get(2)?,
            seq: row.get(3)?,
            author_id: row.get(4)?,
            body: row.get(5)?,
            correlation_id: row.get(6)?,
            deleted: row.get(7)?,
            created_at: row.get(8)?,
            group_id: row.get(9)?,
        })
    }

    pub fn into_message(self) -> Result<Message> {
        let kind: ContainerKind = self
            .container_kind
            .parse()
            .map_err(|e| corrupt("container_kind", &self.id, e))?;

        Ok(Message {
            id: parse_uuid(&self.id, "message id")?,
            container: ContainerId::from_parts(kind, parse_uuid(&self.container_id, "container_id")?),
            sequence: self.seq.max(0) as u64,
            author_id: parse_uuid(&self.author_id, "author_id")?,
            body: self.body,
            correlation_id: self
                .correlation_id
                .as_deref()
                .map(|c| parse_uuid(c, "correlation_id"))
                .transpose()?,
            deleted: self.deleted,
            created_at: parse_timestamp(&self.created_at),
            group_id: self
                .group_id
                .as_deref()
                .map(|g| parse_uuid(g, "message group_id"))
                .transpose()?,
        })
    }
}

pub struct ConversationRow {
    pub id: String,
    pub user_a: String,
    pub user_b: String,
    pub created_at: String,
}

impl ConversationRow {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_a: row.get(1)?,
            user_b: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    pub fn into_conversation(self) -> Result<Conversation> {
        Ok(Conversation {
            id: parse_uuid(&self.id, "conversation id")?,
            user_a: parse_uuid(&self.user_a, "user_a")?,
            user_b: parse_uuid(&self.user_b, "user_b")?,
            created_at: parse_timestamp(&self.created_at),
        })
    }
}

pub struct GroupRow {
    pub id: String,
    pub name: String,
    pub private: bool,
    pub created_by: String,
    pub created_at: String,
}

impl GroupRow {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            private: row.get(2)?,
            created_by: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    pub fn into_group(self) -> Result<Group> {
        Ok(Group {
            id: parse_uuid(&self.id, "group id")?,
            name: self.name,
            private: self.private,
            created_by: parse_uuid(&self.created_by, "created_by")?,
            created_at: parse_timestamp(&self.created_at),
        })
    }
}

pub struct ChannelRow {
    pub id: String,
    pub group_id: String,
    pub name: String,
    pub created_at: String,
}

impl ChannelRow {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            group_id: row.get(1)?,
            name: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    pub fn into_channel(self) -> Result<Channel> {
        Ok(Channel {
            id: parse_uuid(&self.id, "channel id")?,
            group_id: parse_uuid(&self.group_id, "group_id")?,
            name: self.name,
            created_at: parse_timestamp(&self.created_at),
        })
    }
}

pub(crate) fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_uuid(raw: &str, what: &str) -> Result<Uuid> {
    raw.parse().map_err(|e| corrupt(what, raw, e))
}

pub(crate) fn parse_role(raw: &str) -> Result<Role> {
    raw.parse().map_err(|e| corrupt("role", raw, e))
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // SQLite's datetime('now') has no timezone; parse as naive UTC.
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}': {}", raw, e);
            DateTime::default()
        })
}

fn corrupt(what: &str, raw: &str, e: impl std::fmt::Display) -> StoreError {
    warn!("Corrupt {} '{}': {}", what, raw, e);
    StoreError::Unavailable(format!("corrupt {what} '{raw}'"))
}

/// Clamps a wire sequence into SQLite's signed integer range.
pub(crate) fn seq_param(seq: u64) -> i64 {
    i64::try_from(seq).unwrap_or(i64::MAX)
}

/// Extension trait for optional query results
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
