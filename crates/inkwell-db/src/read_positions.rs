use std::collections::HashMap;

use rusqlite::Connection;
use uuid::Uuid;

use inkwell_types::models::{ContainerId, ContainerKind, ReadAdvance};

use crate::models::{OptionalExt, now, parse_uuid, seq_param};
use crate::{Database, Result, StoreError};

impl Database {
    /// Moves the read position forward to `position`.
    ///
    /// A lower or equal position is a no-op that still reports the stored
    /// value, so concurrent advances from several tabs commute and settle on
    /// the maximum. The position is not checked against the message store.
    pub fn advance_read_position(
        &self,
        user_id: Uuid,
        container: ContainerId,
        position: u64,
    ) -> Result<ReadAdvance> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let stored = query_position(&tx, user_id, container)?.unwrap_or(0);
            if position <= stored {
                return Ok(ReadAdvance { position: stored, advanced: false });
            }

            tx.execute(
                "INSERT INTO read_positions (user_id, container_kind, container_id, position, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(user_id, container_kind, container_id)
                 DO UPDATE SET position = MAX(position, excluded.position), updated_at = excluded.updated_at",
                rusqlite::params![
                    user_id.to_string(),
                    container.kind().as_str(),
                    container.id().to_string(),
                    seq_param(position),
                    now(),
                ],
            )?;
            let current = query_position(&tx, user_id, container)?
                .ok_or_else(|| StoreError::Unavailable("read position vanished after write".into()))?;
            tx.commit()?;
            Ok(ReadAdvance { position: current, advanced: current > stored })
        })
    }

    /// Stored read position, 0 when the user never read the container.
    pub fn read_position(&self, user_id: Uuid, container: ContainerId) -> Result<u64> {
        self.with_conn(|conn| Ok(query_position(conn, user_id, container)?.unwrap_or(0)))
    }

    pub fn read_positions_for_user(&self, user_id: Uuid) -> Result<HashMap<ContainerId, u64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT container_kind, container_id, position FROM read_positions WHERE user_id = ?1",
            )?;
            let rows = stmt
                .query_map([user_id.to_string()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut positions = HashMap::with_capacity(rows.len());
            for (kind, id, position) in rows {
                let kind: ContainerKind = kind
                    .parse()
                    .map_err(|_| StoreError::Unavailable(format!("corrupt container_kind '{kind}'")))?;
                let container = ContainerId::from_parts(kind, parse_uuid(&id, "container_id")?);
                positions.insert(container, position.max(0) as u64);
            }
            Ok(positions)
        })
    }

    /// Forgets the user's read positions in every channel of a group. Returns
    /// the number of rows removed.
    pub fn delete_read_positions_for_group(&self, user_id: Uuid, group_id: Uuid) -> Result<usize> {
        self.with_conn_mut(|conn| delete_group_positions(conn, user_id, group_id))
    }
}

pub(crate) fn delete_group_positions(conn: &Connection, user_id: Uuid, group_id: Uuid) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM read_positions
         WHERE user_id = ?1 AND container_kind = 'channel'
           AND container_id IN (SELECT id FROM channels WHERE group_id = ?2)",
        [user_id.to_string(), group_id.to_string()],
    )?)
}

fn query_position(conn: &Connection, user_id: Uuid, container: ContainerId) -> Result<Option<u64>> {
    let position: Option<i64> = conn
        .query_row(
            "SELECT position FROM read_positions
             WHERE user_id = ?1 AND container_kind = ?2 AND container_id = ?3",
            rusqlite::params![user_id.to_string(), container.kind().as_str(), container.id().to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(position.map(|p| p.max(0) as u64))
}
