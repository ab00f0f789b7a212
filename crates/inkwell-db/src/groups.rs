use rusqlite::Connection;
use uuid::Uuid;

use inkwell_types::models::{Channel, ContainerId, Group, Membership, Role};

use crate::models::{ChannelRow, GroupRow, OptionalExt, now, parse_role, parse_uuid};
use crate::read_positions::delete_group_positions;
use crate::{Database, Result, StoreError};

impl Database {
    // -- Groups --

    /// Creates a group and makes `creator` its administrator.
    pub fn create_group(&self, name: &str, private: bool, creator: Uuid) -> Result<Group> {
        let id = Uuid::new_v4();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let ts = now();
            tx.execute(
                "INSERT INTO chat_groups (id, name, private, created_by, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id.to_string(), name, private, creator.to_string(), ts],
            )?;
            tx.execute(
                "INSERT INTO memberships (group_id, user_id, role, updated_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id.to_string(), creator.to_string(), Role::Administrator.as_str(), ts],
            )?;
            let group = query_group(&tx, id)?
                .ok_or_else(|| StoreError::Unavailable("group vanished after insert".into()))?;
            tx.commit()?;
            Ok(group)
        })
    }

    pub fn get_group(&self, group_id: Uuid) -> Result<Option<Group>> {
        self.with_conn(|conn| query_group(conn, group_id))
    }

    /// Groups the user belongs to, with their role in each.
    pub fn groups_for_user(&self, user_id: Uuid) -> Result<Vec<(Group, Role)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT g.id, g.name, g.private, g.created_by, g.created_at, m.role
                 FROM chat_groups g
                 JOIN memberships m ON m.group_id = g.id
                 WHERE m.user_id = ?1
                 ORDER BY g.created_at, g.id",
            )?;
            let rows = stmt
                .query_map([user_id.to_string()], |row| {
                    Ok((GroupRow::from_row(row)?, row.get::<_, String>(5)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(group, role)| Ok((group.into_group()?, parse_role(&role)?)))
                .collect()
        })
    }

    // -- Channels --

    pub fn create_channel(&self, group_id: Uuid, name: &str) -> Result<Channel> {
        let id = Uuid::new_v4();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            if query_group(&tx, group_id)?.is_none() {
                return Err(StoreError::NotFound(format!("group {group_id}")));
            }
            let taken: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM channels WHERE group_id = ?1 AND name = ?2)",
                rusqlite::params![group_id.to_string(), name],
                |row| row.get(0),
            )?;
            if taken {
                return Err(StoreError::Conflict(format!("channel '{name}' already exists")));
            }
            tx.execute(
                "INSERT INTO channels (id, group_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id.to_string(), group_id.to_string(), name, now()],
            )?;
            let channel = query_channel(&tx, id)?
                .ok_or_else(|| StoreError::Unavailable("channel vanished after insert".into()))?;
            tx.commit()?;
            Ok(channel)
        })
    }

    pub fn get_channel(&self, channel_id: Uuid) -> Result<Option<Channel>> {
        self.with_conn(|conn| query_channel(conn, channel_id))
    }

    pub fn list_channels(&self, group_id: Uuid) -> Result<Vec<Channel>> {
        self.with_conn(|conn| query_channels(conn, group_id))
    }

    /// Every channel of every group the user belongs to.
    pub fn channels_for_user(&self, user_id: Uuid) -> Result<Vec<Channel>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.group_id, c.name, c.created_at
                 FROM channels c
                 JOIN memberships m ON m.group_id = c.group_id
                 WHERE m.user_id = ?1
                 ORDER BY c.group_id, c.created_at, c.id",
            )?;
            let rows = stmt
                .query_map([user_id.to_string()], ChannelRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(ChannelRow::into_channel).collect()
        })
    }

    // -- Membership --

    /// Idempotent role write. Returns true when the stored role changed.
    /// Demoting the only administrator is a conflict.
    pub fn set_role(&self, group_id: Uuid, user_id: Uuid, role: Role) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            if query_group(&tx, group_id)?.is_none() {
                return Err(StoreError::NotFound(format!("group {group_id}")));
            }
            let current = query_role(&tx, group_id, user_id)?;
            if current == Some(role) {
                return Ok(false);
            }
            if current == Some(Role::Administrator) {
                ensure_other_admin(&tx, group_id, user_id)?;
            }
            tx.execute(
                "INSERT INTO memberships (group_id, user_id, role, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(group_id, user_id) DO UPDATE SET role = excluded.role, updated_at = excluded.updated_at",
                rusqlite::params![group_id.to_string(), user_id.to_string(), role.as_str(), now()],
            )?;
            tx.commit()?;
            Ok(true)
        })
    }

    /// Returns true when a membership row was removed. The member's read
    /// positions in the group's channels go with it. Removing the only
    /// administrator is a conflict.
    pub fn remove_member(&self, group_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            if query_role(&tx, group_id, user_id)? == Some(Role::Administrator) {
                ensure_other_admin(&tx, group_id, user_id)?;
            }
            let removed = tx.execute(
                "DELETE FROM memberships WHERE group_id = ?1 AND user_id = ?2",
                [group_id.to_string(), user_id.to_string()],
            )?;
            if removed > 0 {
                delete_group_positions(&tx, user_id, group_id)?;
            }
            tx.commit()?;
            Ok(removed > 0)
        })
    }

    pub fn role_of(&self, group_id: Uuid, user_id: Uuid) -> Result<Option<Role>> {
        self.with_conn(|conn| query_role(conn, group_id, user_id))
    }

    pub fn group_members(&self, group_id: Uuid) -> Result<Vec<Membership>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, role FROM memberships WHERE group_id = ?1 ORDER BY user_id",
            )?;
            let rows = stmt
                .query_map([group_id.to_string()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(user_id, role)| {
                    Ok(Membership {
                        group_id,
                        user_id: parse_uuid(&user_id, "member user_id")?,
                        role: parse_role(&role)?,
                    })
                })
                .collect()
        })
    }

    // -- Containers --

    /// Participants of a conversation or members of a channel's group.
    pub fn container_members(&self, container: ContainerId) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| query_container_members(conn, container))
    }

    /// Point lookup; `NotFound` when the container does not exist.
    pub fn is_container_member(&self, container: ContainerId, user_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| match container {
            ContainerId::Conversation(id) => {
                let conversation = crate::conversations::query_conversation(conn, id)?
                    .ok_or_else(|| StoreError::NotFound(format!("conversation {id}")))?;
                Ok(conversation.user_a == user_id || conversation.user_b == user_id)
            }
            ContainerId::Channel(id) => {
                let channel = query_channel(conn, id)?
                    .ok_or_else(|| StoreError::NotFound(format!("channel {id}")))?;
                Ok(query_role(conn, channel.group_id, user_id)?.is_some())
            }
        })
    }

    /// Owning group of a channel container, `None` for conversations.
    pub fn container_group(&self, container: ContainerId) -> Result<Option<Uuid>> {
        match container {
            ContainerId::Conversation(_) => Ok(None),
            ContainerId::Channel(channel_id) => {
                let channel = self
                    .get_channel(channel_id)?
                    .ok_or_else(|| StoreError::NotFound(format!("channel {channel_id}")))?;
                Ok(Some(channel.group_id))
            }
        }
    }
}

pub(crate) fn query_group(conn: &Connection, group_id: Uuid) -> Result<Option<Group>> {
    conn.query_row(
        "SELECT id, name, private, created_by, created_at FROM chat_groups WHERE id = ?1",
        [group_id.to_string()],
        GroupRow::from_row,
    )
    .optional()?
    .map(GroupRow::into_group)
    .transpose()
}

pub(crate) fn query_channel(conn: &Connection, channel_id: Uuid) -> Result<Option<Channel>> {
    conn.query_row(
        "SELECT id, group_id, name, created_at FROM channels WHERE id = ?1",
        [channel_id.to_string()],
        ChannelRow::from_row,
    )
    .optional()?
    .map(ChannelRow::into_channel)
    .transpose()
}

fn query_channels(conn: &Connection, group_id: Uuid) -> Result<Vec<Channel>> {
    let mut stmt = conn.prepare(
        "SELECT id, group_id, name, created_at FROM channels WHERE group_id = ?1 ORDER BY created_at, id",
    )?;
    let rows = stmt
        .query_map([group_id.to_string()], ChannelRow::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().map(ChannelRow::into_channel).collect()
}

pub(crate) fn query_role(conn: &Connection, group_id: Uuid, user_id: Uuid) -> Result<Option<Role>> {
    conn.query_row(
        "SELECT role FROM memberships WHERE group_id = ?1 AND user_id = ?2",
        [group_id.to_string(), user_id.to_string()],
        |row| row.get::<_, String>(0),
    )
    .optional()?
    .map(|role| parse_role(&role))
    .transpose()
}

fn ensure_other_admin(conn: &Connection, group_id: Uuid, user_id: Uuid) -> Result<()> {
    let others: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memberships WHERE group_id = ?1 AND role = ?2 AND user_id != ?3",
        rusqlite::params![group_id.to_string(), Role::Administrator.as_str(), user_id.to_string()],
        |row| row.get(0),
    )?;
    if others == 0 {
        return Err(StoreError::Conflict(format!("{user_id} is the last administrator of {group_id}")));
    }
    Ok(())
}

pub(crate) fn query_container_members(conn: &Connection, container: ContainerId) -> Result<Vec<Uuid>> {
    match container {
        ContainerId::Conversation(id) => {
            let conversation = crate::conversations::query_conversation(conn, id)?
                .ok_or_else(|| StoreError::NotFound(format!("conversation {id}")))?;
            Ok(vec![conversation.user_a, conversation.user_b])
        }
        ContainerId::Channel(id) => {
            let channel = query_channel(conn, id)?
                .ok_or_else(|| StoreError::NotFound(format!("channel {id}")))?;
            let mut stmt = conn.prepare("SELECT user_id FROM memberships WHERE group_id = ?1")?;
            let ids = stmt
                .query_map([channel.group_id.to_string()], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            ids.iter().map(|id| parse_uuid(id, "member user_id")).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creator_becomes_administrator() {
        let db = Database::open_in_memory().unwrap();
        let creator = Uuid::new_v4();
        let group = db.create_group("Book club", true, creator).unwrap();

        assert_eq!(db.role_of(group.id, creator).unwrap(), Some(Role::Administrator));
        assert!(group.private);
        assert_eq!(db.groups_for_user(creator).unwrap().len(), 1);
    }

    #[test]
    fn role_writes_are_idempotent_and_visible() {
        let db = Database::open_in_memory().unwrap();
        let group = db.create_group("g", false, Uuid::new_v4()).unwrap();
        let user = Uuid::new_v4();

        assert!(db.set_role(group.id, user, Role::Member).unwrap());
        assert!(!db.set_role(group.id, user, Role::Member).unwrap());
        assert!(db.set_role(group.id, user, Role::Moderator).unwrap());
        assert_eq!(db.role_of(group.id, user).unwrap(), Some(Role::Moderator));

        let members = db.group_members(group.id).unwrap();
        assert_eq!(members.iter().filter(|m| m.user_id == user).count(), 1);
    }

    #[test]
    fn channel_names_are_unique_per_group() {
        let db = Database::open_in_memory().unwrap();
        let group = db.create_group("g", false, Uuid::new_v4()).unwrap();
        db.create_channel(group.id, "general").unwrap();

        let err = db.create_channel(group.id, "general").unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let err = db.create_channel(Uuid::new_v4(), "general").unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn channel_members_follow_group_membership() {
        let db = Database::open_in_memory().unwrap();
        let creator = Uuid::new_v4();
        let reader = Uuid::new_v4();
        let group = db.create_group("g", false, creator).unwrap();
        let channel = db.create_channel(group.id, "news").unwrap();
        db.set_role(group.id, reader, Role::Member).unwrap();

        let container = ContainerId::Channel(channel.id);
        assert!(db.is_container_member(container, reader).unwrap());

        assert!(db.remove_member(group.id, reader).unwrap());
        assert!(!db.remove_member(group.id, reader).unwrap());
        assert!(!db.is_container_member(container, reader).unwrap());
        assert_eq!(db.container_group(container).unwrap(), Some(group.id));
    }

    #[test]
    fn last_administrator_cannot_leave_or_step_down() {
        let db = Database::open_in_memory().unwrap();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let group = db.create_group("g", false, first).unwrap();
        db.set_role(group.id, second, Role::Administrator).unwrap();

        assert!(db.set_role(group.id, first, Role::Member).unwrap());
        let err = db.set_role(group.id, second, Role::Member).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        let err = db.remove_member(group.id, second).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(db.role_of(group.id, second).unwrap(), Some(Role::Administrator));

        let err = db.is_container_member(ContainerId::Channel(Uuid::new_v4()), second).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
