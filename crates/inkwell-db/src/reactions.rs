use std::collections::HashMap;

use rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use inkwell_types::models::{ReactionGroup, ReactionTarget, ReactionTargetKind};

use crate::messages::query_message;
use crate::models::{OptionalExt, now, parse_uuid};
use crate::{Database, Result, StoreError};

/// Outcome of a toggle, with the target's full reaction set afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionToggle {
    pub added: bool,
    pub reactions: Vec<ReactionGroup>,
    /// True when the correlation id had already been applied and nothing
    /// was toggled this time.
    pub replayed: bool,
}

impl Database {
    /// Registers an opaque comment or review as a reaction target. Messages
    /// are targets implicitly. Returns true when newly registered.
    pub fn register_reaction_target(&self, target: ReactionTarget) -> Result<bool> {
        if target.kind == ReactionTargetKind::Message {
            return Err(StoreError::Conflict("message targets are registered implicitly".into()));
        }
        self.with_conn_mut(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO reaction_targets (target_kind, target_id, registered_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![target.kind.as_str(), target.id.to_string(), now()],
            )?;
            Ok(inserted > 0)
        })
    }

    /// Toggles `(target, user, emoji)`: removes it if present, adds it if not.
    ///
    /// With a correlation id that was already applied, the recorded outcome is
    /// returned and nothing changes, so client retries are safe to replay.
    pub fn toggle_reaction(
        &self,
        target: ReactionTarget,
        user_id: Uuid,
        emoji: &str,
        correlation_id: Option<Uuid>,
    ) -> Result<ReactionToggle> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            if let Some(correlation_id) = correlation_id {
                if let Some(added) = query_replay(&tx, correlation_id, target, user_id, emoji)? {
                    debug!("Replayed reaction toggle {} on {}", correlation_id, target);
                    let reactions = query_reactions(&tx, target)?;
                    return Ok(ReactionToggle { added, reactions, replayed: true });
                }
            }

            if !target_exists(&tx, target)? {
                return Err(StoreError::NotFound(format!("reaction target {target}")));
            }

            let removed = tx.execute(
                "DELETE FROM reactions WHERE target_kind = ?1 AND target_id = ?2 AND user_id = ?3 AND emoji = ?4",
                rusqlite::params![target.kind.as_str(), target.id.to_string(), user_id.to_string(), emoji],
            )?;
            let added = removed == 0;
            if added {
                tx.execute(
                    "INSERT INTO reactions (target_kind, target_id, user_id, emoji, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![target.kind.as_str(), target.id.to_string(), user_id.to_string(), emoji, now()],
                )?;
            }

            if let Some(correlation_id) = correlation_id {
                tx.execute(
                    "INSERT INTO reaction_toggles (correlation_id, user_id, target_kind, target_id, emoji, added, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        correlation_id.to_string(),
                        user_id.to_string(),
                        target.kind.as_str(),
                        target.id.to_string(),
                        emoji,
                        added,
                        now(),
                    ],
                )?;
            }

            let reactions = query_reactions(&tx, target)?;
            tx.commit()?;
            Ok(ReactionToggle { added, reactions, replayed: false })
        })
    }

    pub fn reactions_for(&self, target: ReactionTarget) -> Result<Vec<ReactionGroup>> {
        self.with_conn(|conn| query_reactions(conn, target))
    }

    /// Batch-fetch reactions for a set of messages.
    pub fn reactions_for_messages(&self, message_ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<ReactionGroup>>> {
        if message_ids.is_empty() {
            return Ok(HashMap::new());
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> = (2..=message_ids.len() + 1).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT target_id, emoji, user_id FROM reactions
                 WHERE target_kind = ?1 AND target_id IN ({})",
                placeholders.join(", ")
            );

            let mut params: Vec<String> = Vec::with_capacity(message_ids.len() + 1);
            params.push(ReactionTargetKind::Message.as_str().to_string());
            params.extend(message_ids.iter().map(|id| id.to_string()));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut pairs: HashMap<Uuid, Vec<(String, Uuid)>> = HashMap::new();
            for (target_id, emoji, user_id) in rows {
                pairs
                    .entry(parse_uuid(&target_id, "target_id")?)
                    .or_default()
                    .push((emoji, parse_uuid(&user_id, "reaction user_id")?));
            }
            Ok(pairs
                .into_iter()
                .map(|(id, pairs)| (id, ReactionGroup::collect(pairs)))
                .collect())
        })
    }
}

fn target_exists(conn: &Connection, target: ReactionTarget) -> Result<bool> {
    match target.kind {
        ReactionTargetKind::Message => {
            Ok(query_message(conn, target.id)?.is_some_and(|m| !m.deleted))
        }
        _ => Ok(conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM reaction_targets WHERE target_kind = ?1 AND target_id = ?2)",
            rusqlite::params![target.kind.as_str(), target.id.to_string()],
            |row| row.get(0),
        )?),
    }
}

/// Recorded outcome of an already-applied toggle. A correlation id reused for
/// a different reaction is a conflict.
fn query_replay(
    conn: &Connection,
    correlation_id: Uuid,
    target: ReactionTarget,
    user_id: Uuid,
    emoji: &str,
) -> Result<Option<bool>> {
    let recorded = conn
        .query_row(
            "SELECT user_id, target_kind, target_id, emoji, added FROM reaction_toggles WHERE correlation_id = ?1",
            [correlation_id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                ))
            },
        )
        .optional()?;

    let Some((user, kind, id, recorded_emoji, added)) = recorded else {
        return Ok(None);
    };
    let same = user == user_id.to_string()
        && kind == target.kind.as_str()
        && id == target.id.to_string()
        && recorded_emoji == emoji;
    if !same {
        return Err(StoreError::Conflict(format!(
            "correlation id {correlation_id} already used for another reaction"
        )));
    }
    Ok(Some(added))
}

fn query_reactions(conn: &Connection, target: ReactionTarget) -> Result<Vec<ReactionGroup>> {
    let mut stmt = conn.prepare(
        "SELECT emoji, user_id FROM reactions WHERE target_kind = ?1 AND target_id = ?2",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![target.kind.as_str(), target.id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let pairs = rows
        .into_iter()
        .map(|(emoji, user_id)| Ok((emoji, parse_uuid(&user_id, "reaction user_id")?)))
        .collect::<Result<Vec<_>>>()?;
    Ok(ReactionGroup::collect(pairs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkwell_types::models::ContainerId;

    fn message_target(db: &Database) -> (ReactionTarget, Uuid) {
        let author = Uuid::new_v4();
        let group = db.create_group("g", false, author).unwrap();
        let channel = db.create_channel(group.id, "c").unwrap();
        let message = db
            .append_message(ContainerId::Channel(channel.id), author, "hi", None)
            .unwrap()
            .message;
        (ReactionTarget::message(message.id), author)
    }

    #[test]
    fn toggling_twice_restores_original_presence() {
        let db = Database::open_in_memory().unwrap();
        let (target, user) = message_target(&db);
        let before = db.reactions_for(target).unwrap();

        let on = db.toggle_reaction(target, user, "👍", None).unwrap();
        assert!(on.added);
        assert_eq!(on.reactions.len(), 1);

        let off = db.toggle_reaction(target, user, "👍", None).unwrap();
        assert!(!off.added);
        assert_eq!(db.reactions_for(target).unwrap(), before);
    }

    #[test]
    fn replayed_correlation_id_does_not_toggle_again() {
        let db = Database::open_in_memory().unwrap();
        let (target, user) = message_target(&db);
        let correlation = Some(Uuid::new_v4());

        let first = db.toggle_reaction(target, user, "🔥", correlation).unwrap();
        let retry = db.toggle_reaction(target, user, "🔥", correlation).unwrap();
        assert!(first.added && retry.added);
        assert!(retry.replayed);
        assert_eq!(retry.reactions, first.reactions);

        let err = db.toggle_reaction(target, user, "😂", correlation).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn opaque_targets_must_be_registered() {
        let db = Database::open_in_memory().unwrap();
        let review = ReactionTarget { kind: ReactionTargetKind::Review, id: Uuid::new_v4() };
        let user = Uuid::new_v4();

        let err = db.toggle_reaction(review, user, "❤️", None).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        assert!(db.register_reaction_target(review).unwrap());
        assert!(!db.register_reaction_target(review).unwrap());
        assert!(db.toggle_reaction(review, user, "❤️", None).unwrap().added);
    }

    #[test]
    fn batch_fetch_groups_by_message() {
        let db = Database::open_in_memory().unwrap();
        let (target, user) = message_target(&db);
        let other = Uuid::new_v4();
        db.toggle_reaction(target, user, "👍", None).unwrap();
        db.toggle_reaction(target, other, "👍", None).unwrap();

        let map = db.reactions_for_messages(&[target.id, Uuid::new_v4()]).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map[&target.id][0].count, 2);
    }
}
