use rusqlite::Connection;
use tracing::info;

use crate::Result;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS conversations (
            id          TEXT PRIMARY KEY,
            user_a      TEXT NOT NULL,
            user_b      TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            UNIQUE(user_a, user_b),
            CHECK (user_a < user_b)
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_user_b
            ON conversations(user_b);

        CREATE TABLE IF NOT EXISTS chat_groups (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            private     INTEGER NOT NULL DEFAULT 0,
            created_by  TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS channels (
            id          TEXT PRIMARY KEY,
            group_id    TEXT NOT NULL REFERENCES chat_groups(id),
            name        TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            UNIQUE(group_id, name)
        );

        CREATE TABLE IF NOT EXISTS memberships (
            group_id    TEXT NOT NULL REFERENCES chat_groups(id),
            user_id     TEXT NOT NULL,
            role        TEXT NOT NULL CHECK (role IN ('member', 'moderator', 'administrator')),
            updated_at  TEXT NOT NULL,
            PRIMARY KEY (group_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_memberships_user
            ON memberships(user_id);

        -- A message lives in exactly one container: (kind, id).
        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            container_kind  TEXT NOT NULL CHECK (container_kind IN ('conversation', 'channel')),
            container_id    TEXT NOT NULL,
            seq             INTEGER NOT NULL,
            author_id       TEXT NOT NULL,
            body            TEXT NOT NULL,
            correlation_id  TEXT,
            deleted         INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL,
            UNIQUE(container_kind, container_id, seq)
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_correlation
            ON messages(author_id, correlation_id)
            WHERE correlation_id IS NOT NULL;

        CREATE TABLE IF NOT EXISTS read_positions (
            user_id         TEXT NOT NULL,
            container_kind  TEXT NOT NULL,
            container_id    TEXT NOT NULL,
            position        INTEGER NOT NULL,
            updated_at      TEXT NOT NULL,
            PRIMARY KEY (user_id, container_kind, container_id)
        );

        CREATE TABLE IF NOT EXISTS reaction_targets (
            target_kind     TEXT NOT NULL,
            target_id       TEXT NOT NULL,
            registered_at   TEXT NOT NULL,
            PRIMARY KEY (target_kind, target_id)
        );

        CREATE TABLE IF NOT EXISTS reactions (
            target_kind TEXT NOT NULL,
            target_id   TEXT NOT NULL,
            user_id     TEXT NOT NULL,
            emoji       TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            PRIMARY KEY (target_kind, target_id, user_id, emoji)
        );

        -- Applied toggles by correlation id, so retried toggles replay
        -- instead of flipping the reaction back.
        CREATE TABLE IF NOT EXISTS reaction_toggles (
            correlation_id  TEXT PRIMARY KEY,
            user_id         TEXT NOT NULL,
            target_kind     TEXT NOT NULL,
            target_id       TEXT NOT NULL,
            emoji           TEXT NOT NULL,
            added           INTEGER NOT NULL,
            created_at      TEXT NOT NULL
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
