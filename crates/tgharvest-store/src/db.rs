use rusqlite::Connection;

use crate::error::Result;

/// Initialise the harvester schema. Safe to call on every startup — uses
/// `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS accounts (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            label             TEXT    NOT NULL DEFAULT '',
            phone_number      TEXT    NOT NULL DEFAULT '',
            onboarding_method TEXT    NOT NULL DEFAULT '',
            is_active         INTEGER NOT NULL DEFAULT 1,
            status            TEXT    NOT NULL DEFAULT 'active',
            cooldown_until    TEXT,
            last_error        TEXT    NOT NULL DEFAULT '',
            session_string    TEXT    NOT NULL DEFAULT '',
            api_id            INTEGER,
            api_hash          TEXT,
            proxy_url         TEXT,
            last_used_at      TEXT,
            created_at        TEXT    NOT NULL,
            updated_at        TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS channels (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            type              TEXT    NOT NULL,
            identifier        TEXT    NOT NULL,
            title             TEXT    NOT NULL DEFAULT '',
            is_active         INTEGER NOT NULL DEFAULT 1,
            backfill_days     INTEGER NOT NULL DEFAULT 0,
            access_status     TEXT    NOT NULL DEFAULT 'active',
            last_checked_at   TEXT,
            cursor_message_id INTEGER NOT NULL DEFAULT 0,
            peer_id           INTEGER,
            last_error        TEXT    NOT NULL DEFAULT '',
            created_at        TEXT    NOT NULL,
            UNIQUE (type, identifier)
        );

        CREATE TABLE IF NOT EXISTS posts (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            channel_id   INTEGER NOT NULL REFERENCES channels(id),
            message_id   INTEGER NOT NULL,
            original_url TEXT    NOT NULL DEFAULT '',
            published_at TEXT    NOT NULL,
            text         TEXT    NOT NULL,
            created_at   TEXT    NOT NULL,
            UNIQUE (channel_id, message_id)
        );
        CREATE INDEX IF NOT EXISTS idx_posts_original_url
            ON posts(original_url);
        CREATE INDEX IF NOT EXISTS idx_posts_channel_published
            ON posts(channel_id, published_at);

        CREATE TABLE IF NOT EXISTS memberships (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id        INTEGER NOT NULL REFERENCES accounts(id),
            channel_id        INTEGER NOT NULL REFERENCES channels(id),
            status            TEXT    NOT NULL DEFAULT 'unknown',
            note              TEXT    NOT NULL DEFAULT '',
            join_requested_at TEXT,
            joined_at         TEXT,
            forbidden_at      TEXT,
            last_checked_at   TEXT,
            updated_at        TEXT    NOT NULL,
            UNIQUE (account_id, channel_id)
        );
        CREATE INDEX IF NOT EXISTS idx_memberships_channel
            ON memberships(channel_id);
        CREATE INDEX IF NOT EXISTS idx_memberships_account
            ON memberships(account_id);

        CREATE TABLE IF NOT EXISTS operators (
            chat_id        INTEGER PRIMARY KEY,
            username       TEXT    NOT NULL DEFAULT '',
            is_staff       INTEGER NOT NULL DEFAULT 0,
            notify_enabled INTEGER NOT NULL DEFAULT 0,
            created_at     TEXT    NOT NULL
        );
        ",
    )?;
    Ok(())
}
