use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, instrument};

use tgharvest_core::policy::truncate_error;

use crate::db::init_db;
use crate::error::Result;
use crate::types::{
    Account, AccountStatus, Channel, ChannelAccessStatus, ChannelType, Membership,
    MembershipStatus, NewAccount, NewChannel, NewPost, Pick, Post,
};

const ACCOUNT_COLS: &str = "id, label, phone_number, onboarding_method, is_active, status, \
     cooldown_until, last_error, session_string, api_id, api_hash, proxy_url, \
     last_used_at, created_at, updated_at";

const CHANNEL_COLS: &str = "id, type, identifier, title, is_active, backfill_days, \
     access_status, last_checked_at, cursor_message_id, peer_id, last_error, created_at";

const MEMBERSHIP_COLS: &str = "id, account_id, channel_id, status, note, join_requested_at, \
     joined_at, forbidden_at, last_checked_at, updated_at";

/// Thread-safe handle over the harvester state.
///
/// Wraps a single SQLite connection in a `Mutex`. The tick is work-sequential
/// so a single connection is sufficient; a pool would only add contention.
pub struct Store {
    db: Mutex<Connection>,
}

impl Store {
    /// Wrap a connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Open (or create) the database file at `path`.
    pub fn open(path: &str) -> Result<Self> {
        Self::new(Connection::open(path).map_err(crate::error::StoreError::Database)?)
    }

    /// Fresh in-memory database. Used by tests and `--adapter loopback` runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory().map_err(crate::error::StoreError::Database)?)
    }

    // --- accounts ----------------------------------------------------------

    /// Insert an account row produced by onboarding and read it back.
    pub fn create_account(&self, new: &NewAccount, now: DateTime<Utc>) -> Result<Account> {
        let db = self.db.lock().unwrap();
        let now_s = now.to_rfc3339();
        db.execute(
            "INSERT INTO accounts
             (label, phone_number, onboarding_method, session_string,
              api_id, api_hash, proxy_url, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                new.label,
                new.phone_number,
                new.onboarding_method,
                new.session_string,
                new.api_id,
                new.api_hash,
                new.proxy_url,
                now_s
            ],
        )?;
        let id = db.last_insert_rowid();
        let account = db.query_row(
            &format!("SELECT {ACCOUNT_COLS} FROM accounts WHERE id = ?1"),
            params![id],
            row_to_account,
        )?;
        Ok(account)
    }

    /// Snapshot of operator-enabled accounts, ordered by id.
    pub fn list_active_accounts(&self) -> Result<Vec<Account>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {ACCOUNT_COLS} FROM accounts WHERE is_active = 1 ORDER BY id"
        ))?;
        let rows = stmt.query_map([], row_to_account)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_account(&self, id: i64) -> Result<Option<Account>> {
        let db = self.db.lock().unwrap();
        let account = db
            .query_row(
                &format!("SELECT {ACCOUNT_COLS} FROM accounts WHERE id = ?1"),
                params![id],
                row_to_account,
            )
            .optional()?;
        Ok(account)
    }

    /// Atomic health update. Missing rows are ignored; the account may have
    /// been soft-removed by the operator mid-tick.
    #[instrument(skip(self, last_error))]
    pub fn update_account_health(
        &self,
        id: i64,
        status: AccountStatus,
        last_error: &str,
        cooldown_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE accounts
             SET status = ?2, last_error = ?3, cooldown_until = ?4, updated_at = ?5
             WHERE id = ?1",
            params![
                id,
                status.to_string(),
                truncate_error(last_error),
                cooldown_until.map(|t| t.to_rfc3339()),
                now.to_rfc3339()
            ],
        )?;
        if n == 0 {
            debug!(account_id = id, "health update on missing account");
        }
        Ok(())
    }

    /// Take an account out of rotation permanently (`banned` / `forbidden`).
    /// Clears the operator-active flag and any cooldown.
    pub fn quarantine_account(
        &self,
        id: i64,
        status: AccountStatus,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE accounts
             SET status = ?2, is_active = 0, cooldown_until = NULL,
                 last_error = ?3, updated_at = ?4
             WHERE id = ?1",
            params![id, status.to_string(), truncate_error(note), now.to_rfc3339()],
        )?;
        Ok(())
    }

    /// LRU stamp; written only after a successful parse.
    pub fn mark_account_used(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE accounts SET last_used_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![id, now.to_rfc3339()],
        )?;
        Ok(())
    }

    // --- channels ----------------------------------------------------------

    /// Insert a channel row registered by the operator and read it back.
    pub fn create_channel(&self, new: &NewChannel, now: DateTime<Utc>) -> Result<Channel> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO channels (type, identifier, title, backfill_days, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                new.kind.to_string(),
                new.identifier,
                new.title,
                new.backfill_days,
                now.to_rfc3339()
            ],
        )?;
        let id = db.last_insert_rowid();
        let channel = db.query_row(
            &format!("SELECT {CHANNEL_COLS} FROM channels WHERE id = ?1"),
            params![id],
            row_to_channel,
        )?;
        Ok(channel)
    }

    /// Snapshot of operator-enabled channels, ordered by id.
    pub fn list_active_channels(&self) -> Result<Vec<Channel>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {CHANNEL_COLS} FROM channels WHERE is_active = 1 ORDER BY id"
        ))?;
        let rows = stmt.query_map([], row_to_channel)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_channel(&self, id: i64) -> Result<Option<Channel>> {
        let db = self.db.lock().unwrap();
        let channel = db
            .query_row(
                &format!("SELECT {CHANNEL_COLS} FROM channels WHERE id = ?1"),
                params![id],
                row_to_channel,
            )
            .optional()?;
        Ok(channel)
    }

    /// Persist a join attempt's outcome on the channel row.
    pub fn apply_join_outcome(
        &self,
        channel_id: i64,
        access: Option<ChannelAccessStatus>,
        last_error: &str,
        title: Option<&str>,
        peer_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE channels
             SET last_checked_at = ?2,
                 access_status   = COALESCE(?3, access_status),
                 last_error      = ?4,
                 title           = COALESCE(?5, title),
                 peer_id         = COALESCE(?6, peer_id)
             WHERE id = ?1",
            params![
                channel_id,
                now.to_rfc3339(),
                access.map(|a| a.to_string()),
                truncate_error(last_error),
                title,
                peer_id
            ],
        )?;
        Ok(())
    }

    /// Advance the channel after a successful parse step.
    ///
    /// The cursor is clamped to be non-decreasing at the SQL level, so no
    /// caller can ever move it backwards.
    pub fn update_channel_after_parse(
        &self,
        channel_id: i64,
        cursor: i64,
        now: DateTime<Utc>,
        access: Option<ChannelAccessStatus>,
        title: Option<&str>,
        peer_id: Option<i64>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        update_channel_after_parse_tx(&db, channel_id, cursor, now, access, title, peer_id)
    }

    /// Record a failed tick on the channel; optionally flag it forbidden.
    pub fn record_channel_error(
        &self,
        channel_id: i64,
        last_error: &str,
        mark_forbidden: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE channels
             SET last_error = ?2, last_checked_at = ?3,
                 access_status = CASE WHEN ?4 THEN 'forbidden' ELSE access_status END
             WHERE id = ?1",
            params![
                channel_id,
                truncate_error(last_error),
                now.to_rfc3339(),
                mark_forbidden
            ],
        )?;
        Ok(())
    }

    // --- posts -------------------------------------------------------------

    /// Conflict-ignoring bulk insert. Returns the number of rows actually
    /// inserted, counted from returned keys, never the driver's
    /// affected-rows figure, which is unreliable for conflict-ignore.
    pub fn bulk_insert_posts(&self, rows: &[NewPost], now: DateTime<Utc>) -> Result<u64> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let inserted = insert_posts_tx(&tx, rows, now)?;
        tx.commit()?;
        Ok(inserted)
    }

    /// Insert the fetched rows and advance the cursor in one transaction, so
    /// a crash can never leave the cursor ahead of the stored posts.
    #[allow(clippy::too_many_arguments)]
    pub fn commit_parse(
        &self,
        channel_id: i64,
        rows: &[NewPost],
        cursor: i64,
        access: Option<ChannelAccessStatus>,
        title: Option<&str>,
        peer_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let inserted = insert_posts_tx(&tx, rows, now)?;
        update_channel_after_parse_tx(&tx, channel_id, cursor, now, access, title, peer_id)?;
        tx.commit()?;
        Ok(inserted)
    }

    /// Newest stored posts for a channel; the read side of the query surface.
    pub fn list_recent_posts(&self, channel_id: i64, limit: usize) -> Result<Vec<Post>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, channel_id, message_id, original_url, published_at, text, created_at
             FROM posts
             WHERE channel_id = ?1
             ORDER BY published_at DESC, message_id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![channel_id, limit as i64], row_to_post)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn count_posts(&self, channel_id: i64) -> Result<u64> {
        let db = self.db.lock().unwrap();
        let n: i64 = db.query_row(
            "SELECT COUNT(*) FROM posts WHERE channel_id = ?1",
            params![channel_id],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    // --- memberships -------------------------------------------------------

    /// Insert-or-update the (account, channel) relation.
    ///
    /// First-transition stamps (`join_requested_at`, `joined_at`,
    /// `forbidden_at`) are preserved once set.
    pub fn upsert_membership(
        &self,
        account_id: i64,
        channel_id: i64,
        status: MembershipStatus,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now_s = now.to_rfc3339();
        let requested = status.is_pending().then(|| now_s.clone());
        let joined = (status == MembershipStatus::Joined).then(|| now_s.clone());
        let forbidden = (status == MembershipStatus::Forbidden).then(|| now_s.clone());
        db.execute(
            "INSERT INTO memberships
             (account_id, channel_id, status, note,
              join_requested_at, joined_at, forbidden_at, last_checked_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT (account_id, channel_id) DO UPDATE SET
               status            = excluded.status,
               note              = excluded.note,
               last_checked_at   = excluded.last_checked_at,
               updated_at        = excluded.updated_at,
               join_requested_at = COALESCE(memberships.join_requested_at, excluded.join_requested_at),
               joined_at         = COALESCE(memberships.joined_at, excluded.joined_at),
               forbidden_at      = COALESCE(memberships.forbidden_at, excluded.forbidden_at)",
            params![
                account_id,
                channel_id,
                status.to_string(),
                truncate_error(note),
                requested,
                joined,
                forbidden,
                now_s
            ],
        )?;
        Ok(())
    }

    pub fn get_membership(
        &self,
        account_id: i64,
        channel_id: i64,
    ) -> Result<Option<Membership>> {
        let db = self.db.lock().unwrap();
        let membership = db
            .query_row(
                &format!(
                    "SELECT {MEMBERSHIP_COLS} FROM memberships
                     WHERE account_id = ?1 AND channel_id = ?2"
                ),
                params![account_id, channel_id],
                row_to_membership,
            )
            .optional()?;
        Ok(membership)
    }

    pub fn list_channel_memberships(&self, channel_id: i64) -> Result<Vec<Membership>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {MEMBERSHIP_COLS} FROM memberships
             WHERE channel_id = ?1 ORDER BY account_id"
        ))?;
        let rows = stmt.query_map(params![channel_id], row_to_membership)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Guardrail query: does ANY account hold an outstanding invite request
    /// for this channel?
    pub fn has_pending_membership(&self, channel_id: i64) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let found: Option<i64> = db
            .query_row(
                "SELECT id FROM memberships
                 WHERE channel_id = ?1
                   AND status IN ('join_requested', 'pending_approval')
                 LIMIT 1",
                params![channel_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // --- selector ----------------------------------------------------------

    /// Pick one ready account for `channel`, excluding `excluded`.
    ///
    /// Ready: operator-active, status `active`, cooldown elapsed, session
    /// present. For private channels, accounts with a `forbidden` membership
    /// are dropped and joined memberships sort first. Rotation is LRU
    /// (`last_used_at` ascending, never-used first), ties broken by id.
    pub fn pick_account_for_channel(
        &self,
        channel: &Channel,
        excluded: &[i64],
        now: DateTime<Utc>,
    ) -> Result<Pick> {
        let db = self.db.lock().unwrap();
        let private = channel.kind == ChannelType::Private;

        let mut sql = format!(
            "SELECT {} FROM accounts a",
            ACCOUNT_COLS
                .split(", ")
                .map(|c| format!("a.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut binds: Vec<Value> = Vec::new();

        if private {
            sql.push_str(
                " LEFT JOIN memberships m
                    ON m.account_id = a.id AND m.channel_id = ?",
            );
            binds.push(Value::Integer(channel.id));
        }

        sql.push_str(
            " WHERE a.is_active = 1
                AND a.status = 'active'
                AND (a.cooldown_until IS NULL OR a.cooldown_until <= ?)
                AND a.session_string != ''",
        );
        binds.push(Value::Text(now.to_rfc3339()));

        if private {
            sql.push_str(" AND (m.id IS NULL OR m.status != 'forbidden')");
        }
        if !excluded.is_empty() {
            sql.push_str(" AND a.id NOT IN (");
            sql.push_str(&vec!["?"; excluded.len()].join(", "));
            sql.push(')');
            binds.extend(excluded.iter().map(|id| Value::Integer(*id)));
        }

        if private {
            sql.push_str(" ORDER BY CASE WHEN m.status = 'joined' THEN 0 ELSE 1 END,");
        } else {
            sql.push_str(" ORDER BY");
        }
        sql.push_str(" a.last_used_at ASC NULLS FIRST, a.id ASC LIMIT 1");

        let mut stmt = db.prepare(&sql)?;
        let account = stmt
            .query_row(params_from_iter(binds), row_to_account)
            .optional()?;

        Ok(match account {
            Some(account) => Pick {
                account: Some(account),
                reason: "picked",
            },
            None => Pick {
                account: None,
                reason: "no_ready_accounts",
            },
        })
    }

    // --- operators ---------------------------------------------------------

    /// Register or update a bot-UI operator (external surface writes these;
    /// kept here so the notifier and tests share one code path).
    pub fn upsert_operator(
        &self,
        chat_id: i64,
        username: &str,
        is_staff: bool,
        notify_enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO operators (chat_id, username, is_staff, notify_enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (chat_id) DO UPDATE SET
               username = excluded.username,
               is_staff = excluded.is_staff,
               notify_enabled = excluded.notify_enabled",
            params![chat_id, username, is_staff, notify_enabled, now.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Chat ids of staff operators who opted into broadcasts.
    pub fn list_notify_recipients(&self) -> Result<Vec<i64>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT chat_id FROM operators
             WHERE is_staff = 1 AND notify_enabled = 1
             ORDER BY chat_id",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

// ---------------------------------------------------------------------------
// Transaction bodies shared by the public wrappers
// ---------------------------------------------------------------------------

fn insert_posts_tx(conn: &Connection, rows: &[NewPost], now: DateTime<Utc>) -> Result<u64> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO posts (channel_id, message_id, original_url, published_at, text, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (channel_id, message_id) DO NOTHING
         RETURNING id",
    )?;
    let now_s = now.to_rfc3339();
    let mut inserted = 0u64;
    for row in rows {
        let id: Option<i64> = stmt
            .query_row(
                params![
                    row.channel_id,
                    row.message_id,
                    row.original_url,
                    row.published_at.to_rfc3339(),
                    row.text,
                    now_s
                ],
                |r| r.get(0),
            )
            .optional()?;
        if id.is_some() {
            inserted += 1;
        }
    }
    Ok(inserted)
}

fn update_channel_after_parse_tx(
    conn: &Connection,
    channel_id: i64,
    cursor: i64,
    now: DateTime<Utc>,
    access: Option<ChannelAccessStatus>,
    title: Option<&str>,
    peer_id: Option<i64>,
) -> Result<()> {
    conn.execute(
        "UPDATE channels
         SET cursor_message_id = MAX(cursor_message_id, ?2),
             last_checked_at   = ?3,
             last_error        = '',
             access_status     = COALESCE(?4, access_status),
             title             = COALESCE(?5, title),
             peer_id           = COALESCE(?6, peer_id)
         WHERE id = ?1",
        params![
            channel_id,
            cursor,
            now.to_rfc3339(),
            access.map(|a| a.to_string()),
            title,
            peer_id
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------------

fn parse_ts(idx: usize, s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn ts_req(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_ts(idx, s)
}

fn ts_opt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| parse_ts(idx, s)).transpose()
}

fn parse_tag<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let s: String = row.get(idx)?;
    s.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn row_to_account(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        label: row.get(1)?,
        phone_number: row.get(2)?,
        onboarding_method: row.get(3)?,
        is_active: row.get(4)?,
        status: parse_tag(row, 5)?,
        cooldown_until: ts_opt(row, 6)?,
        last_error: row.get(7)?,
        session_string: row.get(8)?,
        api_id: row.get(9)?,
        api_hash: row.get(10)?,
        proxy_url: row.get(11)?,
        last_used_at: ts_opt(row, 12)?,
        created_at: ts_req(row, 13)?,
        updated_at: ts_req(row, 14)?,
    })
}

fn row_to_channel(row: &Row<'_>) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: row.get(0)?,
        kind: parse_tag(row, 1)?,
        identifier: row.get(2)?,
        title: row.get(3)?,
        is_active: row.get(4)?,
        backfill_days: row.get(5)?,
        access_status: parse_tag(row, 6)?,
        last_checked_at: ts_opt(row, 7)?,
        cursor_message_id: row.get(8)?,
        peer_id: row.get(9)?,
        last_error: row.get(10)?,
        created_at: ts_req(row, 11)?,
    })
}

fn row_to_post(row: &Row<'_>) -> rusqlite::Result<Post> {
    Ok(Post {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        message_id: row.get(2)?,
        original_url: row.get(3)?,
        published_at: ts_req(row, 4)?,
        text: row.get(5)?,
        created_at: ts_req(row, 6)?,
    })
}

fn row_to_membership(row: &Row<'_>) -> rusqlite::Result<Membership> {
    Ok(Membership {
        id: row.get(0)?,
        account_id: row.get(1)?,
        channel_id: row.get(2)?,
        status: parse_tag(row, 3)?,
        note: row.get(4)?,
        join_requested_at: ts_opt(row, 5)?,
        joined_at: ts_opt(row, 6)?,
        forbidden_at: ts_opt(row, 7)?,
        last_checked_at: ts_opt(row, 8)?,
        updated_at: ts_req(row, 9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn seed_account(s: &Store, label: &str) -> Account {
        s.create_account(
            &NewAccount {
                label: label.to_string(),
                session_string: format!("sess-{label}"),
                ..NewAccount::default()
            },
            now(),
        )
        .unwrap()
    }

    fn seed_channel(s: &Store, kind: ChannelType, identifier: &str) -> Channel {
        s.create_channel(
            &NewChannel {
                kind,
                identifier: identifier.to_string(),
                title: String::new(),
                backfill_days: 0,
            },
            now(),
        )
        .unwrap()
    }

    fn post(channel_id: i64, message_id: i64, text: &str) -> NewPost {
        NewPost {
            channel_id,
            message_id,
            original_url: format!("https://t.me/demo/{message_id}"),
            published_at: now(),
            text: text.to_string(),
        }
    }

    #[test]
    fn selector_prefers_least_recently_used() {
        let s = store();
        let a1 = seed_account(&s, "a1");
        let a2 = seed_account(&s, "a2");
        let ch = seed_channel(&s, ChannelType::Public, "demo");

        // a1 used more recently than a2.
        s.mark_account_used(a1.id, now()).unwrap();
        s.mark_account_used(a2.id, now() - Duration::hours(2)).unwrap();

        let pick = s.pick_account_for_channel(&ch, &[], now()).unwrap();
        assert_eq!(pick.account.unwrap().id, a2.id);
    }

    #[test]
    fn selector_never_used_comes_first_then_id_breaks_ties() {
        let s = store();
        let a1 = seed_account(&s, "a1");
        let a2 = seed_account(&s, "a2");
        let ch = seed_channel(&s, ChannelType::Public, "demo");

        s.mark_account_used(a2.id, now() - Duration::days(30)).unwrap();
        let pick = s.pick_account_for_channel(&ch, &[], now()).unwrap();
        assert_eq!(pick.account.unwrap().id, a1.id, "never-used sorts first");

        // Both never used → lowest id wins.
        let s2 = store();
        let b1 = seed_account(&s2, "b1");
        let _b2 = seed_account(&s2, "b2");
        let ch2 = seed_channel(&s2, ChannelType::Public, "demo");
        let pick = s2.pick_account_for_channel(&ch2, &[], now()).unwrap();
        assert_eq!(pick.account.unwrap().id, b1.id);
    }

    #[test]
    fn selector_respects_cooldown_until_it_elapses() {
        let s = store();
        let a1 = seed_account(&s, "a1");
        let ch = seed_channel(&s, ChannelType::Public, "demo");

        s.update_account_health(
            a1.id,
            AccountStatus::Active,
            "",
            Some(now() + Duration::seconds(120)),
            now(),
        )
        .unwrap();
        let pick = s.pick_account_for_channel(&ch, &[], now()).unwrap();
        assert!(pick.account.is_none());
        assert_eq!(pick.reason, "no_ready_accounts");

        // Elapsed cooldown no longer blocks.
        let pick = s
            .pick_account_for_channel(&ch, &[], now() + Duration::seconds(121))
            .unwrap();
        assert_eq!(pick.account.unwrap().id, a1.id);
    }

    #[test]
    fn quarantine_is_sticky() {
        let s = store();
        let a1 = seed_account(&s, "a1");
        let ch = seed_channel(&s, ChannelType::Public, "demo");

        s.quarantine_account(a1.id, AccountStatus::Banned, "frozen", now())
            .unwrap();
        // Even far in the future, a banned account never comes back.
        let pick = s
            .pick_account_for_channel(&ch, &[], now() + Duration::days(365))
            .unwrap();
        assert!(pick.account.is_none());

        let acc = s.get_account(a1.id).unwrap().unwrap();
        assert_eq!(acc.status, AccountStatus::Banned);
        assert!(!acc.is_active);
        assert!(acc.cooldown_until.is_none());
    }

    #[test]
    fn selector_skips_accounts_without_session() {
        let s = store();
        let _a1 = s
            .create_account(&NewAccount::default(), now())
            .unwrap();
        let ch = seed_channel(&s, ChannelType::Public, "demo");
        let pick = s.pick_account_for_channel(&ch, &[], now()).unwrap();
        assert!(pick.account.is_none());
    }

    #[test]
    fn selector_excludes_listed_accounts() {
        let s = store();
        let a1 = seed_account(&s, "a1");
        let a2 = seed_account(&s, "a2");
        let ch = seed_channel(&s, ChannelType::Public, "demo");

        let pick = s.pick_account_for_channel(&ch, &[a1.id], now()).unwrap();
        assert_eq!(pick.account.unwrap().id, a2.id);
        let pick = s
            .pick_account_for_channel(&ch, &[a1.id, a2.id], now())
            .unwrap();
        assert!(pick.account.is_none());
    }

    #[test]
    fn selector_private_prefers_joined_membership() {
        let s = store();
        let a1 = seed_account(&s, "a1");
        let a2 = seed_account(&s, "a2");
        let ch = seed_channel(&s, ChannelType::Private, "+abcdef");

        // a2 is already in the channel; a1 has the better LRU position.
        s.mark_account_used(a2.id, now()).unwrap();
        s.upsert_membership(a2.id, ch.id, MembershipStatus::Joined, "parsed_ok", now())
            .unwrap();

        let pick = s.pick_account_for_channel(&ch, &[], now()).unwrap();
        assert_eq!(pick.account.unwrap().id, a2.id, "membership beats LRU");
        let _ = a1;
    }

    #[test]
    fn selector_private_drops_forbidden_membership() {
        let s = store();
        let a1 = seed_account(&s, "a1");
        let a2 = seed_account(&s, "a2");
        let ch = seed_channel(&s, ChannelType::Private, "+abcdef");

        s.upsert_membership(a1.id, ch.id, MembershipStatus::Forbidden, "banned in channel", now())
            .unwrap();
        let pick = s.pick_account_for_channel(&ch, &[], now()).unwrap();
        assert_eq!(pick.account.unwrap().id, a2.id);
    }

    #[test]
    fn post_insert_is_idempotent_and_counts_new_rows_only() {
        let s = store();
        let ch = seed_channel(&s, ChannelType::Public, "demo");

        let first = s
            .bulk_insert_posts(
                &[post(ch.id, 100, "a"), post(ch.id, 101, "b"), post(ch.id, 102, "c")],
                now(),
            )
            .unwrap();
        assert_eq!(first, 3);

        // Overlapping batch: 102 is a duplicate, 103/104 are new.
        let second = s
            .bulk_insert_posts(
                &[post(ch.id, 102, "c"), post(ch.id, 103, "d"), post(ch.id, 104, "e")],
                now(),
            )
            .unwrap();
        assert_eq!(second, 2);
        assert_eq!(s.count_posts(ch.id).unwrap(), 5);
    }

    #[test]
    fn recent_posts_come_back_newest_first() {
        let s = store();
        let ch = seed_channel(&s, ChannelType::Public, "demo");
        s.bulk_insert_posts(
            &[post(ch.id, 100, "a"), post(ch.id, 101, "b"), post(ch.id, 102, "c")],
            now(),
        )
        .unwrap();

        let posts = s.list_recent_posts(ch.id, 2).unwrap();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].message_id, 102);
        assert_eq!(posts[1].message_id, 101);
        assert_eq!(posts[0].original_url, "https://t.me/demo/102");
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let s = store();
        let ch = seed_channel(&s, ChannelType::Public, "demo");

        s.update_channel_after_parse(ch.id, 102, now(), None, None, None)
            .unwrap();
        s.update_channel_after_parse(ch.id, 50, now(), None, None, None)
            .unwrap();
        let ch = s.get_channel(ch.id).unwrap().unwrap();
        assert_eq!(ch.cursor_message_id, 102);
    }

    #[test]
    fn commit_parse_inserts_and_advances_atomically() {
        let s = store();
        let ch = seed_channel(&s, ChannelType::Public, "demo");

        let inserted = s
            .commit_parse(
                ch.id,
                &[post(ch.id, 100, "a"), post(ch.id, 101, "b")],
                101,
                Some(ChannelAccessStatus::Joined),
                Some("Demo Channel"),
                Some(4242),
                now(),
            )
            .unwrap();
        assert_eq!(inserted, 2);

        let ch = s.get_channel(ch.id).unwrap().unwrap();
        assert_eq!(ch.cursor_message_id, 101);
        assert_eq!(ch.access_status, ChannelAccessStatus::Joined);
        assert_eq!(ch.title, "Demo Channel");
        assert_eq!(ch.peer_id, Some(4242));
        assert_eq!(ch.last_error, "");
        assert!(ch.last_checked_at.is_some());
    }

    #[test]
    fn membership_upsert_preserves_first_transition_stamps() {
        let s = store();
        let a1 = seed_account(&s, "a1");
        let ch = seed_channel(&s, ChannelType::Private, "+abcdef");

        let t0 = now();
        s.upsert_membership(a1.id, ch.id, MembershipStatus::Joined, "joined", t0)
            .unwrap();
        s.upsert_membership(
            a1.id,
            ch.id,
            MembershipStatus::Joined,
            "parsed_ok",
            t0 + Duration::hours(1),
        )
        .unwrap();

        let m = s.get_membership(a1.id, ch.id).unwrap().unwrap();
        assert_eq!(m.status, MembershipStatus::Joined);
        assert_eq!(m.note, "parsed_ok");
        assert_eq!(m.joined_at.unwrap().to_rfc3339(), t0.to_rfc3339());
    }

    #[test]
    fn pending_guardrail_sees_both_pending_states() {
        let s = store();
        let a1 = seed_account(&s, "a1");
        let a2 = seed_account(&s, "a2");
        let ch = seed_channel(&s, ChannelType::Private, "+abcdef");

        assert!(!s.has_pending_membership(ch.id).unwrap());
        s.upsert_membership(a1.id, ch.id, MembershipStatus::JoinRequested, "", now())
            .unwrap();
        assert!(s.has_pending_membership(ch.id).unwrap());

        s.upsert_membership(a1.id, ch.id, MembershipStatus::PendingApproval, "", now())
            .unwrap();
        assert!(s.has_pending_membership(ch.id).unwrap());
        let _ = a2;
    }

    #[test]
    fn notify_recipients_are_opted_in_staff_only() {
        let s = store();
        s.upsert_operator(10, "boss", true, true, now()).unwrap();
        s.upsert_operator(20, "staff-quiet", true, false, now()).unwrap();
        s.upsert_operator(30, "guest", false, true, now()).unwrap();

        assert_eq!(s.list_notify_recipients().unwrap(), vec![10]);
    }

    #[test]
    fn last_error_is_truncated() {
        let s = store();
        let a1 = seed_account(&s, "a1");
        let long = "e".repeat(9000);
        s.update_account_health(a1.id, AccountStatus::Error, &long, None, now())
            .unwrap();
        let acc = s.get_account(a1.id).unwrap().unwrap();
        assert_eq!(acc.last_error.chars().count(), 5000);
    }
}
