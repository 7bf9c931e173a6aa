//! Shared cooldown, retry and sizing policy for the harvest tick.

/// After a join request was sent, only re-check dialogs this often.
pub const JOIN_REQUEST_RECHECK_SECS: i64 = 6 * 3600;
/// Retry window for memberships stuck in `error` / `unknown`.
pub const ERROR_RETRY_SECS: i64 = 30 * 60;
/// Re-verify `joined` memberships against the dialog list this often.
pub const JOINED_REFRESH_SECS: i64 = 24 * 3600;

/// `last_error` / membership note fields are truncated to this many chars.
pub const LAST_ERROR_MAX_CHARS: usize = 5000;

/// Dialog enumeration is aggressively rate-limited upstream; never ask for
/// more than this many dialogs in one listing.
pub const DIALOG_LIST_LIMIT: usize = 200;

/// Hard cap on messages fetched during a first-parse backfill.
pub const BACKFILL_FETCH_CAP: usize = 2000;
/// First parse without backfill only takes the latest tail.
pub const FIRST_PARSE_TAIL_LIMIT: usize = 20;

/// Accounts tried per channel within one tick before giving up.
pub const CHANNEL_ATTEMPT_CAP: usize = 8;

/// Cadence of the in-flight lock refresher.
pub const LOCK_REFRESH_INTERVAL_SECS: u64 = 30;

/// Ceiling for short upstream calls (auth probe, dialogs, join).
pub const UPSTREAM_SHORT_CALL_TIMEOUT_SECS: u64 = 30;
/// Ceiling for one channel attempt, sized for a full backfill iteration.
pub const UPSTREAM_ATTEMPT_TIMEOUT_SECS: u64 = 300;

/// Channels touched per membership-maintenance cycle.
pub const MAINTENANCE_CHANNEL_CAP: usize = 50;

/// Truncate an error string for storage in a `last_error` / note column.
pub fn truncate_error(s: &str) -> String {
    if s.chars().count() <= LAST_ERROR_MAX_CHARS {
        return s.to_string();
    }
    s.chars().take(LAST_ERROR_MAX_CHARS).collect()
}
