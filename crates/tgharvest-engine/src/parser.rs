//! Per-channel harvest pipeline: route to an account, ensure membership,
//! pull messages past the cursor, dedupe-insert, advance.
//!
//! Channels are independent but processed sequentially: predictable
//! upstream load matters more than tick latency. Every upstream failure is
//! converted into account/channel/membership state inside the attempt loop;
//! only config and store errors leave this module.

use chrono::{DateTime, Duration, Utc};
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use tgharvest_core::policy::{
    BACKFILL_FETCH_CAP, CHANNEL_ATTEMPT_CAP, FIRST_PARSE_TAIL_LIMIT,
    UPSTREAM_ATTEMPT_TIMEOUT_SECS,
};
use tgharvest_store::{
    Account, AccountStatus, Channel, ChannelAccessStatus, ChannelType, MembershipStatus, NewPost,
    Store,
};
use tgharvest_upstream::{
    ClientPool, Entity, EntityRef, HistoryRequest, UpstreamClient, UpstreamError,
};

use crate::dialogs::{find_in_dialogs, norm_username};
use crate::error::{EngineError, Result};
use crate::join::ensure_joined;
use crate::notify::Notify;

/// Parse-pass counters for tick telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseSummary {
    pub channels_total: u64,
    pub channels_checked: u64,
    pub posts_inserted: u64,
}

enum Attempt {
    Parsed { inserted: u64 },
    /// Exclude this account and try the next one.
    Skip(&'static str),
}

/// Parse new posts for all actionable channels, incrementally.
pub async fn parse_new_posts_once(
    store: &Store,
    pool: &ClientPool,
    notifier: &dyn Notify,
) -> Result<ParseSummary> {
    let channels = store.list_active_channels()?;
    let actionable: Vec<Channel> = channels
        .into_iter()
        .filter(|c| c.access_status != ChannelAccessStatus::Forbidden)
        .collect();

    let mut summary = ParseSummary {
        channels_total: actionable.len() as u64,
        ..ParseSummary::default()
    };
    if actionable.is_empty() {
        info!("parser: no actionable channels");
        return Ok(summary);
    }

    for channel in &actionable {
        summary.channels_checked += 1;
        match parse_channel(store, pool, notifier, channel).await {
            Ok(inserted) => summary.posts_inserted += inserted,
            Err(EngineError::Config(msg)) => {
                warn!(error = %msg, "parser: upstream config error, aborting pass");
                return Ok(summary);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(summary)
}

/// Attempt loop for one channel. Returns the number of inserted posts.
async fn parse_channel(
    store: &Store,
    pool: &ClientPool,
    notifier: &dyn Notify,
    channel: &Channel,
) -> Result<u64> {
    let mut excluded: Vec<i64> = Vec::new();
    let mut last_upstream: Option<UpstreamError> = None;
    let mut attempts = 0;

    while attempts < CHANNEL_ATTEMPT_CAP {
        attempts += 1;
        let now = Utc::now();

        let pick = store.pick_account_for_channel(channel, &excluded, now)?;
        let Some(account) = pick.account else {
            debug!(channel_id = channel.id, reason = pick.reason, "parser: no account to try");
            break;
        };
        let account_id = account.id;

        let attempt = pool
            .with_connected::<_, EngineError, _, _>(&account, |client| async move {
                let work = attempt_channel(store, client.as_ref(), channel, account_id, now);
                let deadline = std::time::Duration::from_secs(UPSTREAM_ATTEMPT_TIMEOUT_SECS);
                match tokio::time::timeout(deadline, work).await {
                    Ok(result) => result,
                    Err(_) => Ok(Attempt::Skip("upstream attempt timed out")),
                }
            })
            .await;

        match attempt {
            Ok(Attempt::Parsed { inserted }) => return Ok(inserted),
            Ok(Attempt::Skip(reason)) => {
                debug!(channel_id = channel.id, account_id, reason, "parser: trying next account");
                excluded.push(account_id);
            }
            Err(EngineError::Upstream(err)) => {
                excluded.push(account_id);
                react_to_upstream_error(store, notifier, &account, channel, &err, now).await?;
                last_upstream = Some(err);
            }
            Err(e) => return Err(e),
        }
    }

    let now = Utc::now();
    let (message, forbidden) = match &last_upstream {
        Some(err) => (
            format!("Resolve/access failed: {err}"),
            matches!(err, UpstreamError::ChannelForbidden(_)),
        ),
        None => (
            "Resolve/access failed: no eligible account".to_string(),
            false,
        ),
    };
    store.record_channel_error(channel.id, &message, forbidden, now)?;
    warn!(channel_id = channel.id, last_error = %message, "parser: channel not parsed");
    Ok(0)
}

/// One attempt with one connected account.
async fn attempt_channel(
    store: &Store,
    client: &dyn UpstreamClient,
    channel: &Channel,
    account_id: i64,
    now: DateTime<Utc>,
) -> Result<Attempt> {
    if !client.is_authorized().await? {
        return Ok(Attempt::Skip("session not authorized"));
    }

    let mut entity: Option<Entity> = None;

    match channel.kind {
        ChannelType::Private => {
            // Membership-implied lookup first; an entity in dialogs is also
            // routing evidence for the selector.
            entity = find_in_dialogs(client, channel).await?;
            if entity.is_some() {
                store.upsert_membership(
                    account_id,
                    channel.id,
                    MembershipStatus::Joined,
                    "entity found in dialogs",
                    now,
                )?;
            } else if let Some(peer_id) = channel.peer_id {
                entity = match client.resolve(&EntityRef::PeerId(peer_id)).await {
                    Ok(e) => Some(e),
                    Err(UpstreamError::NotFound(_)) => None,
                    Err(e) => return Err(e.into()),
                };
            }
        }
        ChannelType::Public => {
            // The hot path never enumerates dialogs for public channels:
            // resolve-by-username is cheap, dialog listing is rate-limited.
            let username = norm_username(&channel.identifier);
            if username.is_empty() {
                return Ok(Attempt::Skip("empty public identifier"));
            }
            entity = match client.resolve(&EntityRef::Username(username)).await {
                Ok(e) => Some(e),
                Err(UpstreamError::NotFound(_)) => None,
                Err(e) => return Err(e.into()),
            };
        }
    }

    if entity.is_none() && channel.kind == ChannelType::Private {
        // This account already has a request in flight: never re-import.
        let membership = store.get_membership(account_id, channel.id)?;
        if membership.is_some_and(|m| m.status.is_pending()) {
            return Ok(Attempt::Skip("invite request already pending for this account"));
        }
        // Fleet-wide guardrail: at most one outstanding invite request per
        // channel, or every ready account would spam the admins in turn.
        if store.has_pending_membership(channel.id)? {
            return Ok(Attempt::Skip("another account already has a pending invite"));
        }

        let report = ensure_joined(client, channel, false).await;

        let membership_status = crate::join::membership_for_access(report.access);
        store.upsert_membership(account_id, channel.id, membership_status, &report.note, now)?;
        store.apply_join_outcome(
            channel.id,
            report.access,
            if report.ok { "" } else { &report.note },
            report
                .entity
                .as_ref()
                .map(|e| e.title.as_str())
                .filter(|t| !t.is_empty()),
            report.entity.as_ref().map(|e| e.id),
            now,
        )?;

        if let Some(seconds) = report.retry_after {
            store.update_account_health(
                account_id,
                AccountStatus::Cooldown,
                &report.note,
                Some(now + Duration::seconds(seconds as i64)),
                now,
            )?;
            return Ok(Attempt::Skip("flood wait during join"));
        }
        if !report.ok {
            return Ok(Attempt::Skip("join did not grant membership"));
        }

        entity = report.entity;
        if entity.is_none() {
            entity = find_in_dialogs(client, channel).await?;
        }
    }

    let Some(entity) = entity else {
        return Ok(Attempt::Skip("entity unresolved"));
    };

    parse_messages(store, client, channel, &entity, account_id, now).await
}

/// Fetch past the cursor, build rows, dedupe-insert and advance. The insert
/// and the cursor move share one transaction.
async fn parse_messages(
    store: &Store,
    client: &dyn UpstreamClient,
    channel: &Channel,
    entity: &Entity,
    account_id: i64,
    now: DateTime<Utc>,
) -> Result<Attempt> {
    // Re-read: the row may have been disabled or removed since the snapshot.
    let Some(fresh) = store.get_channel(channel.id)? else {
        return Ok(Attempt::Parsed { inserted: 0 });
    };

    let mut cursor = fresh.cursor_message_id;
    // A cursor with zero stored posts means an earlier advance outran its
    // inserts; restart as a first parse instead of looping on "no inserts".
    if cursor > 0 && store.count_posts(channel.id)? == 0 {
        warn!(channel_id = channel.id, cursor, "parser: cursor without posts, treating as first parse");
        cursor = 0;
    }

    let backfill = cursor == 0 && fresh.backfill_days > 0;
    let request = if backfill {
        HistoryRequest {
            min_id: None,
            limit: Some(BACKFILL_FETCH_CAP),
            oldest_first: false,
        }
    } else if cursor == 0 {
        HistoryRequest {
            min_id: None,
            limit: Some(FIRST_PARSE_TAIL_LIMIT),
            oldest_first: false,
        }
    } else {
        HistoryRequest {
            min_id: Some(cursor),
            limit: None,
            oldest_first: true,
        }
    };
    let cutoff = backfill.then(|| now - Duration::days(i64::from(fresh.backfill_days)));

    let mut rows: Vec<NewPost> = Vec::new();
    let mut max_seen = cursor;
    let mut fetched = 0u64;

    let mut messages = client.iter_messages(entity, request);
    while let Some(item) = messages.next().await {
        let message = item?;
        fetched += 1;

        if let Some(cutoff) = cutoff {
            if message.published_at < cutoff {
                break;
            }
        }

        let text = message.text.trim();
        if text.is_empty() {
            continue;
        }
        if message.id <= cursor {
            continue;
        }

        max_seen = max_seen.max(message.id);
        rows.push(NewPost {
            channel_id: channel.id,
            message_id: message.id,
            original_url: build_message_url(&fresh, entity, message.id),
            published_at: message.published_at,
            text: text.to_string(),
        });
    }

    let access = (fresh.access_status != ChannelAccessStatus::Joined)
        .then_some(ChannelAccessStatus::Joined);
    let title = Some(entity.title.as_str()).filter(|t| !t.is_empty());
    let peer_id = (entity.id > 0).then_some(entity.id);

    let inserted = store.commit_parse(channel.id, &rows, max_seen, access, title, peer_id, now)?;

    // Routing evidence: this account can read the channel.
    store.upsert_membership(account_id, channel.id, MembershipStatus::Joined, "parsed_ok", now)?;
    store.mark_account_used(account_id, now)?;

    info!(
        channel_id = channel.id,
        identifier = %fresh.identifier,
        cursor_from = cursor,
        cursor_to = max_seen,
        fetched,
        inserted,
        account_id,
        "parser: channel parsed"
    );
    Ok(Attempt::Parsed { inserted })
}

/// Map an upstream failure onto account/membership state. The account was
/// already excluded; the loop moves on to the next candidate.
async fn react_to_upstream_error(
    store: &Store,
    notifier: &dyn Notify,
    account: &Account,
    channel: &Channel,
    err: &UpstreamError,
    now: DateTime<Utc>,
) -> Result<()> {
    match err {
        UpstreamError::FloodWait { seconds } => {
            store.update_account_health(
                account.id,
                AccountStatus::Cooldown,
                &format!("FloodWait: {seconds}s"),
                Some(now + Duration::seconds(*seconds as i64)),
                now,
            )?;
        }
        UpstreamError::Frozen(name) | UpstreamError::Banned(name) => {
            store.quarantine_account(
                account.id,
                AccountStatus::Banned,
                &format!("Frozen/banned: {name}"),
                now,
            )?;
            warn!(account_id = account.id, "parser: quarantined banned account");
            quarantine_alert(notifier, account, name).await;
        }
        UpstreamError::Deactivated(name) => {
            store.quarantine_account(
                account.id,
                AccountStatus::Forbidden,
                &format!("Deactivated: {name}"),
                now,
            )?;
            warn!(account_id = account.id, "parser: quarantined deactivated account");
            quarantine_alert(notifier, account, name).await;
        }
        UpstreamError::ChannelForbidden(name) => {
            store.upsert_membership(
                account.id,
                channel.id,
                MembershipStatus::Forbidden,
                name,
                now,
            )?;
        }
        _ => {}
    }
    Ok(())
}

async fn quarantine_alert(notifier: &dyn Notify, account: &Account, reason: &str) {
    let text = format!(
        "tgharvest: account quarantined ({reason}). id={} phone={}",
        account.id, account.phone_number
    );
    notifier.notify_operator(&text).await;
    notifier.notify_staff(&text).await;
}

/// Canonical message URL: public channels get the stable username form,
/// private channels the numeric `/c/` form, anything else stays empty.
fn build_message_url(channel: &Channel, entity: &Entity, message_id: i64) -> String {
    if channel.kind == ChannelType::Public {
        let username = entity
            .username
            .clone()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| norm_username(&channel.identifier));
        if !username.is_empty() {
            return format!("https://t.me/{username}/{message_id}");
        }
    }
    if entity.id > 0 {
        return format!("https://t.me/c/{}/{}", entity.id, message_id);
    }
    String::new()
}
