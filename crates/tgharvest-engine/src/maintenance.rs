//! Membership maintenance: a bounded best-effort cycle that advances pending
//! memberships and re-verifies joined ones, so parsing doesn't waste its
//! attempts on join work.
//!
//! Invite requests are never re-sent here. Once upstream has a pending
//! request, the only legal move is to watch the dialog list for approval.

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use tgharvest_core::policy::{
    ERROR_RETRY_SECS, JOINED_REFRESH_SECS, JOIN_REQUEST_RECHECK_SECS,
    UPSTREAM_SHORT_CALL_TIMEOUT_SECS,
};
use tgharvest_store::{
    Account, AccountStatus, Channel, ChannelAccessStatus, MembershipStatus, Store,
};
use tgharvest_upstream::{ClientPool, UpstreamError};

use crate::dialogs::find_in_dialogs;
use crate::error::{EngineError, Result};
use crate::join::{ensure_joined, membership_for_access};

/// Maintenance counters for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceSummary {
    pub channels_total: u64,
    pub channels_touched: u64,
    pub memberships_updated: u64,
    pub accounts_cooldown_marked: u64,
}

fn short_call_deadline() -> std::time::Duration {
    std::time::Duration::from_secs(UPSTREAM_SHORT_CALL_TIMEOUT_SECS)
}

fn due(last_checked: Option<DateTime<Utc>>, every_secs: i64, now: DateTime<Utc>) -> bool {
    match last_checked {
        None => true,
        Some(t) => t + Duration::seconds(every_secs) <= now,
    }
}

/// Run one bounded maintenance cycle over at most `max_channels` channels.
pub async fn ensure_membership_once(
    store: &Store,
    pool: &ClientPool,
    max_channels: usize,
) -> Result<MaintenanceSummary> {
    let now = Utc::now();

    let mut channels = store.list_active_channels()?;
    channels.truncate(max_channels);
    let accounts = store.list_active_accounts()?;

    let mut summary = MaintenanceSummary {
        channels_total: channels.len() as u64,
        ..MaintenanceSummary::default()
    };
    if channels.is_empty() || accounts.is_empty() {
        return Ok(summary);
    }

    for channel in &channels {
        // Deterministic pick: first ready account by id. LRU rotation only
        // matters for parse load; maintenance calls are cheap.
        let Some(account) = accounts.iter().find(|a| a.is_ready(now)) else {
            continue;
        };
        summary.channels_touched += 1;

        let membership = store.get_membership(account.id, channel.id)?;
        let status = membership
            .as_ref()
            .map(|m| m.status)
            .unwrap_or(MembershipStatus::Unknown);
        let note = membership.as_ref().map(|m| m.note.clone()).unwrap_or_default();
        let last_checked = membership.as_ref().and_then(|m| m.last_checked_at);

        let step = match status {
            s if s.is_pending() => {
                if !due(last_checked, JOIN_REQUEST_RECHECK_SECS, now) {
                    continue;
                }
                recheck_pending(store, pool, account, channel, status, &note, now, &mut summary)
                    .await
            }
            MembershipStatus::Joined => {
                if !due(last_checked, JOINED_REFRESH_SECS, now) {
                    continue;
                }
                refresh_joined(store, pool, account, channel, &note, now, &mut summary).await
            }
            MembershipStatus::Forbidden => continue,
            _ => {
                // Unknown / Error: attempt a join, gated by the retry window
                // and the one-pending-request-per-channel guardrail.
                if status == MembershipStatus::Error
                    && !due(last_checked, ERROR_RETRY_SECS, now)
                {
                    continue;
                }
                if store.has_pending_membership(channel.id)? {
                    continue;
                }
                try_join(store, pool, account, channel, now, &mut summary).await
            }
        };

        if let Err(e) = step {
            match e {
                EngineError::Upstream(err) => {
                    warn!(
                        channel_id = channel.id,
                        account_id = account.id,
                        error = %err,
                        "membership: step failed"
                    );
                }
                fatal => return Err(fatal),
            }
        }
    }

    info!(
        touched = summary.channels_touched,
        updated = summary.memberships_updated,
        "membership: cycle done"
    );
    Ok(summary)
}

/// A request is in flight: look for the entity in dialogs; its appearance
/// means an admin approved us.
#[allow(clippy::too_many_arguments)]
async fn recheck_pending(
    store: &Store,
    pool: &ClientPool,
    account: &Account,
    channel: &Channel,
    status: MembershipStatus,
    note: &str,
    now: DateTime<Utc>,
    summary: &mut MaintenanceSummary,
) -> Result<()> {
    let found = dialogs_probe(store, pool, account, channel, now, summary).await?;
    match found {
        Some(true) => {
            store.upsert_membership(
                account.id,
                channel.id,
                MembershipStatus::Joined,
                "entity found in dialogs (approved)",
                now,
            )?;
            summary.memberships_updated += 1;
        }
        Some(false) => {
            // Still pending; stamp the check so the 6h window holds.
            store.upsert_membership(account.id, channel.id, status, note, now)?;
        }
        None => {}
    }
    Ok(())
}

/// Joined memberships get an occasional dialog sanity check. Absence is
/// flagged, never silently downgraded.
async fn refresh_joined(
    store: &Store,
    pool: &ClientPool,
    account: &Account,
    channel: &Channel,
    note: &str,
    now: DateTime<Utc>,
    summary: &mut MaintenanceSummary,
) -> Result<()> {
    let found = dialogs_probe(store, pool, account, channel, now, summary).await?;
    match found {
        Some(true) => {
            store.upsert_membership(
                account.id,
                channel.id,
                MembershipStatus::Joined,
                note,
                now,
            )?;
        }
        Some(false) => {
            store.upsert_membership(
                account.id,
                channel.id,
                MembershipStatus::Error,
                "joined previously but missing from dialogs",
                now,
            )?;
            summary.memberships_updated += 1;
        }
        None => {}
    }
    Ok(())
}

/// Shared dialog lookup. `Some(found)` on success; `None` when the account
/// hit a FloodWait and was put on cooldown instead.
async fn dialogs_probe(
    store: &Store,
    pool: &ClientPool,
    account: &Account,
    channel: &Channel,
    now: DateTime<Utc>,
    summary: &mut MaintenanceSummary,
) -> Result<Option<bool>> {
    let result = pool
        .with_connected::<_, EngineError, _, _>(account, |client| async move {
            let work = find_in_dialogs(client.as_ref(), channel);
            match tokio::time::timeout(short_call_deadline(), work).await {
                Ok(result) => result.map_err(EngineError::from),
                Err(_) => Err(EngineError::Upstream(UpstreamError::Transport(
                    "dialogs probe timed out".to_string(),
                ))),
            }
        })
        .await;

    match result {
        Ok(entity) => Ok(Some(entity.is_some())),
        Err(EngineError::Upstream(UpstreamError::FloodWait { seconds })) => {
            mark_cooldown(store, account, seconds, "dialogs recheck", now)?;
            summary.accounts_cooldown_marked += 1;
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Unknown/error membership: attempt the join and persist what happened.
async fn try_join(
    store: &Store,
    pool: &ClientPool,
    account: &Account,
    channel: &Channel,
    now: DateTime<Utc>,
    summary: &mut MaintenanceSummary,
) -> Result<()> {
    let outcome = pool
        .with_connected::<_, EngineError, _, _>(account, |client| async move {
            let work = async {
                if !client.is_authorized().await? {
                    return Ok(None);
                }
                Ok(Some(ensure_joined(client.as_ref(), channel, false).await))
            };
            match tokio::time::timeout(short_call_deadline(), work).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::Upstream(UpstreamError::Transport(
                    "join attempt timed out".to_string(),
                ))),
            }
        })
        .await;

    match outcome {
        Ok(None) => {
            // Stop the selector from picking this account until re-auth.
            store.update_account_health(
                account.id,
                AccountStatus::AuthRequired,
                "Session is not authorized",
                None,
                now,
            )?;
        }
        Ok(Some(report)) => {
            // A short-circuited public join reports the channel-global
            // `active` status; that says nothing about this membership.
            let informative = report
                .access
                .is_some_and(|a| a != ChannelAccessStatus::Active);
            if informative {
                store.upsert_membership(
                    account.id,
                    channel.id,
                    membership_for_access(report.access),
                    &report.note,
                    now,
                )?;
                summary.memberships_updated += 1;
            }
            if let Some(seconds) = report.retry_after {
                mark_cooldown(store, account, seconds, "join attempt", now)?;
                summary.accounts_cooldown_marked += 1;
            }
        }
        Err(EngineError::Upstream(UpstreamError::FloodWait { seconds })) => {
            mark_cooldown(store, account, seconds, "join attempt", now)?;
            summary.accounts_cooldown_marked += 1;
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

fn mark_cooldown(
    store: &Store,
    account: &Account,
    seconds: u64,
    what: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    store.update_account_health(
        account.id,
        AccountStatus::Cooldown,
        &format!("FloodWait {seconds}s during {what}"),
        Some(now + Duration::seconds(seconds as i64)),
        now,
    )?;
    Ok(())
}
