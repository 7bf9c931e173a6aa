//! Membership acquisition.
//!
//! The join service talks to upstream and reports what happened; it never
//! writes to the store. The caller commits membership and channel outcomes.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;

use tgharvest_store::{Channel, ChannelAccessStatus, ChannelType};
use tgharvest_upstream::{
    Entity, EntityRef, JoinOutcome, JoinTarget, UpstreamClient, UpstreamError,
};

use crate::dialogs::norm_username;

/// Outcome of one `ensure_joined` attempt.
#[derive(Debug, Clone, Default)]
pub struct JoinReport {
    /// Membership exists (or already existed) after the attempt.
    pub ok: bool,
    /// Entity from the join/import payload, when upstream returned one.
    pub entity: Option<Entity>,
    /// Channel access status implied by the attempt.
    pub access: Option<ChannelAccessStatus>,
    /// Short human string safe for operator surfaces.
    pub note: String,
    /// FloodWait seconds, when that is what stopped the attempt.
    pub retry_after: Option<u64>,
}

impl JoinReport {
    fn ok(entity: Option<Entity>, access: ChannelAccessStatus, note: &str) -> Self {
        Self {
            ok: true,
            entity,
            access: Some(access),
            note: note.to_string(),
            ..Self::default()
        }
    }

    fn denied(access: ChannelAccessStatus, note: String) -> Self {
        Self {
            ok: false,
            access: Some(access),
            note,
            ..Self::default()
        }
    }
}

/// Membership state implied by a join report's channel access status.
pub fn membership_for_access(
    access: Option<ChannelAccessStatus>,
) -> tgharvest_store::MembershipStatus {
    use tgharvest_store::MembershipStatus;
    match access {
        Some(ChannelAccessStatus::Joined) => MembershipStatus::Joined,
        Some(access) if access.is_pending() => MembershipStatus::PendingApproval,
        Some(ChannelAccessStatus::Forbidden) => MembershipStatus::Forbidden,
        _ => MembershipStatus::Error,
    }
}

static INVITE_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:https?://)?t\.me/(?:\+|joinchat/)(?P<hash>[A-Za-z0-9_-]+)")
        .expect("invite link regex")
});

/// Extract the invite hash from a bare hash, `t.me/+HASH` or
/// `t.me/joinchat/HASH` (scheme optional).
pub fn extract_invite_hash(identifier: &str) -> Option<String> {
    let raw = identifier.trim();
    if raw.is_empty() {
        return None;
    }

    if raw.contains("t.me") {
        return INVITE_LINK
            .captures(raw)
            .map(|caps| caps["hash"].to_string());
    }

    let bare = raw.trim_start_matches('+');
    if !bare.is_empty()
        && !bare.contains('/')
        && bare
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Some(bare.to_string());
    }
    None
}

/// Ensure the connected account is a member of `channel`.
///
/// Public channels short-circuit on the channel-global `joined` / `active`
/// status unless `force` is set. Private channels never short-circuit:
/// membership is per-account, so another account's success says nothing
/// about this one.
pub async fn ensure_joined(
    client: &dyn UpstreamClient,
    channel: &Channel,
    force: bool,
) -> JoinReport {
    if !force
        && channel.kind == ChannelType::Public
        && matches!(
            channel.access_status,
            ChannelAccessStatus::Joined | ChannelAccessStatus::Active
        )
    {
        return JoinReport::ok(None, channel.access_status, "");
    }

    let result = match channel.kind {
        ChannelType::Public => join_public(client, channel).await,
        ChannelType::Private => join_private(client, channel).await,
    };

    match result {
        Ok(report) => report,
        Err(UpstreamError::ChannelForbidden(name)) => {
            info!(channel_id = channel.id, error = %name, "join forbidden");
            JoinReport::denied(ChannelAccessStatus::Forbidden, format!("forbidden: {name}"))
        }
        Err(UpstreamError::FloodWait { seconds }) => JoinReport {
            retry_after: Some(seconds),
            ..JoinReport::denied(ChannelAccessStatus::Error, format!("FloodWait {seconds}s"))
        },
        Err(UpstreamError::NotFound(name)) => {
            JoinReport::denied(ChannelAccessStatus::Error, format!("not found: {name}"))
        }
        Err(e) => JoinReport::denied(ChannelAccessStatus::Error, format!("RPCError: {e}")),
    }
}

async fn join_public(
    client: &dyn UpstreamClient,
    channel: &Channel,
) -> Result<JoinReport, UpstreamError> {
    let username = norm_username(&channel.identifier);
    if username.is_empty() {
        return Ok(JoinReport::denied(
            ChannelAccessStatus::Error,
            "empty public channel identifier".to_string(),
        ));
    }

    let entity = client.resolve(&EntityRef::Username(username)).await?;
    match client.join(JoinTarget::Channel(entity.clone())).await? {
        JoinOutcome::Joined(joined) => Ok(JoinReport::ok(
            joined.or(Some(entity)),
            ChannelAccessStatus::Joined,
            "joined public channel",
        )),
        JoinOutcome::AlreadyParticipant => Ok(JoinReport::ok(
            Some(entity),
            ChannelAccessStatus::Joined,
            "already participant",
        )),
        JoinOutcome::Forbidden => Ok(JoinReport::denied(
            ChannelAccessStatus::Forbidden,
            "forbidden".to_string(),
        )),
        JoinOutcome::InviteRequestSent => Ok(JoinReport::denied(
            ChannelAccessStatus::PendingApproval,
            "join request sent (pending approval)".to_string(),
        )),
    }
}

async fn join_private(
    client: &dyn UpstreamClient,
    channel: &Channel,
) -> Result<JoinReport, UpstreamError> {
    let Some(hash) = extract_invite_hash(&channel.identifier) else {
        return Ok(JoinReport::denied(
            ChannelAccessStatus::Error,
            "invalid invite link/hash".to_string(),
        ));
    };

    match client.join(JoinTarget::Invite(hash)).await? {
        JoinOutcome::Joined(entity) => Ok(JoinReport::ok(
            entity,
            ChannelAccessStatus::Joined,
            "imported private invite",
        )),
        JoinOutcome::AlreadyParticipant => Ok(JoinReport::ok(
            None,
            ChannelAccessStatus::Joined,
            "already participant",
        )),
        // Upstream created the request; re-sending the import would spam the
        // channel's admins, so callers persist the pending state and wait.
        JoinOutcome::InviteRequestSent => Ok(JoinReport::denied(
            ChannelAccessStatus::PendingApproval,
            "join request sent (pending approval)".to_string(),
        )),
        JoinOutcome::Forbidden => Ok(JoinReport::denied(
            ChannelAccessStatus::Forbidden,
            "forbidden".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invite_hash_accepts_all_three_forms() {
        assert_eq!(extract_invite_hash("AbC-12_x").as_deref(), Some("AbC-12_x"));
        assert_eq!(extract_invite_hash("+AbC12x").as_deref(), Some("AbC12x"));
        assert_eq!(
            extract_invite_hash("https://t.me/+AbC12x").as_deref(),
            Some("AbC12x")
        );
        assert_eq!(
            extract_invite_hash("t.me/+AbC12x").as_deref(),
            Some("AbC12x")
        );
        assert_eq!(
            extract_invite_hash("https://t.me/joinchat/AbC12x").as_deref(),
            Some("AbC12x")
        );
    }

    #[test]
    fn invite_hash_rejects_garbage() {
        assert_eq!(extract_invite_hash(""), None);
        assert_eq!(extract_invite_hash("t.me/demo"), None);
        assert_eq!(extract_invite_hash("not a hash!"), None);
        assert_eq!(extract_invite_hash("a/b"), None);
    }
}
