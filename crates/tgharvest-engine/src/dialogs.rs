//! Entity resolution via the account's dialog list.
//!
//! Once an account is a member, the channel shows up in its dialogs and an
//! explicit resolve call (and its rate-limit cost) can be skipped. The
//! parser only uses this for private channels: public resolves are cheap
//! while dialog enumeration is aggressively rate-limited.

use tgharvest_core::policy::DIALOG_LIST_LIMIT;
use tgharvest_store::{Channel, ChannelType};
use tgharvest_upstream::{Entity, UpstreamClient};

use tgharvest_upstream::error::Result;

/// Normalize a public identifier (`@name`, `t.me/name`, `name`) to a bare
/// lowercase username.
pub fn norm_username(identifier: &str) -> String {
    let mut raw = identifier.trim();
    if let Some(rest) = raw.split("t.me/").nth(1) {
        raw = rest.split('/').next().unwrap_or("");
    }
    raw.trim_start_matches('@').trim().to_lowercase()
}

/// Find the channel's entity in the account's recent dialogs, if present.
pub async fn find_in_dialogs(
    client: &dyn UpstreamClient,
    channel: &Channel,
) -> Result<Option<Entity>> {
    let dialogs = client.dialogs(DIALOG_LIST_LIMIT).await?;

    match channel.kind {
        ChannelType::Public => {
            let username = norm_username(&channel.identifier);
            if username.is_empty() {
                return Ok(None);
            }
            Ok(dialogs.into_iter().map(|d| d.entity).find(|e| {
                e.username
                    .as_deref()
                    .is_some_and(|u| u.eq_ignore_ascii_case(&username))
            }))
        }
        ChannelType::Private => {
            let Some(peer_id) = channel.peer_id else {
                return Ok(None);
            };
            Ok(dialogs
                .into_iter()
                .map(|d| d.entity)
                .find(|e| e.id == peer_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn norm_username_strips_prefix_and_link_forms() {
        assert_eq!(norm_username("@Demo"), "demo");
        assert_eq!(norm_username("demo"), "demo");
        assert_eq!(norm_username("https://t.me/Demo/123"), "demo");
        assert_eq!(norm_username("t.me/demo"), "demo");
        assert_eq!(norm_username("  "), "");
    }
}
