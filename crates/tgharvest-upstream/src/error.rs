use thiserror::Error;

/// Classified upstream failure.
///
/// Adapters translate their library's errors into exactly one of these tags
/// (usually via [`classify_rpc`]); the engine switches on the tag to decide
/// between cooldown, quarantine, membership downgrade and plain retry.
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    /// Upstream app identity is missing. Aborts the current pass.
    #[error("upstream config error: {0}")]
    Config(String),

    /// Rate limited; the account must rest for `seconds`.
    #[error("flood wait: {seconds}s")]
    FloodWait { seconds: u64 },

    /// The account's identity was frozen upstream.
    #[error("account frozen: {0}")]
    Frozen(String),

    /// The account's identity was banned upstream.
    #[error("account banned: {0}")]
    Banned(String),

    /// The account's identity was deactivated upstream.
    #[error("account deactivated: {0}")]
    Deactivated(String),

    /// This account may not access the channel (private, admin-required,
    /// banned in channel, not a participant, write-forbidden).
    #[error("channel forbidden: {0}")]
    ChannelForbidden(String),

    /// The referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other upstream RPC failure.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// Connection / transport failure before an RPC completed.
    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, UpstreamError>;

/// Map an upstream RPC error name (and FloodWait argument) onto the tagged
/// taxonomy. Adapters call this instead of string-matching at use sites.
pub fn classify_rpc(name: &str, value: Option<u64>) -> UpstreamError {
    match name {
        "FLOOD_WAIT" | "FLOOD_PREMIUM_WAIT" | "SLOWMODE_WAIT" => UpstreamError::FloodWait {
            seconds: value.unwrap_or(0),
        },
        "FROZEN_METHOD_INVALID" => UpstreamError::Frozen(name.to_string()),
        "PHONE_NUMBER_BANNED" | "USER_DEACTIVATED_BAN" => UpstreamError::Banned(name.to_string()),
        "USER_DEACTIVATED" => UpstreamError::Deactivated(name.to_string()),
        "CHANNEL_PRIVATE" | "CHAT_ADMIN_REQUIRED" | "USER_BANNED_IN_CHANNEL"
        | "USER_NOT_PARTICIPANT" | "CHAT_WRITE_FORBIDDEN" => {
            UpstreamError::ChannelForbidden(name.to_string())
        }
        "USERNAME_NOT_OCCUPIED" | "USERNAME_INVALID" | "INVITE_HASH_INVALID"
        | "INVITE_HASH_EXPIRED" => UpstreamError::NotFound(name.to_string()),
        other => UpstreamError::Rpc(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flood_wait_carries_seconds() {
        match classify_rpc("FLOOD_WAIT", Some(120)) {
            UpstreamError::FloodWait { seconds } => assert_eq!(seconds, 120),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn frozen_is_not_a_plain_flood() {
        assert!(matches!(
            classify_rpc("FROZEN_METHOD_INVALID", None),
            UpstreamError::Frozen(_)
        ));
    }

    #[test]
    fn forbidden_family_maps_to_channel_forbidden() {
        for name in [
            "CHANNEL_PRIVATE",
            "CHAT_ADMIN_REQUIRED",
            "USER_BANNED_IN_CHANNEL",
            "USER_NOT_PARTICIPANT",
            "CHAT_WRITE_FORBIDDEN",
        ] {
            assert!(matches!(
                classify_rpc(name, None),
                UpstreamError::ChannelForbidden(_)
            ));
        }
    }

    #[test]
    fn unknown_names_fall_through_to_rpc() {
        assert!(matches!(
            classify_rpc("PEER_ID_INVALID", None),
            UpstreamError::Rpc(_)
        ));
    }
}
