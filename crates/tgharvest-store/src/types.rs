use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health classification of an upstream client identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// Authorized and usable.
    Active,
    /// Upstream FloodWait; unusable until `cooldown_until`.
    Cooldown,
    /// Upstream froze or banned the identity. Terminal without operator action.
    Banned,
    /// Session missing or unauthorized; needs external re-auth.
    AuthRequired,
    /// Identity deactivated upstream; quarantined like `Banned`.
    Forbidden,
    /// Unexpected failure; re-classified on the next health pass.
    Error,
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AccountStatus::Active => "active",
            AccountStatus::Cooldown => "cooldown",
            AccountStatus::Banned => "banned",
            AccountStatus::AuthRequired => "auth_required",
            AccountStatus::Forbidden => "forbidden",
            AccountStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for AccountStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(AccountStatus::Active),
            "cooldown" => Ok(AccountStatus::Cooldown),
            "banned" => Ok(AccountStatus::Banned),
            "auth_required" => Ok(AccountStatus::AuthRequired),
            "forbidden" => Ok(AccountStatus::Forbidden),
            "error" => Ok(AccountStatus::Error),
            other => Err(format!("unknown account status: {other}")),
        }
    }
}

/// How a channel is addressed upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    /// `identifier` is a username.
    Public,
    /// `identifier` is an invite link or hash.
    Private,
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChannelType::Public => "public",
            ChannelType::Private => "private",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ChannelType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "public" => Ok(ChannelType::Public),
            "private" => Ok(ChannelType::Private),
            other => Err(format!("unknown channel type: {other}")),
        }
    }
}

/// Channel-global access state, advanced by join attempts and parses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelAccessStatus {
    /// Operator-created, not yet probed.
    Active,
    /// An invite request was sent and awaits admin approval.
    JoinRequested,
    /// Same as `JoinRequested`; the state the join service writes today.
    PendingApproval,
    /// At least one account can read the channel.
    Joined,
    /// No account may parse this channel. Terminal unless re-enabled.
    Forbidden,
    /// Last attempt failed; re-evaluated next tick.
    Error,
}

impl ChannelAccessStatus {
    /// An invite request is outstanding for the channel.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            ChannelAccessStatus::JoinRequested | ChannelAccessStatus::PendingApproval
        )
    }
}

impl std::fmt::Display for ChannelAccessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChannelAccessStatus::Active => "active",
            ChannelAccessStatus::JoinRequested => "join_requested",
            ChannelAccessStatus::PendingApproval => "pending_approval",
            ChannelAccessStatus::Joined => "joined",
            ChannelAccessStatus::Forbidden => "forbidden",
            ChannelAccessStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ChannelAccessStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(ChannelAccessStatus::Active),
            "join_requested" => Ok(ChannelAccessStatus::JoinRequested),
            "pending_approval" => Ok(ChannelAccessStatus::PendingApproval),
            "joined" => Ok(ChannelAccessStatus::Joined),
            "forbidden" => Ok(ChannelAccessStatus::Forbidden),
            "error" => Ok(ChannelAccessStatus::Error),
            other => Err(format!("unknown channel access status: {other}")),
        }
    }
}

/// Per-(account, channel) membership state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    Unknown,
    JoinRequested,
    PendingApproval,
    Joined,
    Forbidden,
    Error,
}

impl MembershipStatus {
    /// An invite request from this account is outstanding.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            MembershipStatus::JoinRequested | MembershipStatus::PendingApproval
        )
    }
}

impl std::fmt::Display for MembershipStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MembershipStatus::Unknown => "unknown",
            MembershipStatus::JoinRequested => "join_requested",
            MembershipStatus::PendingApproval => "pending_approval",
            MembershipStatus::Joined => "joined",
            MembershipStatus::Forbidden => "forbidden",
            MembershipStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for MembershipStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(MembershipStatus::Unknown),
            "join_requested" => Ok(MembershipStatus::JoinRequested),
            "pending_approval" => Ok(MembershipStatus::PendingApproval),
            "joined" => Ok(MembershipStatus::Joined),
            "forbidden" => Ok(MembershipStatus::Forbidden),
            "error" => Ok(MembershipStatus::Error),
            other => Err(format!("unknown membership status: {other}")),
        }
    }
}

/// An upstream client identity with its opaque session capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    /// Human-friendly label shown in operator lists.
    pub label: String,
    pub phone_number: String,
    /// Free-form onboarding tag (e.g. "phone-code", "tdata").
    pub onboarding_method: String,
    /// Operator toggle; quarantine also clears it.
    pub is_active: bool,
    pub status: AccountStatus,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_error: String,
    /// Opaque session capability; empty means no capability.
    pub session_string: String,
    pub api_id: Option<i64>,
    pub api_hash: Option<String>,
    pub proxy_url: Option<String>,
    /// LRU stamp, written only on successful parse.
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Selection predicate: usable for upstream work right now.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.status == AccountStatus::Active
            && self.cooldown_until.map_or(true, |until| until <= now)
            && !self.session_string.is_empty()
    }
}

/// Fields supplied when onboarding creates an account row.
#[derive(Debug, Clone, Default)]
pub struct NewAccount {
    pub label: String,
    pub phone_number: String,
    pub onboarding_method: String,
    pub session_string: String,
    pub api_id: Option<i64>,
    pub api_hash: Option<String>,
    pub proxy_url: Option<String>,
}

/// An upstream content stream to harvest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub kind: ChannelType,
    /// Username (public) or invite link/hash (private).
    pub identifier: String,
    pub title: String,
    pub is_active: bool,
    /// Historical window ingested on first parse, 0..365 days.
    pub backfill_days: u32,
    pub access_status: ChannelAccessStatus,
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Highest upstream message id already ingested; 0 means never parsed.
    pub cursor_message_id: i64,
    /// Numeric entity id discovered after the first resolve.
    pub peer_id: Option<i64>,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when the operator registers a channel.
#[derive(Debug, Clone)]
pub struct NewChannel {
    pub kind: ChannelType,
    pub identifier: String,
    pub title: String,
    pub backfill_days: u32,
}

/// A harvested message. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    pub channel_id: i64,
    pub message_id: i64,
    /// Canonical URL, or empty when it cannot be composed.
    pub original_url: String,
    pub published_at: DateTime<Utc>,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// A post row ready for the conflict-ignoring bulk insert.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub channel_id: i64,
    pub message_id: i64,
    pub original_url: String,
    pub published_at: DateTime<Utc>,
    pub text: String,
}

/// Per-(account, channel) relation describing parse eligibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub id: i64,
    pub account_id: i64,
    pub channel_id: i64,
    pub status: MembershipStatus,
    pub note: String,
    pub join_requested_at: Option<DateTime<Utc>>,
    pub joined_at: Option<DateTime<Utc>>,
    pub forbidden_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// A bot-UI operator; staff members with `notify_enabled` receive broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operator {
    pub chat_id: i64,
    pub username: String,
    pub is_staff: bool,
    pub notify_enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Selector output: at most one account, plus the reason when there is none.
#[derive(Debug, Clone)]
pub struct Pick {
    pub account: Option<Account>,
    pub reason: &'static str,
}
