use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;

use crate::error::Result;

/// The authenticated identity behind a connected client.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: i64,
    pub username: String,
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.username.is_empty() {
            write!(f, "{}", self.id)
        } else {
            write!(f, "@{}", self.username)
        }
    }
}

/// A resolved upstream content stream (channel / supergroup).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub id: i64,
    pub username: Option<String>,
    pub title: String,
}

/// One row of the account's dialog list.
#[derive(Debug, Clone)]
pub struct Dialog {
    pub entity: Entity,
}

/// How to look up an entity.
#[derive(Debug, Clone)]
pub enum EntityRef {
    /// Public username, without the `@`.
    Username(String),
    /// Numeric entity id previously discovered.
    PeerId(i64),
}

/// What to join.
#[derive(Debug, Clone)]
pub enum JoinTarget {
    /// A resolved public channel.
    Channel(Entity),
    /// A private invite hash (bare, no `t.me/+` prefix).
    Invite(String),
}

/// Outcome of a join / invite-import call that completed upstream.
#[derive(Debug, Clone)]
pub enum JoinOutcome {
    /// Now a member. Carries the entity when the update payload included it.
    Joined(Option<Entity>),
    AlreadyParticipant,
    /// The channel requires admin approval; a join request was created.
    /// Callers must not re-send the import.
    InviteRequestSent,
    /// Membership refused.
    Forbidden,
}

/// A message as fetched from upstream. `published_at` is already UTC;
/// adapters normalize naive datetimes before they reach the engine.
#[derive(Debug, Clone)]
pub struct UpstreamMessage {
    pub id: i64,
    pub text: String,
    pub published_at: DateTime<Utc>,
}

/// Bounds for an incremental history fetch.
#[derive(Debug, Clone, Default)]
pub struct HistoryRequest {
    /// Exclusive lower bound on message id.
    pub min_id: Option<i64>,
    /// Cap on fetched messages.
    pub limit: Option<usize>,
    /// Deliver oldest → newest instead of the upstream default (newest first).
    pub oldest_first: bool,
}

pub type MessageStream<'a> = BoxStream<'a, Result<UpstreamMessage>>;

/// The narrow capability the harvester needs from an upstream client.
///
/// One instance wraps one account's session. Implementations are NOT safe
/// for concurrent calls; the client pool serializes access per account.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn connect(&self) -> Result<()>;

    /// Errors during disconnect are the caller's to swallow.
    async fn disconnect(&self) -> Result<()>;

    async fn is_authorized(&self) -> Result<bool>;

    async fn get_me(&self) -> Result<Identity>;

    async fn resolve(&self, reference: &EntityRef) -> Result<Entity>;

    /// Enumerate the most recent dialogs, up to `limit`. Aggressively
    /// rate-limited upstream; callers keep `limit` small.
    async fn dialogs(&self, limit: usize) -> Result<Vec<Dialog>>;

    /// Stream messages from `entity` within the requested bounds. Errors are
    /// yielded in-stream so a partial fetch still delivers its prefix.
    fn iter_messages<'a>(&'a self, entity: &Entity, request: HistoryRequest)
        -> MessageStream<'a>;

    async fn join(&self, target: JoinTarget) -> Result<JoinOutcome>;
}
