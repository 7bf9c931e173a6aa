//! In-process upstream used by the integration tests and by
//! `tgharvestd --adapter loopback` development runs.
//!
//! The world is a small scripted model: channels with messages, per-account
//! membership, invite behavior and injectable faults. Clients built by
//! [`LoopbackFactory`] all share one world, so multiple accounts observe a
//! consistent upstream.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream;
use futures_util::StreamExt;

use crate::client::{
    Dialog, Entity, EntityRef, HistoryRequest, Identity, JoinOutcome, JoinTarget, MessageStream,
    UpstreamClient, UpstreamMessage,
};
use crate::error::{Result, UpstreamError};
use crate::session::{ClientFactory, SessionParams};

/// What happens when an account imports this channel's invite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteMode {
    /// Import succeeds immediately.
    Accept,
    /// Import creates a pending join request awaiting approval.
    RequestApproval,
    /// Import is refused.
    Forbid,
}

struct LoopbackChannel {
    entity: Entity,
    invite_hash: Option<String>,
    invite_mode: InviteMode,
    messages: Vec<UpstreamMessage>,
    members: HashSet<i64>,
    /// Accounts with an outstanding join request.
    requesters: Vec<i64>,
    invite_request_total: u64,
}

#[derive(Default)]
struct AccountState {
    authorized: Option<bool>,
    connects: u64,
    disconnects: u64,
    dialog_calls: u64,
    connect_fault: Option<UpstreamError>,
    get_me_fault: Option<UpstreamError>,
    resolve_fault: Option<UpstreamError>,
    history_fault: Option<UpstreamError>,
    join_fault: Option<UpstreamError>,
}

#[derive(Default)]
struct WorldInner {
    channels: Vec<LoopbackChannel>,
    accounts: HashMap<i64, AccountState>,
}

impl WorldInner {
    fn account(&mut self, id: i64) -> &mut AccountState {
        self.accounts.entry(id).or_default()
    }

    fn channel_mut(&mut self, entity_id: i64) -> Option<&mut LoopbackChannel> {
        self.channels.iter_mut().find(|c| c.entity.id == entity_id)
    }
}

/// Shared scripted upstream. Cheap to clone; all clones see the same state.
#[derive(Clone)]
pub struct LoopbackWorld {
    inner: Arc<Mutex<WorldInner>>,
}

impl Default for LoopbackWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackWorld {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(WorldInner::default())),
        }
    }

    pub fn add_public_channel(&self, entity_id: i64, username: &str, title: &str) -> Entity {
        let entity = Entity {
            id: entity_id,
            username: Some(username.to_string()),
            title: title.to_string(),
        };
        self.inner.lock().unwrap().channels.push(LoopbackChannel {
            entity: entity.clone(),
            invite_hash: None,
            invite_mode: InviteMode::Accept,
            messages: Vec::new(),
            members: HashSet::new(),
            requesters: Vec::new(),
            invite_request_total: 0,
        });
        entity
    }

    pub fn add_private_channel(
        &self,
        entity_id: i64,
        invite_hash: &str,
        title: &str,
        mode: InviteMode,
    ) -> Entity {
        let entity = Entity {
            id: entity_id,
            username: None,
            title: title.to_string(),
        };
        self.inner.lock().unwrap().channels.push(LoopbackChannel {
            entity: entity.clone(),
            invite_hash: Some(invite_hash.to_string()),
            invite_mode: mode,
            messages: Vec::new(),
            members: HashSet::new(),
            requesters: Vec::new(),
            invite_request_total: 0,
        });
        entity
    }

    pub fn push_message(
        &self,
        entity_id: i64,
        message_id: i64,
        text: &str,
        published_at: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(ch) = inner.channel_mut(entity_id) {
            ch.messages.push(UpstreamMessage {
                id: message_id,
                text: text.to_string(),
                published_at,
            });
        }
    }

    pub fn add_member(&self, account_id: i64, entity_id: i64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(ch) = inner.channel_mut(entity_id) {
            ch.members.insert(account_id);
        }
    }

    pub fn remove_member(&self, account_id: i64, entity_id: i64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(ch) = inner.channel_mut(entity_id) {
            ch.members.remove(&account_id);
        }
    }

    pub fn is_member(&self, account_id: i64, entity_id: i64) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .channels
            .iter()
            .any(|c| c.entity.id == entity_id && c.members.contains(&account_id))
    }

    /// Approve every outstanding join request on the channel; returns how
    /// many accounts became members.
    pub fn approve_requests(&self, entity_id: i64) -> usize {
        let mut inner = self.inner.lock().unwrap();
        match inner.channel_mut(entity_id) {
            Some(ch) => {
                let approved = ch.requesters.len();
                for account_id in ch.requesters.drain(..) {
                    ch.members.insert(account_id);
                }
                approved
            }
            None => 0,
        }
    }

    /// Total invite-import calls that created (or re-created) a request.
    pub fn invite_request_total(&self, entity_id: i64) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner
            .channels
            .iter()
            .find(|c| c.entity.id == entity_id)
            .map(|c| c.invite_request_total)
            .unwrap_or(0)
    }

    pub fn set_authorized(&self, account_id: i64, authorized: bool) {
        self.inner.lock().unwrap().account(account_id).authorized = Some(authorized);
    }

    pub fn set_connect_fault(&self, account_id: i64, fault: Option<UpstreamError>) {
        self.inner.lock().unwrap().account(account_id).connect_fault = fault;
    }

    pub fn set_get_me_fault(&self, account_id: i64, fault: Option<UpstreamError>) {
        self.inner.lock().unwrap().account(account_id).get_me_fault = fault;
    }

    pub fn set_resolve_fault(&self, account_id: i64, fault: Option<UpstreamError>) {
        self.inner.lock().unwrap().account(account_id).resolve_fault = fault;
    }

    pub fn set_history_fault(&self, account_id: i64, fault: Option<UpstreamError>) {
        self.inner.lock().unwrap().account(account_id).history_fault = fault;
    }

    pub fn set_join_fault(&self, account_id: i64, fault: Option<UpstreamError>) {
        self.inner.lock().unwrap().account(account_id).join_fault = fault;
    }

    pub fn connect_count(&self, account_id: i64) -> u64 {
        self.inner.lock().unwrap().account(account_id).connects
    }

    pub fn disconnect_count(&self, account_id: i64) -> u64 {
        self.inner.lock().unwrap().account(account_id).disconnects
    }

    pub fn dialog_call_count(&self, account_id: i64) -> u64 {
        self.inner.lock().unwrap().account(account_id).dialog_calls
    }

    pub fn dialog_calls_total(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.accounts.values().map(|a| a.dialog_calls).sum()
    }
}

/// Factory handing out clients bound to one shared [`LoopbackWorld`].
pub struct LoopbackFactory {
    world: LoopbackWorld,
}

impl LoopbackFactory {
    pub fn new(world: LoopbackWorld) -> Self {
        Self { world }
    }
}

impl ClientFactory for LoopbackFactory {
    fn open(&self, params: &SessionParams) -> Result<Arc<dyn UpstreamClient>> {
        Ok(Arc::new(LoopbackClient {
            account_id: params.account_id,
            inner: self.world.inner.clone(),
        }))
    }
}

struct LoopbackClient {
    account_id: i64,
    inner: Arc<Mutex<WorldInner>>,
}

#[async_trait]
impl UpstreamClient for LoopbackClient {
    async fn connect(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.account(self.account_id);
        state.connects += 1;
        match &state.connect_fault {
            Some(fault) => Err(fault.clone()),
            None => Ok(()),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.account(self.account_id).disconnects += 1;
        Ok(())
    }

    async fn is_authorized(&self) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.account(self.account_id).authorized.unwrap_or(true))
    }

    async fn get_me(&self) -> Result<Identity> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(fault) = &inner.account(self.account_id).get_me_fault {
            return Err(fault.clone());
        }
        Ok(Identity {
            id: self.account_id,
            username: format!("acct{}", self.account_id),
        })
    }

    async fn resolve(&self, reference: &EntityRef) -> Result<Entity> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(fault) = &inner.account(self.account_id).resolve_fault {
            return Err(fault.clone());
        }
        match reference {
            EntityRef::Username(username) => inner
                .channels
                .iter()
                .find(|c| {
                    c.entity
                        .username
                        .as_deref()
                        .is_some_and(|u| u.eq_ignore_ascii_case(username))
                })
                .map(|c| c.entity.clone())
                .ok_or_else(|| UpstreamError::NotFound("USERNAME_NOT_OCCUPIED".to_string())),
            EntityRef::PeerId(peer_id) => inner
                .channels
                .iter()
                .find(|c| c.entity.id == *peer_id && c.members.contains(&self.account_id))
                .map(|c| c.entity.clone())
                .ok_or_else(|| UpstreamError::NotFound("PEER_ID_INVALID".to_string())),
        }
    }

    async fn dialogs(&self, limit: usize) -> Result<Vec<Dialog>> {
        let mut inner = self.inner.lock().unwrap();
        inner.account(self.account_id).dialog_calls += 1;
        Ok(inner
            .channels
            .iter()
            .filter(|c| c.members.contains(&self.account_id))
            .take(limit)
            .map(|c| Dialog {
                entity: c.entity.clone(),
            })
            .collect())
    }

    fn iter_messages<'a>(
        &'a self,
        entity: &Entity,
        request: HistoryRequest,
    ) -> MessageStream<'a> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(fault) = &inner.account(self.account_id).history_fault {
            let failed: Vec<Result<UpstreamMessage>> = vec![Err(fault.clone())];
            return stream::iter(failed).boxed();
        }

        let mut messages: Vec<UpstreamMessage> = inner
            .channels
            .iter()
            .find(|c| c.entity.id == entity.id)
            .map(|c| c.messages.clone())
            .unwrap_or_default();

        if let Some(min_id) = request.min_id {
            messages.retain(|m| m.id > min_id);
        }
        if request.oldest_first {
            messages.sort_by_key(|m| m.id);
        } else {
            messages.sort_by_key(|m| std::cmp::Reverse(m.id));
        }
        if let Some(limit) = request.limit {
            messages.truncate(limit);
        }

        stream::iter(messages.into_iter().map(Ok)).boxed()
    }

    async fn join(&self, target: JoinTarget) -> Result<JoinOutcome> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(fault) = &inner.account(self.account_id).join_fault {
            return Err(fault.clone());
        }
        let account_id = self.account_id;

        match target {
            JoinTarget::Channel(entity) => match inner.channel_mut(entity.id) {
                Some(ch) => {
                    if ch.members.contains(&account_id) {
                        Ok(JoinOutcome::AlreadyParticipant)
                    } else {
                        ch.members.insert(account_id);
                        Ok(JoinOutcome::Joined(Some(ch.entity.clone())))
                    }
                }
                None => Err(UpstreamError::NotFound("CHANNEL_INVALID".to_string())),
            },
            JoinTarget::Invite(hash) => {
                let ch = inner
                    .channels
                    .iter_mut()
                    .find(|c| c.invite_hash.as_deref() == Some(hash.as_str()));
                let Some(ch) = ch else {
                    return Err(UpstreamError::NotFound("INVITE_HASH_INVALID".to_string()));
                };
                if ch.members.contains(&account_id) {
                    return Ok(JoinOutcome::AlreadyParticipant);
                }
                match ch.invite_mode {
                    InviteMode::Accept => {
                        ch.members.insert(account_id);
                        Ok(JoinOutcome::Joined(Some(ch.entity.clone())))
                    }
                    InviteMode::RequestApproval => {
                        ch.invite_request_total += 1;
                        if !ch.requesters.contains(&account_id) {
                            ch.requesters.push(account_id);
                        }
                        Ok(JoinOutcome::InviteRequestSent)
                    }
                    InviteMode::Forbid => Ok(JoinOutcome::Forbidden),
                }
            }
        }
    }
}
