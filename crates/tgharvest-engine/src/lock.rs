//! Singleton tick lock.
//!
//! One random token per acquisition identifies the holder; refresh and
//! release are conditional on the token still matching, so a stale holder
//! can never extend or drop a newer holder's lock.

use std::sync::Arc;

use uuid::Uuid;

use crate::ephemeral::{EphemeralResult, EphemeralStore};

/// Lock key in the shared ephemeral store.
pub const LOCK_KEY: &str = "tgparser:tick:lock";
/// Monotonic tick-id counter.
pub const SEQ_KEY: &str = "tgparser:tick:seq";
/// Hash holding the last tick's summary.
pub const META_KEY: &str = "tgparser:tick:last";

/// Proof of lock ownership for one acquisition.
#[derive(Debug)]
pub struct TickGuard {
    token: String,
}

impl TickGuard {
    pub fn token(&self) -> &str {
        &self.token
    }
}

#[derive(Clone)]
pub struct TickLock {
    store: Arc<dyn EphemeralStore>,
    ttl_secs: u64,
}

impl TickLock {
    pub fn new(store: Arc<dyn EphemeralStore>, ttl_secs: u64) -> Self {
        Self { store, ttl_secs }
    }

    /// Try to take the lock. `None` means another holder has it.
    pub async fn acquire(&self) -> EphemeralResult<Option<TickGuard>> {
        let token = Uuid::new_v4().to_string();
        if self.store.set_nx_ex(LOCK_KEY, &token, self.ttl_secs).await? {
            Ok(Some(TickGuard { token }))
        } else {
            Ok(None)
        }
    }

    /// Re-arm the TTL while the tick is still running. `false` means the
    /// lock was lost (expired and possibly re-acquired by someone else).
    pub async fn refresh(&self, token: &str) -> EphemeralResult<bool> {
        self.store
            .expire_if_match(LOCK_KEY, token, self.ttl_secs)
            .await
    }

    /// Token-matched release. `false` means the lock already belonged to a
    /// different holder and was left untouched.
    pub async fn release(&self, guard: TickGuard) -> EphemeralResult<bool> {
        self.store.delete_if_match(LOCK_KEY, guard.token()).await
    }
}
