use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::warn;

use tgharvest_core::config::UpstreamConfig;
use tgharvest_store::Account;

use crate::client::UpstreamClient;
use crate::error::UpstreamError;
use crate::session::{ClientFactory, SessionParams};

#[derive(Default)]
struct ConnState {
    refcount: u32,
    connected: bool,
}

struct PoolEntry {
    client: Arc<dyn UpstreamClient>,
    /// Serializes ALL use of this account's client; the underlying client
    /// is not safe for concurrent operations.
    state: Mutex<ConnState>,
}

/// Per-account singleton clients, ref-counted and connected lazily.
///
/// Process-local only: the lock in each entry serializes a single process,
/// not replicas. The tick lock keeps replicas from overlapping.
pub struct ClientPool {
    factory: Arc<dyn ClientFactory>,
    upstream: UpstreamConfig,
    entries: DashMap<i64, Arc<PoolEntry>>,
}

impl ClientPool {
    pub fn new(factory: Arc<dyn ClientFactory>, upstream: UpstreamConfig) -> Self {
        Self {
            factory,
            upstream,
            entries: DashMap::new(),
        }
    }

    fn entry(&self, account: &Account) -> Result<Arc<PoolEntry>, UpstreamError> {
        if let Some(entry) = self.entries.get(&account.id) {
            return Ok(entry.clone());
        }
        let params = SessionParams::from_account(account, &self.upstream)?;
        let client = self.factory.open(&params)?;
        let entry = Arc::new(PoolEntry {
            client,
            state: Mutex::new(ConnState::default()),
        });
        // A concurrent builder may have won the race; keep whichever landed.
        Ok(self
            .entries
            .entry(account.id)
            .or_insert(entry)
            .clone())
    }

    /// Run `body` against the account's connected client.
    ///
    /// The first scope connects lazily; the last release disconnects. Errors
    /// during disconnect are logged, never propagated.
    pub async fn with_connected<T, E, F, Fut>(&self, account: &Account, body: F) -> Result<T, E>
    where
        E: From<UpstreamError>,
        F: FnOnce(Arc<dyn UpstreamClient>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let entry = self.entry(account).map_err(E::from)?;
        let mut state = entry.state.lock().await;

        if !state.connected {
            entry.client.connect().await.map_err(E::from)?;
            state.connected = true;
        }
        state.refcount += 1;

        let result = body(entry.client.clone()).await;

        state.refcount = state.refcount.saturating_sub(1);
        if state.refcount == 0 && state.connected {
            if let Err(e) = entry.client.disconnect().await {
                warn!(account_id = account.id, error = %e, "pool: disconnect failed");
            }
            state.connected = false;
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackFactory, LoopbackWorld};
    use chrono::Utc;
    use tgharvest_store::AccountStatus;

    fn account(id: i64) -> Account {
        Account {
            id,
            label: format!("a{id}"),
            phone_number: String::new(),
            onboarding_method: String::new(),
            is_active: true,
            status: AccountStatus::Active,
            cooldown_until: None,
            last_error: String::new(),
            session_string: "sess".into(),
            api_id: Some(1),
            api_hash: Some("hash".into()),
            proxy_url: None,
            last_used_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn connects_lazily_and_disconnects_on_release() {
        let world = LoopbackWorld::new();
        let pool = ClientPool::new(
            Arc::new(LoopbackFactory::new(world.clone())),
            UpstreamConfig::default(),
        );
        let acc = account(1);

        let authorized: bool = pool
            .with_connected(&acc, |client| async move {
                client.is_authorized().await
            })
            .await
            .unwrap();
        assert!(authorized);

        assert_eq!(world.connect_count(1), 1);
        assert_eq!(world.disconnect_count(1), 1);

        // Second scope reconnects: refcount dropped to zero in between.
        pool.with_connected(&acc, |client| async move { client.is_authorized().await })
            .await
            .unwrap();
        assert_eq!(world.connect_count(1), 2);
        assert_eq!(world.disconnect_count(1), 2);
    }

    #[tokio::test]
    async fn missing_identity_surfaces_config_error() {
        let world = LoopbackWorld::new();
        let pool = ClientPool::new(
            Arc::new(LoopbackFactory::new(world)),
            UpstreamConfig::default(),
        );
        let mut acc = account(1);
        acc.api_id = None;
        acc.api_hash = None;

        let err: UpstreamError = pool
            .with_connected::<(), UpstreamError, _, _>(&acc, |_client| async move { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Config(_)));
    }

    #[tokio::test]
    async fn serializes_use_of_one_account() {
        let world = LoopbackWorld::new();
        let pool = Arc::new(ClientPool::new(
            Arc::new(LoopbackFactory::new(world.clone())),
            UpstreamConfig::default(),
        ));
        let acc = account(1);

        // Two concurrent scopes on the same account must not overlap: with
        // the entry lock held for the whole scope, each one observes a full
        // connect/disconnect cycle.
        let p1 = pool.clone();
        let a1 = acc.clone();
        let t1 = tokio::spawn(async move {
            p1.with_connected::<_, UpstreamError, _, _>(&a1, |client| async move {
                client.is_authorized().await
            })
            .await
        });
        let p2 = pool.clone();
        let a2 = acc.clone();
        let t2 = tokio::spawn(async move {
            p2.with_connected::<_, UpstreamError, _, _>(&a2, |client| async move {
                client.is_authorized().await
            })
            .await
        });
        t1.await.unwrap().unwrap();
        t2.await.unwrap().unwrap();

        assert_eq!(world.connect_count(1), 2);
        assert_eq!(world.disconnect_count(1), 2);
    }
}
