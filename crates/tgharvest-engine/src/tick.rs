//! Tick scheduler: singleton periodic driver with a renewable lock, per-tick
//! id and a persisted summary.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tgharvest_core::policy::{LOCK_REFRESH_INTERVAL_SECS, MAINTENANCE_CHANNEL_CAP};
use tgharvest_core::HarvesterConfig;
use tgharvest_store::Store;
use tgharvest_upstream::ClientPool;

use crate::ephemeral::EphemeralStore;
use crate::error::Result;
use crate::health;
use crate::lock::{TickLock, META_KEY, SEQ_KEY};
use crate::maintenance;
use crate::notify::Notify;
use crate::parser;

/// Summary of one completed tick, persisted to the ephemeral store for
/// operator observability.
#[derive(Debug, Clone, PartialEq)]
pub struct TickMeta {
    pub tick_id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Seconds with millisecond resolution.
    pub duration_s: f64,
    pub accounts_checked: u64,
    pub accounts_auth_required: u64,
    pub accounts_cooldown: u64,
    pub accounts_banned: u64,
    pub accounts_error: u64,
    pub channels_total: u64,
    pub channels_checked: u64,
    pub posts_inserted: u64,
}

impl TickMeta {
    /// Field list for the `tgparser:tick:last` hash.
    pub fn fields(&self) -> Vec<(String, String)> {
        vec![
            ("tick_id".to_string(), self.tick_id.to_string()),
            ("started_at".to_string(), self.started_at.to_rfc3339()),
            ("finished_at".to_string(), self.finished_at.to_rfc3339()),
            ("duration_s".to_string(), format!("{:.3}", self.duration_s)),
            (
                "accounts_checked".to_string(),
                self.accounts_checked.to_string(),
            ),
            (
                "accounts_auth_required".to_string(),
                self.accounts_auth_required.to_string(),
            ),
            (
                "accounts_cooldown".to_string(),
                self.accounts_cooldown.to_string(),
            ),
            (
                "accounts_banned".to_string(),
                self.accounts_banned.to_string(),
            ),
            ("accounts_error".to_string(), self.accounts_error.to_string()),
            ("channels_total".to_string(), self.channels_total.to_string()),
            (
                "channels_checked".to_string(),
                self.channels_checked.to_string(),
            ),
            (
                "posts_inserted".to_string(),
                self.posts_inserted.to_string(),
            ),
        ]
    }
}

/// Result of a single-shot tick attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Completed,
    /// Another holder owns the tick lock.
    SkippedLockHeld,
}

/// The harvest driver: owns the wiring and runs ticks.
pub struct Harvester {
    store: Arc<Store>,
    pool: Arc<ClientPool>,
    ephemeral: Arc<dyn EphemeralStore>,
    notifier: Arc<dyn Notify>,
    config: HarvesterConfig,
}

impl Harvester {
    pub fn new(
        store: Arc<Store>,
        pool: Arc<ClientPool>,
        ephemeral: Arc<dyn EphemeralStore>,
        notifier: Arc<dyn Notify>,
        config: HarvesterConfig,
    ) -> Self {
        Self {
            store,
            pool,
            ephemeral,
            notifier,
            config,
        }
    }

    /// Scheduler loop: attempt a tick, sleep the interval, repeat. Failed
    /// ticks are logged and retried on the next interval.
    pub async fn run_loop(&self) {
        let interval = self.config.tick.interval_seconds;
        info!(interval_seconds = interval, "harvester: scheduler started");
        loop {
            match self.run_once(false).await {
                Ok(TickOutcome::Completed) => {}
                Ok(TickOutcome::SkippedLockHeld) => {}
                Err(e) => error!(error = %e, "tick: failed"),
            }
            tokio::time::sleep(std::time::Duration::from_secs(interval)).await;
        }
    }

    /// One tick attempt. `force` bypasses the lock for operator-driven runs.
    pub async fn run_once(&self, force: bool) -> Result<TickOutcome> {
        let lock = TickLock::new(
            self.ephemeral.clone(),
            self.config.tick.lock_ttl_seconds(),
        );

        let guard = if force {
            info!("tick: lock bypassed (force)");
            None
        } else {
            match lock.acquire().await? {
                Some(guard) => Some(guard),
                None => {
                    info!("tick: skipped (lock held)");
                    return Ok(TickOutcome::SkippedLockHeld);
                }
            }
        };

        // Detached refresher: keeps the TTL alive while the tick runs.
        // Losing it is observable (the lock may lapse) but not fatal.
        let refresher = guard
            .as_ref()
            .map(|g| spawn_refresher(lock.clone(), g.token().to_string()));

        let result = async {
            let tick_id = self.ephemeral.incr(SEQ_KEY).await?;
            self.run_tick(tick_id).await
        }
        .await;

        if let Some(handle) = refresher {
            handle.abort();
        }

        if let Ok(meta) = &result {
            if let Err(e) = self.ephemeral.put_hash(META_KEY, &meta.fields()).await {
                warn!(error = %e, "tick: meta write failed");
            }
        }

        if let Some(guard) = guard {
            match lock.release(guard).await {
                Ok(true) => debug!("tick: lock released"),
                Ok(false) => warn!("tick: lock was no longer ours at release"),
                Err(e) => warn!(error = %e, "tick: lock release failed"),
            }
        }

        result.map(|_| TickOutcome::Completed)
    }

    /// Tick body: health pass, parse pass, best-effort maintenance.
    async fn run_tick(&self, tick_id: i64) -> Result<TickMeta> {
        let started = Utc::now();
        info!(tick_id, "tick: started");

        let health = health::check_accounts(&self.store, &self.pool).await?;
        let parse =
            parser::parse_new_posts_once(&self.store, &self.pool, self.notifier.as_ref()).await?;

        match maintenance::ensure_membership_once(&self.store, &self.pool, MAINTENANCE_CHANNEL_CAP)
            .await
        {
            Ok(m) => debug!(
                touched = m.channels_touched,
                updated = m.memberships_updated,
                "tick: maintenance done"
            ),
            // Best-effort: maintenance never fails a tick.
            Err(e) => warn!(error = %e, "tick: membership maintenance failed"),
        }

        let finished = Utc::now();
        let duration_s = (finished - started).num_milliseconds() as f64 / 1000.0;
        info!(
            tick_id,
            duration_s,
            accounts_checked = health.checked,
            channels_checked = parse.channels_checked,
            posts_inserted = parse.posts_inserted,
            "tick: ok"
        );

        Ok(TickMeta {
            tick_id,
            started_at: started,
            finished_at: finished,
            duration_s,
            accounts_checked: health.checked,
            accounts_auth_required: health.auth_required,
            accounts_cooldown: health.cooldown,
            accounts_banned: health.banned,
            accounts_error: health.error,
            channels_total: parse.channels_total,
            channels_checked: parse.channels_checked,
            posts_inserted: parse.posts_inserted,
        })
    }
}

fn spawn_refresher(lock: TickLock, token: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            LOCK_REFRESH_INTERVAL_SECS,
        ));
        // The first tick fires immediately; the lock was just taken.
        interval.tick().await;
        loop {
            interval.tick().await;
            match lock.refresh(&token).await {
                Ok(true) => debug!("tick: lock refreshed"),
                Ok(false) => warn!("tick: lock lost; finishing current tick anyway"),
                Err(e) => warn!(error = %e, "tick: lock refresh failed"),
            }
        }
    })
}
