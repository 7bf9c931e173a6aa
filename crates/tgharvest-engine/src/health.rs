//! Account health pass.
//!
//! The pass is sequential: probing the whole fleet in parallel is exactly the
//! burst pattern that triggers upstream rate limits.

use chrono::{Duration, Utc};
use tracing::{info, warn};

use tgharvest_core::policy::UPSTREAM_SHORT_CALL_TIMEOUT_SECS;
use tgharvest_store::{AccountStatus, Store};
use tgharvest_upstream::{ClientPool, UpstreamError};

use crate::error::{EngineError, Result};

/// Per-status counters for tick telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthSummary {
    pub checked: u64,
    pub active: u64,
    pub auth_required: u64,
    pub cooldown: u64,
    pub banned: u64,
    pub error: u64,
}

enum Probe {
    Ok(String),
    Unauthorized,
}

/// Probe every active account and persist its classification.
///
/// A global config error (missing app identity) aborts the pass early; the
/// partial summary is still returned so the tick can record it.
pub async fn check_accounts(store: &Store, pool: &ClientPool) -> Result<HealthSummary> {
    let accounts = store.list_active_accounts()?;
    let mut summary = HealthSummary::default();

    if accounts.is_empty() {
        info!("health: no active accounts");
        return Ok(summary);
    }

    for account in accounts {
        summary.checked += 1;
        let now = Utc::now();

        if account.session_string.is_empty() {
            store.update_account_health(
                account.id,
                AccountStatus::AuthRequired,
                "Missing session_string",
                None,
                now,
            )?;
            summary.auth_required += 1;
            continue;
        }

        let probe = pool
            .with_connected::<_, EngineError, _, _>(&account, |client| async move {
                let work = async {
                    if !client.is_authorized().await? {
                        return Ok(Probe::Unauthorized);
                    }
                    let me = client.get_me().await?;
                    Ok(Probe::Ok(me.to_string()))
                };
                let deadline = std::time::Duration::from_secs(UPSTREAM_SHORT_CALL_TIMEOUT_SECS);
                match tokio::time::timeout(deadline, work).await {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::Upstream(UpstreamError::Transport(
                        "health probe timed out".to_string(),
                    ))),
                }
            })
            .await;

        match probe {
            Ok(Probe::Ok(identity)) => {
                store.update_account_health(
                    account.id,
                    AccountStatus::Active,
                    &format!("OK: {identity}"),
                    None,
                    now,
                )?;
                summary.active += 1;
            }
            Ok(Probe::Unauthorized) => {
                store.update_account_health(
                    account.id,
                    AccountStatus::AuthRequired,
                    "Session is not authorized",
                    None,
                    now,
                )?;
                summary.auth_required += 1;
            }
            Err(EngineError::Config(msg)) => {
                // Config issue is global; no point iterating further.
                warn!(error = %msg, "health: upstream config error, aborting pass");
                break;
            }
            Err(EngineError::Upstream(UpstreamError::FloodWait { seconds })) => {
                store.update_account_health(
                    account.id,
                    AccountStatus::Cooldown,
                    &format!("FloodWait: {seconds}s"),
                    Some(now + Duration::seconds(seconds as i64)),
                    now,
                )?;
                summary.cooldown += 1;
            }
            Err(EngineError::Upstream(
                UpstreamError::Frozen(ref name) | UpstreamError::Banned(ref name),
            )) => {
                store.quarantine_account(
                    account.id,
                    AccountStatus::Banned,
                    &format!("Frozen/banned: {name}"),
                    now,
                )?;
                warn!(account_id = account.id, "health: quarantined banned account");
                summary.banned += 1;
            }
            Err(EngineError::Upstream(UpstreamError::Deactivated(ref name))) => {
                store.quarantine_account(
                    account.id,
                    AccountStatus::Forbidden,
                    &format!("Deactivated: {name}"),
                    now,
                )?;
                warn!(account_id = account.id, "health: quarantined deactivated account");
                summary.banned += 1;
            }
            Err(EngineError::Upstream(err)) => {
                store.update_account_health(
                    account.id,
                    AccountStatus::Error,
                    &err.to_string(),
                    None,
                    now,
                )?;
                summary.error += 1;
            }
            Err(e) => return Err(e),
        }
    }

    info!(checked = summary.checked, active = summary.active, "health: pass done");
    Ok(summary)
}
