use std::sync::Arc;

use tgharvest_core::config::UpstreamConfig;
use tgharvest_store::Account;

use crate::client::UpstreamClient;
use crate::error::{Result, UpstreamError};

/// Everything an adapter needs to open one account's client: the opaque
/// session capability plus the upstream app identity.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub account_id: i64,
    pub session_string: String,
    pub api_id: i64,
    pub api_hash: String,
    pub proxy_url: Option<String>,
}

impl SessionParams {
    /// Build params from an account row, falling back to the workspace-level
    /// app identity when the account carries none of its own.
    pub fn from_account(account: &Account, upstream: &UpstreamConfig) -> Result<Self> {
        let api_id = account
            .api_id
            .filter(|id| *id != 0)
            .or(upstream.api_id)
            .ok_or_else(|| {
                UpstreamError::Config(
                    "upstream api_id is not configured (account or [upstream] section)"
                        .to_string(),
                )
            })?;
        let api_hash = account
            .api_hash
            .clone()
            .filter(|h| !h.is_empty())
            .or_else(|| upstream.api_hash.clone())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| {
                UpstreamError::Config(
                    "upstream api_hash is not configured (account or [upstream] section)"
                        .to_string(),
                )
            })?;

        Ok(Self {
            account_id: account.id,
            session_string: account.session_string.clone(),
            api_id,
            api_hash,
            proxy_url: account.proxy_url.clone(),
        })
    }
}

/// Builds an unconnected client from session params. Factories are pure:
/// no state beyond what the params carry.
pub trait ClientFactory: Send + Sync {
    fn open(&self, params: &SessionParams) -> Result<Arc<dyn UpstreamClient>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tgharvest_store::AccountStatus;

    fn account(api_id: Option<i64>, api_hash: Option<&str>) -> Account {
        Account {
            id: 7,
            label: "a".into(),
            phone_number: String::new(),
            onboarding_method: String::new(),
            is_active: true,
            status: AccountStatus::Active,
            cooldown_until: None,
            last_error: String::new(),
            session_string: "sess".into(),
            api_id,
            api_hash: api_hash.map(String::from),
            proxy_url: None,
            last_used_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn account_credentials_win_over_config() {
        let cfg = UpstreamConfig {
            api_id: Some(1),
            api_hash: Some("global".into()),
            ..UpstreamConfig::default()
        };
        let params = SessionParams::from_account(&account(Some(2), Some("own")), &cfg).unwrap();
        assert_eq!(params.api_id, 2);
        assert_eq!(params.api_hash, "own");
    }

    #[test]
    fn config_fallback_applies() {
        let cfg = UpstreamConfig {
            api_id: Some(1),
            api_hash: Some("global".into()),
            ..UpstreamConfig::default()
        };
        let params = SessionParams::from_account(&account(None, None), &cfg).unwrap();
        assert_eq!(params.api_id, 1);
        assert_eq!(params.api_hash, "global");
    }

    #[test]
    fn missing_identity_is_a_config_error() {
        let cfg = UpstreamConfig::default();
        let err = SessionParams::from_account(&account(None, None), &cfg).unwrap_err();
        assert!(matches!(err, UpstreamError::Config(_)));
    }
}
