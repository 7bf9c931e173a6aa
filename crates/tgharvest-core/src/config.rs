use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Top-level config (tgharvest.toml + TGHARVEST_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvesterConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ephemeral: EphemeralConfig,
    #[serde(default)]
    pub tick: TickConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            ephemeral: EphemeralConfig::default(),
            tick: TickConfig::default(),
            upstream: UpstreamConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Redis-compatible ephemeral store holding the tick lock and tick metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EphemeralConfig {
    #[serde(default = "default_ephemeral_url")]
    pub url: String,
}

impl Default for EphemeralConfig {
    fn default() -> Self {
        Self {
            url: default_ephemeral_url(),
        }
    }
}

/// Tick cadence and parsing defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickConfig {
    /// Seconds between tick attempts (default: 3600).
    #[serde(default = "default_tick_interval")]
    pub interval_seconds: u64,
    /// Applied when a channel is created without an explicit backfill window.
    #[serde(default)]
    pub default_backfill_days: u32,
    /// Explicit lock TTL override. When unset the TTL is computed as
    /// `max(3300, interval_seconds + 300)` so a lock always outlives its tick.
    pub lock_ttl_seconds: Option<u64>,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_tick_interval(),
            default_backfill_days: 0,
            lock_ttl_seconds: None,
        }
    }
}

impl TickConfig {
    /// Effective lock TTL in seconds.
    pub fn lock_ttl_seconds(&self) -> u64 {
        self.lock_ttl_seconds
            .unwrap_or_else(|| (self.interval_seconds + 300).max(3300))
    }
}

/// Workspace-level upstream app identity, used when an account carries none
/// of its own. `adapter` names the transport the daemon wires in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub api_id: Option<i64>,
    pub api_hash: Option<String>,
    #[serde(default = "default_adapter")]
    pub adapter: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_id: None,
            api_hash: None,
            adapter: default_adapter(),
        }
    }
}

/// Operator notification settings. All optional; the notifier degrades to a
/// no-op when the token or recipient is missing.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotifyConfig {
    pub bot_token: Option<String>,
    pub operator_chat_id: Option<i64>,
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tgharvest/tgharvest.db", home)
}
fn default_ephemeral_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}
fn default_tick_interval() -> u64 {
    3600
}
fn default_adapter() -> String {
    "loopback".to_string()
}

impl HarvesterConfig {
    /// Load config from a TOML file with TGHARVEST_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.tgharvest/tgharvest.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: HarvesterConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TGHARVEST_").split("_"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tgharvest/tgharvest.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_ttl_floor_applies_to_short_intervals() {
        let tick = TickConfig {
            interval_seconds: 600,
            ..TickConfig::default()
        };
        assert_eq!(tick.lock_ttl_seconds(), 3300);
    }

    #[test]
    fn lock_ttl_tracks_long_intervals() {
        let tick = TickConfig {
            interval_seconds: 7200,
            ..TickConfig::default()
        };
        assert_eq!(tick.lock_ttl_seconds(), 7500);
    }

    #[test]
    fn lock_ttl_override_wins() {
        let tick = TickConfig {
            interval_seconds: 3600,
            lock_ttl_seconds: Some(120),
            ..TickConfig::default()
        };
        assert_eq!(tick.lock_ttl_seconds(), 120);
    }
}
