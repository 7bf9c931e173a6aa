use thiserror::Error;

use tgharvest_upstream::UpstreamError;

use crate::ephemeral::EphemeralError;

/// Errors that can cross component boundaries inside a tick.
///
/// `Config` aborts the current pass; `Store` / `Ephemeral` fail the tick
/// (the scheduler retries next interval). `Upstream` never leaves the
/// attempt loops; the parser and maintenance convert it into cooldown,
/// quarantine or membership state instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] tgharvest_store::StoreError),

    #[error(transparent)]
    Ephemeral(#[from] EphemeralError),

    #[error("Upstream error: {0}")]
    Upstream(UpstreamError),
}

impl From<UpstreamError> for EngineError {
    fn from(e: UpstreamError) -> Self {
        match e {
            // Missing app identity is global, not per-account.
            UpstreamError::Config(msg) => EngineError::Config(msg),
            other => EngineError::Upstream(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
