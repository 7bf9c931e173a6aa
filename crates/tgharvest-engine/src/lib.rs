//! `tgharvest-engine` — the harvest tick.
//!
//! # Overview
//!
//! A tick is one singleton scheduler cycle:
//!
//! 1. acquire the distributed lock ([`lock::TickLock`]) and spawn its
//!    refresher,
//! 2. refresh account health ([`health`]),
//! 3. route every actionable channel to a ready account and pull new
//!    messages past its cursor ([`parser`]),
//! 4. advance pending memberships best-effort ([`maintenance`]),
//! 5. persist the tick summary to the ephemeral store and release the lock
//!    ([`tick::Harvester`]).
//!
//! Channels are processed sequentially within a tick; the client pool
//! serializes per-account use. Multi-process overlap is prevented by the
//! token-matched lock, not by any in-process state.

pub mod dialogs;
pub mod ephemeral;
pub mod error;
pub mod health;
pub mod join;
pub mod lock;
pub mod maintenance;
pub mod notify;
pub mod parser;
pub mod tick;

pub use error::{EngineError, Result};
pub use ephemeral::{EphemeralStore, MemoryEphemeral, RedisEphemeral};
pub use notify::{Notify, NoopNotifier};
pub use tick::{Harvester, TickMeta, TickOutcome};
