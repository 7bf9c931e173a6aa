//! `tgharvest-upstream` — the upstream client capability.
//!
//! The harvester never talks to a concrete chat library directly. It sees a
//! narrow [`client::UpstreamClient`] trait plus a [`session::ClientFactory`]
//! that turns an account's opaque session capability into a client. Concrete
//! MTProto transports live outside this workspace and plug in through the
//! factory; the in-tree [`loopback`] adapter backs tests and development
//! runs.
//!
//! Upstream failures arrive as one tagged [`error::UpstreamError`] produced
//! by [`error::classify_rpc`]; callers switch on the variant, never on error
//! strings.

pub mod client;
pub mod error;
pub mod loopback;
pub mod pool;
pub mod session;

pub use client::{
    Dialog, Entity, EntityRef, HistoryRequest, Identity, JoinOutcome, JoinTarget, MessageStream,
    UpstreamClient, UpstreamMessage,
};
pub use error::{classify_rpc, Result, UpstreamError};
pub use pool::ClientPool;
pub use session::{ClientFactory, SessionParams};
