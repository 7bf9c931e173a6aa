//! `tgharvest-store` — persistent state for the harvester (SQLite).
//!
//! # Overview
//!
//! Four long-lived tables (`accounts`, `channels`, `posts`, `memberships`)
//! plus the `operators` table consumed by the notifier. Rows are never hard
//! deleted: operator "remove" flips `is_active` off. Posts are append-only
//! and deduplicated on `(channel_id, message_id)`.
//!
//! All timestamps are RFC 3339 `TEXT` columns in UTC, compared
//! lexicographically in SQL.

pub mod db;
pub mod error;
pub mod store;
pub mod types;

pub use error::{Result, StoreError};
pub use store::Store;
pub use types::{
    Account, AccountStatus, Channel, ChannelAccessStatus, ChannelType, Membership,
    MembershipStatus, NewAccount, NewChannel, NewPost, Operator, Pick, Post,
};
