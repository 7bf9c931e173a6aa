//! `tgharvest-core` — configuration and shared policy for the harvester.
//!
//! Everything here is passed explicitly into the components that need it;
//! there are no module-level globals. The config file is `tgharvest.toml`
//! with `TGHARVEST_*` environment overrides.

pub mod config;
pub mod error;
pub mod policy;

pub use config::HarvesterConfig;
pub use error::{CoreError, Result};
