//! vipwatch-core: shared types and configuration for the vipwatch
//! failover controller.
//!
//! Every other crate in the workspace speaks in terms of the snapshots
//! and values defined here: the instance snapshot returned by the cloud
//! provider, the per-cycle health observation, the failover action, and
//! the plan built when a replacement is needed.

pub mod config;
pub mod duration;
pub mod types;

pub use config::{ConfigError, VipwatchConfig};
pub use duration::parse_duration;
pub use types::*;
