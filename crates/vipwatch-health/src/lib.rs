//! vipwatch-health: health observation for the monitored instance.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor::observe(instance_id)
//!   ├── CloudProvider::describe_instance → MonitoredInstance | not found
//!   ├── state != running → no probe
//!   └── Prober::probe(cidr address) → ProbeResult
//!         └── PingProber: `ping -c 1 -W 2`, 5s hard limit
//! ```
//!
//! The probe targets the address of the routed destination CIDR, not the
//! instance's own private address: what matters is whether the virtual
//! address answers.
//!
//! There is no debounce. One lost echo marks the instance unreachable for
//! the cycle.

pub mod checker;
pub mod monitor;

pub use checker::{PingProber, ProbeError, ProbeResult, Prober};
pub use monitor::{HealthMonitor, HealthSample};
