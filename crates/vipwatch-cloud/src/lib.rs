//! vipwatch-cloud: the cloud provider capability consumed by the
//! failover controller.
//!
//! # Backends
//!
//! ```text
//! CloudProvider (trait)
//!   ├── AwsCli      : shells out to `aws ec2 ... --output json`
//!   └── MemoryCloud : in-process VPC model, records every mutation
//! ```
//!
//! Components never hold a process-wide client; each one is handed an
//! `Arc<dyn CloudProvider>` at construction.

pub mod aws;
pub mod error;
pub mod memory;
pub mod provider;

pub use aws::AwsCli;
pub use error::{CloudError, CloudResult};
pub use memory::{CloudCall, MemoryCloud};
pub use provider::{CloudProvider, RunInstanceRequest, SubnetFilter};
