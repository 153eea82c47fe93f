//! vipwatch-failover: keeps one virtual-IP owner instance alive.
//!
//! # Components
//!
//! - **`decision`**: pure `HealthObservation → Action` mapping and target zone choice
//! - **`provisioner`**: launches and readies a replacement in another zone
//! - **`routes`**: repoints every route table of the VPC at the replacement
//! - **`controller`**: the monitor → decide → failover loop
//!
//! # Failover sequence
//!
//! ```text
//! Monitoring(current) ──Replace(reason)──▶ Failing
//!        ▲                                   │ pick target zone (≠ current)
//!        │                                   ▼
//!        │                              Provisioning ── launch, wait running,
//!        │                                   │          wait status ok,
//!        │                                   │          disable src/dst check
//!        │                                   ▼          + bootstrap grace
//!        └──── terminate old, switch ◀── Converging(new)
//! ```
//!
//! Nothing is rolled back. A stop between steps leaves whatever the
//! sequence had reached; a restarted controller simply resumes monitoring.

pub mod controller;
pub mod decision;
pub mod error;
pub mod naming;
pub mod outcome;
pub mod provisioner;
pub mod routes;
pub mod template;

pub use controller::{
    CycleOutcome, FailoverController, FailoverSettings, MAX_CONVERGE_ATTEMPTS, Phase,
};
pub use decision::{decide, pick_target_zone};
pub use error::{FailoverError, ProvisionError, RouteError};
pub use naming::{NameGenerator, RandomNames, SequentialNames};
pub use outcome::Outcome;
pub use provisioner::InstanceProvisioner;
pub use routes::{ReconcileReport, RouteReconciler, TableReport};
pub use template::{render_bootstrap, validate_template};
