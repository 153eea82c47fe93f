//! Health monitor: one observation of the current instance per cycle.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ipnet::Ipv4Net;
use tracing::{debug, warn};

use vipwatch_cloud::CloudProvider;
use vipwatch_core::{HealthObservation, MonitoredInstance};

use crate::checker::Prober;

/// An observation together with the snapshot it was derived from.
///
/// The snapshot is only valid for the cycle that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSample {
    pub instance: Option<MonitoredInstance>,
    pub observation: HealthObservation,
}

impl HealthSample {
    /// Human summary used in the per-cycle status line.
    pub fn summary(&self) -> String {
        match &self.instance {
            None => "NOT FOUND".to_string(),
            Some(inst) if !inst.state.is_running() => format!("STATE: {}", inst.state),
            Some(inst) => {
                let ping = if self.observation.reachable {
                    "REACHABLE"
                } else {
                    "UNREACHABLE"
                };
                let ip = inst
                    .private_ip
                    .map(|ip| ip.to_string())
                    .unwrap_or_else(|| "no ip".to_string());
                format!(
                    "({ip}) in AZ {} - RUNNING, PING: {ping}",
                    inst.availability_zone
                )
            }
        }
    }
}

/// Samples existence, lifecycle state and reachability of an instance.
pub struct HealthMonitor {
    cloud: Arc<dyn CloudProvider>,
    prober: Arc<dyn Prober>,
    /// Address probed each cycle, taken from the routed CIDR.
    probe_target: Ipv4Addr,
}

impl HealthMonitor {
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        prober: Arc<dyn Prober>,
        destination_cidr: Ipv4Net,
    ) -> Self {
        Self {
            cloud,
            prober,
            probe_target: destination_cidr.addr(),
        }
    }

    pub fn probe_target(&self) -> Ipv4Addr {
        self.probe_target
    }

    /// Observe the instance.
    pub async fn observe(&self, instance_id: &str) -> HealthObservation {
        self.sample(instance_id).await.observation
    }

    /// Observe the instance and keep the snapshot for the caller.
    ///
    /// Any lookup failure is treated as the instance not existing.
    pub async fn sample(&self, instance_id: &str) -> HealthSample {
        let observed_at = epoch_secs();

        let instance = match self.cloud.describe_instance(instance_id).await {
            Ok(instance) => instance,
            Err(e) => {
                if e.is_not_found() {
                    debug!(instance = %instance_id, "instance not found");
                } else {
                    warn!(instance = %instance_id, error = %e, "instance lookup failed, treating as not found");
                }
                return HealthSample {
                    instance: None,
                    observation: HealthObservation::not_found(observed_at),
                };
            }
        };

        if !instance.state.is_running() {
            debug!(instance = %instance_id, state = %instance.state, "instance not running, skipping probe");
            return HealthSample {
                observation: HealthObservation::not_running(observed_at, instance.state.clone()),
                instance: Some(instance),
            };
        }

        let result = self.prober.probe(self.probe_target).await;
        debug!(instance = %instance_id, target = %self.probe_target, ?result, "probe finished");

        HealthSample {
            instance: Some(instance),
            observation: HealthObservation::probed(observed_at, result.is_reachable()),
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
