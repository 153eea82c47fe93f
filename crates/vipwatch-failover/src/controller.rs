//! Failover controller: the monitor, decide, fail over loop.
//!
//! One task drives everything in sequence. A stop request is honored
//! between cycles and between the blocking steps of a failover, never
//! inside one; a stop mid-failover leaves whatever state the sequence had
//! reached.

use std::sync::Arc;

use ipnet::Ipv4Net;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use vipwatch_cloud::{CloudProvider, SubnetFilter};
use vipwatch_core::config::{FallbackConfig, Timings};
use vipwatch_core::{
    Action, FailoverPlan, InstanceId, LaunchSpec, MonitoredInstance, ReplaceReason,
};
use vipwatch_health::{HealthMonitor, Prober};

use crate::decision::{decide, pick_target_zone};
use crate::error::FailoverError;
use crate::naming::NameGenerator;
use crate::outcome::Outcome;
use crate::provisioner::InstanceProvisioner;
use crate::routes::RouteReconciler;

/// Route moves tried for one replacement before it is given up.
pub const MAX_CONVERGE_ATTEMPTS: u32 = 3;

/// Fixed inputs of a controller, resolved once at startup.
#[derive(Debug, Clone)]
pub struct FailoverSettings {
    /// CIDR routed through the current instance; its address is probed.
    pub destination_cidr: Ipv4Net,
    pub security_group: String,
    pub key_name: String,
    /// Bootstrap template text.
    pub template: String,
    pub fallback: FallbackConfig,
    pub timings: Timings,
}

/// Where the controller is in the failover sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Monitoring {
        current: InstanceId,
    },
    Failing {
        /// Absent when the instance could not be found.
        current: Option<InstanceId>,
        reason: ReplaceReason,
    },
    Provisioning {
        plan: FailoverPlan,
    },
    /// A replacement is up; routes are being moved to it.
    Converging {
        old: Option<InstanceId>,
        new: InstanceId,
    },
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Monitoring { .. } => "monitoring",
            Phase::Failing { .. } => "failing",
            Phase::Provisioning { .. } => "provisioning",
            Phase::Converging { .. } => "converging",
        }
    }
}

/// What a single cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The current instance is healthy.
    Healthy,
    /// A failover was needed but could not start; retried after the backoff.
    Skipped { reason: String },
    FailedOver {
        old: Option<InstanceId>,
        new: InstanceId,
    },
    /// A stop was requested partway through a failover.
    Interrupted,
}

pub struct FailoverController {
    cloud: Arc<dyn CloudProvider>,
    monitor: HealthMonitor,
    provisioner: InstanceProvisioner,
    reconciler: RouteReconciler,
    settings: FailoverSettings,
    current: InstanceId,
    phase: Phase,
    /// Failed route moves for the replacement in `Phase::Converging`.
    converge_attempts: u32,
}

impl FailoverController {
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        prober: Arc<dyn Prober>,
        names: Arc<dyn NameGenerator>,
        settings: FailoverSettings,
        instance_id: &str,
    ) -> Self {
        let monitor = HealthMonitor::new(cloud.clone(), prober, settings.destination_cidr);
        let provisioner = InstanceProvisioner::new(
            cloud.clone(),
            names,
            settings.timings.running_timeout,
            settings.timings.status_ok_timeout,
        );
        let reconciler = RouteReconciler::new(cloud.clone());
        Self {
            cloud,
            monitor,
            provisioner,
            reconciler,
            settings,
            current: instance_id.to_string(),
            phase: Phase::Monitoring {
                current: instance_id.to_string(),
            },
            converge_attempts: 0,
        }
    }

    /// The instance currently believed to own the virtual IP.
    pub fn current_instance(&self) -> &str {
        &self.current
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Run cycles until `shutdown` flips to `true`.
    ///
    /// Returns `Ok(())` on a requested stop and `Err` only for errors that
    /// no retry can fix. Every other failure is logged and the next cycle
    /// starts after the usual interval.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), FailoverError> {
        info!(
            instance = %self.current,
            cidr = %self.settings.destination_cidr,
            interval_secs = self.settings.timings.interval.as_secs(),
            "failover controller started"
        );

        loop {
            if stopping(&shutdown) {
                break;
            }

            let pause = match self.run_cycle(&shutdown).await {
                Ok(CycleOutcome::Skipped { reason }) => {
                    warn!(%reason, "failover skipped, retrying after backoff");
                    self.settings.timings.retry_backoff
                }
                Ok(CycleOutcome::Interrupted) => break,
                Ok(_) => self.settings.timings.interval,
                Err(e) if e.is_fatal() => {
                    error!(error = %e, phase = self.phase.name(), "unrecoverable failover error");
                    return Err(e);
                }
                Err(e) => {
                    error!(error = %e, phase = self.phase.name(), "failover cycle failed");
                    self.settings.timings.interval
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(instance = %self.current, "failover controller stopped");
        Ok(())
    }

    /// Observe the current instance once and fail over if it must be
    /// replaced.
    ///
    /// A cycle that starts in `Converging` retries the route move before
    /// acting on the observation, as long as the replacement is still
    /// running and fewer than [`MAX_CONVERGE_ATTEMPTS`] moves have failed.
    /// Otherwise the replacement is dropped and the cycle carries on as a
    /// normal monitoring cycle.
    pub async fn run_cycle(
        &mut self,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<CycleOutcome, FailoverError> {
        let sample = self.monitor.sample(&self.current).await;
        info!(
            observed_at = sample.observation.observed_at,
            instance = %self.current,
            phase = self.phase.name(),
            status = %sample.summary(),
            "status"
        );

        if let Phase::Converging { old, new } = self.phase.clone() {
            if self.can_resume(&new).await {
                info!(
                    new = %new,
                    attempt = self.converge_attempts + 1,
                    "resuming route convergence"
                );
                return self.converge(old, new, shutdown).await;
            }
            self.abandon(&new).await;
        }

        let reason = match decide(&sample.observation) {
            Action::NoAction => {
                self.phase = Phase::Monitoring {
                    current: self.current.clone(),
                };
                return Ok(CycleOutcome::Healthy);
            }
            Action::Replace(reason) => reason,
        };

        let old = sample.instance.as_ref().map(|i| i.id.clone());
        warn!(instance = %self.current, %reason, "instance must be replaced");
        self.phase = Phase::Failing {
            current: old.clone(),
            reason,
        };

        let spec = match sample.instance.as_ref().and_then(LaunchSpec::from_instance) {
            Some(spec) => spec,
            None => match self.fallback_spec(sample.instance.as_ref()).await? {
                Some(spec) => spec,
                None => return Ok(self.skip("no subnet available for a fallback launch")),
            },
        };

        let zones = self.cloud.availability_zones().await?;
        let Some(target_az) = pick_target_zone(&zones, &spec.availability_zone) else {
            return Ok(self.skip(format!(
                "no availability zone other than {}",
                spec.availability_zone
            )));
        };

        if stopping(shutdown) {
            return Ok(self.interrupted());
        }

        let plan = FailoverPlan {
            old_instance_id: old.clone(),
            target_az: target_az.to_string(),
            destination_cidr: self.settings.destination_cidr,
            security_group: self.settings.security_group.clone(),
            key_name: self.settings.key_name.clone(),
            template: self.settings.template.clone(),
        };
        info!(
            old = old.as_deref().unwrap_or("-"),
            from_zone = %spec.availability_zone,
            to_zone = %plan.target_az,
            "provisioning replacement"
        );
        self.phase = Phase::Provisioning { plan: plan.clone() };

        let new = match self.provisioner.launch(&spec, &plan).await {
            Ok(id) => id,
            Err(e) if e.is_capacity_gap() => return Ok(self.skip(e.to_string())),
            Err(e) => {
                self.phase = Phase::Monitoring {
                    current: self.current.clone(),
                };
                return Err(e.into());
            }
        };

        if stopping(shutdown) {
            return Ok(self.interrupted());
        }

        debug!(
            instance = %new,
            grace_secs = self.settings.timings.bootstrap_grace.as_secs(),
            "waiting for bootstrap payload"
        );
        tokio::time::sleep(self.settings.timings.bootstrap_grace).await;

        self.phase = Phase::Converging {
            old: old.clone(),
            new: new.clone(),
        };
        self.converge_attempts = 0;
        self.converge(old, new, shutdown).await
    }

    /// Whether another route move toward `new` is worth trying.
    async fn can_resume(&self, new: &str) -> bool {
        if self.converge_attempts >= MAX_CONVERGE_ATTEMPTS {
            error!(
                new = %new,
                attempts = self.converge_attempts,
                "routes could not be moved, giving up on replacement"
            );
            return false;
        }
        match self.cloud.describe_instance(new).await {
            Ok(instance) if instance.state.is_running() => true,
            Ok(instance) => {
                warn!(new = %new, state = %instance.state, "replacement stopped before routes moved");
                false
            }
            Err(e) if e.is_not_found() => {
                warn!(new = %new, "replacement vanished before routes moved");
                false
            }
            // Let the route move itself fail and count as an attempt.
            Err(e) => {
                debug!(new = %new, error = %e, "cannot describe replacement");
                true
            }
        }
    }

    /// Drop a replacement whose routes were never moved and go back to
    /// watching the current instance.
    async fn abandon(&mut self, new: &str) {
        match Outcome::from(self.cloud.terminate_instance(new).await) {
            Outcome::Ok => info!(instance = %new, "terminated abandoned replacement"),
            Outcome::NotFound => debug!(instance = %new, "abandoned replacement already gone"),
            Outcome::Failed(detail) => {
                warn!(instance = %new, error = %detail, "failed to terminate abandoned replacement")
            }
        }
        self.converge_attempts = 0;
        self.phase = Phase::Monitoring {
            current: self.current.clone(),
        };
    }

    /// Move routes to `new`, retire `old`, and make `new` current.
    async fn converge(
        &mut self,
        old: Option<InstanceId>,
        new: InstanceId,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<CycleOutcome, FailoverError> {
        if stopping(shutdown) {
            return Ok(self.interrupted());
        }

        // On error the phase stays Converging so the next cycle retries.
        let report = match self
            .reconciler
            .reconcile(old.as_deref(), &new, self.settings.destination_cidr)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                self.converge_attempts += 1;
                return Err(e.into());
            }
        };
        if !report.fully_converged() {
            warn!(
                vpc = %report.vpc_id,
                failed = report.failed(),
                "some route tables were not updated"
            );
        }

        if stopping(shutdown) {
            return Ok(self.interrupted());
        }

        if let Some(old_id) = &old {
            match Outcome::from(self.cloud.terminate_instance(old_id).await) {
                Outcome::Ok => info!(instance = %old_id, "terminated old instance"),
                Outcome::NotFound => debug!(instance = %old_id, "old instance already gone"),
                Outcome::Failed(detail) => {
                    warn!(instance = %old_id, error = %detail, "failed to terminate old instance")
                }
            }
        }

        info!(
            old = old.as_deref().unwrap_or("-"),
            new = %new,
            "failover complete"
        );
        self.current = new.clone();
        self.converge_attempts = 0;
        self.phase = Phase::Monitoring {
            current: new.clone(),
        };
        Ok(CycleOutcome::FailedOver { old, new })
    }

    /// Launch parameters when the lost instance no longer says where it
    /// lived. Uses the instance's zone if known, otherwise the first zone of
    /// the region, and any subnet there.
    async fn fallback_spec(
        &self,
        instance: Option<&MonitoredInstance>,
    ) -> Result<Option<LaunchSpec>, FailoverError> {
        let zone = match instance {
            Some(inst) => inst.availability_zone.clone(),
            None => match self.cloud.availability_zones().await?.into_iter().next() {
                Some(zone) => zone,
                None => return Ok(None),
            },
        };

        let Some(subnet) = self
            .cloud
            .find_subnets(&SubnetFilter::in_zone(&zone))
            .await?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };

        let fallback = &self.settings.fallback;
        let spec = LaunchSpec {
            image_id: instance
                .map(|i| i.image_id.clone())
                .unwrap_or_else(|| fallback.image_id.clone()),
            instance_type: instance
                .map(|i| i.instance_type.clone())
                .unwrap_or_else(|| fallback.instance_type.clone()),
            subnet_id: subnet.id,
            availability_zone: zone,
        };
        warn!(
            zone = %spec.availability_zone,
            subnet = %spec.subnet_id,
            image = %spec.image_id,
            instance_type = %spec.instance_type,
            "lost instance left no launch parameters, using fallback"
        );
        Ok(Some(spec))
    }

    fn skip(&mut self, reason: impl Into<String>) -> CycleOutcome {
        self.phase = Phase::Monitoring {
            current: self.current.clone(),
        };
        CycleOutcome::Skipped {
            reason: reason.into(),
        }
    }

    fn interrupted(&self) -> CycleOutcome {
        warn!(
            phase = self.phase.name(),
            instance = %self.current,
            "stopped mid-failover, route convergence state unknown"
        );
        CycleOutcome::Interrupted
    }
}

fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use async_trait::async_trait;
    use vipwatch_cloud::{CloudCall, MemoryCloud};
    use vipwatch_health::ProbeResult;

    use super::*;
    use crate::naming::SequentialNames;

    struct FixedProber(ProbeResult);

    #[async_trait]
    impl Prober for FixedProber {
        async fn probe(&self, _target: Ipv4Addr) -> ProbeResult {
            self.0
        }
    }

    fn cloud() -> MemoryCloud {
        MemoryCloud::new()
            .with_zone("us-east-1a")
            .with_zone("us-east-1b")
            .with_subnet("subnet-a", "vpc-1", "us-east-1a", "10.0.1.0/24")
            .with_subnet("subnet-b", "vpc-1", "us-east-1b", "10.0.2.0/24")
            .with_route_table("rtb-1", "vpc-1")
            .with_route("rtb-1", "10.0.0.10/32", "i-vip")
            .with_instance("i-vip", "subnet-a", "ami-vip")
    }

    fn settings() -> FailoverSettings {
        FailoverSettings {
            destination_cidr: "10.0.0.10/32".parse().unwrap(),
            security_group: "sg-1".into(),
            key_name: "ops".into(),
            template: "via {{ AZ_SUBNET_DEF_ROUTE }}".into(),
            fallback: FallbackConfig::default(),
            timings: Timings {
                interval: Duration::from_secs(3600),
                retry_backoff: Duration::from_secs(3600),
                bootstrap_grace: Duration::ZERO,
                ..Timings::default()
            },
        }
    }

    fn controller(cloud: &MemoryCloud, answer: ProbeResult) -> FailoverController {
        FailoverController::new(
            Arc::new(cloud.clone()),
            Arc::new(FixedProber(answer)),
            Arc::new(SequentialNames::new("sec-ip-vip")),
            settings(),
            "i-vip",
        )
    }

    #[tokio::test]
    async fn healthy_cycle_stays_monitoring() {
        let cloud = cloud();
        let mut ctl = controller(&cloud, ProbeResult::Reachable);
        let (_tx, rx) = watch::channel(false);

        let outcome = ctl.run_cycle(&rx).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Healthy);
        assert_eq!(
            ctl.phase(),
            &Phase::Monitoring {
                current: "i-vip".into()
            }
        );
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn unreachable_instance_is_replaced() {
        let cloud = cloud();
        let mut ctl = controller(&cloud, ProbeResult::Unreachable);
        let (_tx, rx) = watch::channel(false);

        let outcome = ctl.run_cycle(&rx).await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::FailedOver {
                old: Some("i-vip".into()),
                new: "i-new0001".into()
            }
        );
        assert_eq!(ctl.current_instance(), "i-new0001");
        assert_eq!(ctl.phase().name(), "monitoring");
    }

    #[tokio::test]
    async fn stop_before_provisioning_launches_nothing() {
        let cloud = cloud();
        let mut ctl = controller(&cloud, ProbeResult::Unreachable);
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let outcome = ctl.run_cycle(&rx).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Interrupted);
        assert!(cloud.launches().is_empty());
        assert_eq!(ctl.current_instance(), "i-vip");
        assert!(matches!(
            ctl.phase(),
            Phase::Failing {
                reason: ReplaceReason::Unreachable,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn run_returns_once_stopped() {
        let cloud = cloud();
        let mut ctl = controller(&cloud, ProbeResult::Reachable);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let result = ctl.run(rx).await;
            (result, ctl)
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let (result, ctl) = handle.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(ctl.current_instance(), "i-vip");
        assert!(
            !cloud
                .calls()
                .iter()
                .any(|c| matches!(c, CloudCall::RunInstance(_)))
        );
    }

    #[tokio::test]
    async fn run_returns_when_sender_is_dropped() {
        let cloud = cloud();
        let mut ctl = controller(&cloud, ProbeResult::Reachable);
        let (tx, rx) = watch::channel(false);
        drop(tx);

        assert!(ctl.run(rx).await.is_ok());
    }
}
