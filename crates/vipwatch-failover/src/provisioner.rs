//! Replacement provisioning.
//!
//! Launches a clone of the lost instance in a different availability zone
//! of the same VPC, waits until the platform reports it healthy, and turns
//! off the source/destination check so it can forward traffic for the
//! virtual IP.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use vipwatch_cloud::{CloudError, CloudProvider, RunInstanceRequest, SubnetFilter};
use vipwatch_core::{FailoverPlan, InstanceId, LaunchSpec};

use crate::error::ProvisionError;
use crate::naming::NameGenerator;
use crate::template::render_bootstrap;

pub struct InstanceProvisioner {
    cloud: Arc<dyn CloudProvider>,
    names: Arc<dyn NameGenerator>,
    running_timeout: Duration,
    status_ok_timeout: Duration,
}

impl InstanceProvisioner {
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        names: Arc<dyn NameGenerator>,
        running_timeout: Duration,
        status_ok_timeout: Duration,
    ) -> Self {
        Self {
            cloud,
            names,
            running_timeout,
            status_ok_timeout,
        }
    }

    /// Launch and ready a replacement in `plan.target_az`.
    ///
    /// On success the returned instance is running, has passed its status
    /// checks, and forwards traffic not addressed to itself. If anything
    /// fails after the launch, the half-ready replacement is terminated
    /// before the error is returned.
    pub async fn launch(
        &self,
        spec: &LaunchSpec,
        plan: &FailoverPlan,
    ) -> Result<InstanceId, ProvisionError> {
        if plan.target_az == spec.availability_zone {
            return Err(ProvisionError::SameZone(plan.target_az.clone()));
        }

        let source = self
            .cloud
            .describe_subnet(&spec.subnet_id)
            .await
            .map_err(ProvisionError::cloud("describe source subnet"))?;

        let subnet = self
            .cloud
            .find_subnets(&SubnetFilter::in_vpc_and_zone(&source.vpc_id, &plan.target_az))
            .await
            .map_err(ProvisionError::cloud("find target subnet"))?
            .into_iter()
            .next()
            .ok_or_else(|| ProvisionError::NoSubnetInZone {
                zone: plan.target_az.clone(),
                vpc_id: source.vpc_id.clone(),
            })?;

        let gateway = subnet
            .gateway()
            .ok_or_else(|| ProvisionError::NoGateway(subnet.id.clone()))?;
        let user_data = render_bootstrap(&plan.template, gateway, plan.destination_cidr)?;

        let request = RunInstanceRequest {
            image_id: spec.image_id.clone(),
            instance_type: spec.instance_type.clone(),
            key_name: plan.key_name.clone(),
            security_group: plan.security_group.clone(),
            subnet_id: subnet.id.clone(),
            user_data,
            name: self.names.next_name(),
        };

        let instance_id = self
            .cloud
            .run_instance(&request)
            .await
            .map_err(ProvisionError::cloud("run instance"))?;
        info!(
            instance = %instance_id,
            zone = %plan.target_az,
            subnet = %subnet.id,
            %gateway,
            name = %request.name,
            "launched replacement"
        );

        match self.ready(&instance_id).await {
            Ok(()) => Ok(instance_id),
            Err(e) => {
                warn!(instance = %instance_id, error = %e, "replacement not ready, terminating it");
                if let Err(term) = self.cloud.terminate_instance(&instance_id).await {
                    warn!(instance = %instance_id, error = %term, "failed to terminate abandoned replacement");
                }
                Err(e)
            }
        }
    }

    async fn ready(&self, instance_id: &str) -> Result<(), ProvisionError> {
        self.cloud
            .wait_until_running(instance_id, self.running_timeout)
            .await
            .map_err(|e| wait_error(instance_id, "running", e))?;
        info!(instance = %instance_id, "replacement running");

        self.cloud
            .wait_until_status_ok(instance_id, self.status_ok_timeout)
            .await
            .map_err(|e| wait_error(instance_id, "status ok", e))?;
        info!(instance = %instance_id, "replacement passed status checks");

        let instance = self
            .cloud
            .describe_instance(instance_id)
            .await
            .map_err(ProvisionError::cloud("describe replacement"))?;
        let interface = instance
            .primary_interface
            .ok_or_else(|| ProvisionError::NoInterface(instance_id.to_string()))?;

        self.cloud
            .disable_source_dest_check(&interface)
            .await
            .map_err(ProvisionError::cloud("disable source/dest check"))?;
        info!(instance = %instance_id, %interface, "source/dest check disabled");
        Ok(())
    }
}

fn wait_error(instance_id: &str, what: &'static str, err: CloudError) -> ProvisionError {
    match err {
        CloudError::Timeout { after, .. } => ProvisionError::WaitTimeout {
            instance_id: instance_id.to_string(),
            what,
            after,
        },
        other => ProvisionError::Cloud {
            step: "wait for replacement",
            source: other,
        },
    }
}
