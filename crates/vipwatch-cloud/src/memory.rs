//! MemoryCloud: an in-process model of one region.
//!
//! Holds availability zones, subnets, route tables and instances behind a
//! mutex and records every mutating call, so tests can drive the
//! controller end to end and then assert on what it asked the provider
//! to do. Launched instances come up `running` immediately.

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use vipwatch_core::{InstanceId, LifecycleState, MonitoredInstance, Route, RouteTable, Subnet};

use crate::error::{CloudError, CloudResult};
use crate::provider::{CloudProvider, RunInstanceRequest, SubnetFilter};

/// A mutating call issued against the [`MemoryCloud`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudCall {
    RunInstance(RunInstanceRequest),
    WaitUntilRunning(String),
    WaitUntilStatusOk(String),
    DisableSourceDestCheck(String),
    DeleteRoute { route_table_id: String, destination_cidr: String },
    CreateRoute { route_table_id: String, destination_cidr: String, instance_id: String },
    TerminateInstance(String),
}

#[derive(Default)]
struct Region {
    zones: Vec<String>,
    subnets: Vec<Subnet>,
    route_tables: Vec<RouteTable>,
    instances: BTreeMap<InstanceId, MonitoredInstance>,
    user_data: BTreeMap<InstanceId, String>,
    calls: Vec<CloudCall>,
    launched: u32,
    failing_route_tables: HashSet<String>,
    failing_table_listings: u32,
    fail_terminate: bool,
    fail_status_ok: bool,
    unreadable_instances: HashSet<String>,
}

/// In-memory [`CloudProvider`]. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryCloud {
    region: Arc<Mutex<Region>>,
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn region(&self) -> MutexGuard<'_, Region> {
        self.region.lock().expect("memory cloud lock")
    }

    // ── Setup ──────────────────────────────────────────────────────

    pub fn with_zone(self, zone: &str) -> Self {
        self.region().zones.push(zone.to_string());
        self
    }

    pub fn with_subnet(self, id: &str, vpc_id: &str, zone: &str, cidr: &str) -> Self {
        let cidr_block = cidr.parse().expect("valid subnet cidr");
        self.region().subnets.push(Subnet {
            id: id.to_string(),
            vpc_id: vpc_id.to_string(),
            availability_zone: zone.to_string(),
            cidr_block,
        });
        self
    }

    pub fn with_route_table(self, id: &str, vpc_id: &str) -> Self {
        self.region().route_tables.push(RouteTable {
            id: id.to_string(),
            vpc_id: vpc_id.to_string(),
            routes: Vec::new(),
        });
        self
    }

    /// Add an instance route to an existing table without recording a call.
    pub fn with_route(self, route_table_id: &str, destination: &str, instance_id: &str) -> Self {
        {
            let mut region = self.region();
            let table = region
                .route_tables
                .iter_mut()
                .find(|t| t.id == route_table_id)
                .expect("route table exists");
            table.routes.push(Route {
                destination_cidr: destination.to_string(),
                instance_id: Some(instance_id.to_string()),
            });
        }
        self
    }

    /// Add a running instance placed in `subnet_id`.
    pub fn with_instance(self, id: &str, subnet_id: &str, image_id: &str) -> Self {
        {
            let mut region = self.region();
            let subnet = region
                .subnets
                .iter()
                .find(|s| s.id == subnet_id)
                .cloned()
                .expect("subnet exists");
            let private_ip = host_address(&subnet, 10 + region.instances.len() as u32);
            region.instances.insert(
                id.to_string(),
                MonitoredInstance {
                    id: id.to_string(),
                    private_ip,
                    availability_zone: subnet.availability_zone.clone(),
                    state: LifecycleState::Running,
                    image_id: image_id.to_string(),
                    instance_type: "t3.small".to_string(),
                    subnet_id: Some(subnet.id.clone()),
                    primary_interface: Some(format!("eni-{id}")),
                },
            );
        }
        self
    }

    // ── Fault injection ────────────────────────────────────────────

    pub fn set_state(&self, instance_id: &str, state: LifecycleState) {
        if let Some(instance) = self.region().instances.get_mut(instance_id) {
            instance.state = state;
        }
    }

    /// Forget an instance entirely, as if the provider purged it.
    pub fn remove_instance(&self, instance_id: &str) {
        self.region().instances.remove(instance_id);
    }

    /// Make `describe_instance` fail with a non-`NotFound` error.
    pub fn fail_describe(&self, instance_id: &str) {
        self.region()
            .unreadable_instances
            .insert(instance_id.to_string());
    }

    /// Make `create_route` and `delete_route` fail for one table.
    pub fn fail_route_table(&self, route_table_id: &str) {
        self.region()
            .failing_route_tables
            .insert(route_table_id.to_string());
    }

    /// Make the next `times` calls to `route_tables` fail.
    pub fn fail_route_listing(&self, times: u32) {
        self.region().failing_table_listings = times;
    }

    pub fn fail_terminate(&self) {
        self.region().fail_terminate = true;
    }

    pub fn fail_status_checks(&self) {
        self.region().fail_status_ok = true;
    }

    // ── Inspection ─────────────────────────────────────────────────

    pub fn calls(&self) -> Vec<CloudCall> {
        self.region().calls.clone()
    }

    /// Run-instance requests issued so far.
    pub fn launches(&self) -> Vec<RunInstanceRequest> {
        self.region()
            .calls
            .iter()
            .filter_map(|c| match c {
                CloudCall::RunInstance(req) => Some(req.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn instance(&self, instance_id: &str) -> Option<MonitoredInstance> {
        self.region().instances.get(instance_id).cloned()
    }

    pub fn user_data(&self, instance_id: &str) -> Option<String> {
        self.region().user_data.get(instance_id).cloned()
    }

    /// Snapshot of every route table in every VPC.
    pub fn tables(&self) -> Vec<RouteTable> {
        self.region().route_tables.clone()
    }

    pub fn clear_calls(&self) {
        self.region().calls.clear();
    }
}

fn host_address(subnet: &Subnet, offset: u32) -> Option<Ipv4Addr> {
    u32::from(subnet.cidr_block.network())
        .checked_add(offset)
        .map(Ipv4Addr::from)
}

#[async_trait]
impl CloudProvider for MemoryCloud {
    async fn describe_instance(&self, instance_id: &str) -> CloudResult<MonitoredInstance> {
        let region = self.region();
        if region.unreadable_instances.contains(instance_id) {
            return Err(CloudError::Command {
                status: "exit status: 255".to_string(),
                stderr: "Could not connect to the endpoint URL".to_string(),
            });
        }
        region
            .instances
            .get(instance_id)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(instance_id.to_string()))
    }

    async fn describe_subnet(&self, subnet_id: &str) -> CloudResult<Subnet> {
        self.region()
            .subnets
            .iter()
            .find(|s| s.id == subnet_id)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(subnet_id.to_string()))
    }

    async fn find_subnets(&self, filter: &SubnetFilter) -> CloudResult<Vec<Subnet>> {
        Ok(self
            .region()
            .subnets
            .iter()
            .filter(|s| filter.vpc_id.as_ref().is_none_or(|v| *v == s.vpc_id))
            .filter(|s| {
                filter
                    .availability_zone
                    .as_ref()
                    .is_none_or(|z| *z == s.availability_zone)
            })
            .cloned()
            .collect())
    }

    async fn route_tables(&self, vpc_id: &str) -> CloudResult<Vec<RouteTable>> {
        let mut region = self.region();
        if region.failing_table_listings > 0 {
            region.failing_table_listings -= 1;
            return Err(CloudError::Api {
                code: "RequestLimitExceeded".to_string(),
                message: "request limit exceeded".to_string(),
            });
        }
        Ok(region
            .route_tables
            .iter()
            .filter(|t| t.vpc_id == vpc_id)
            .cloned()
            .collect())
    }

    async fn availability_zones(&self) -> CloudResult<Vec<String>> {
        Ok(self.region().zones.clone())
    }

    async fn run_instance(&self, request: &RunInstanceRequest) -> CloudResult<InstanceId> {
        let mut region = self.region();
        region.calls.push(CloudCall::RunInstance(request.clone()));

        let subnet = region
            .subnets
            .iter()
            .find(|s| s.id == request.subnet_id)
            .cloned()
            .ok_or_else(|| CloudError::Api {
                code: "InvalidSubnetID.NotFound".to_string(),
                message: format!("subnet {} does not exist", request.subnet_id),
            })?;

        region.launched += 1;
        let id = format!("i-new{:04}", region.launched);
        let private_ip = host_address(&subnet, 100 + region.launched);
        region.instances.insert(
            id.clone(),
            MonitoredInstance {
                id: id.clone(),
                private_ip,
                availability_zone: subnet.availability_zone.clone(),
                state: LifecycleState::Running,
                image_id: request.image_id.clone(),
                instance_type: request.instance_type.clone(),
                subnet_id: Some(subnet.id.clone()),
                primary_interface: Some(format!("eni-{id}")),
            },
        );
        region.user_data.insert(id.clone(), request.user_data.clone());
        debug!(instance = %id, subnet = %subnet.id, "memory cloud launched instance");
        Ok(id)
    }

    async fn wait_until_running(&self, instance_id: &str, _timeout: Duration) -> CloudResult<()> {
        let mut region = self.region();
        region
            .calls
            .push(CloudCall::WaitUntilRunning(instance_id.to_string()));
        match region.instances.get(instance_id) {
            Some(i) if i.state.is_running() => Ok(()),
            Some(i) => Err(CloudError::Wait(format!("{instance_id} is {}", i.state))),
            None => Err(CloudError::NotFound(instance_id.to_string())),
        }
    }

    async fn wait_until_status_ok(&self, instance_id: &str, timeout: Duration) -> CloudResult<()> {
        let mut region = self.region();
        region
            .calls
            .push(CloudCall::WaitUntilStatusOk(instance_id.to_string()));
        if region.fail_status_ok {
            return Err(CloudError::Timeout {
                what: format!("status checks of {instance_id}"),
                after: timeout,
            });
        }
        Ok(())
    }

    async fn disable_source_dest_check(&self, interface_id: &str) -> CloudResult<()> {
        self.region()
            .calls
            .push(CloudCall::DisableSourceDestCheck(interface_id.to_string()));
        Ok(())
    }

    async fn delete_route(&self, route_table_id: &str, destination_cidr: &str) -> CloudResult<()> {
        let mut region = self.region();
        region.calls.push(CloudCall::DeleteRoute {
            route_table_id: route_table_id.to_string(),
            destination_cidr: destination_cidr.to_string(),
        });
        if region.failing_route_tables.contains(route_table_id) {
            return Err(CloudError::Api {
                code: "UnauthorizedOperation".to_string(),
                message: format!("not allowed to modify {route_table_id}"),
            });
        }
        let table = region
            .route_tables
            .iter_mut()
            .find(|t| t.id == route_table_id)
            .ok_or_else(|| CloudError::NotFound(route_table_id.to_string()))?;
        let before = table.routes.len();
        table.routes.retain(|r| r.destination_cidr != destination_cidr);
        if table.routes.len() == before {
            return Err(CloudError::Api {
                code: "InvalidRoute.NotFound".to_string(),
                message: format!("no route to {destination_cidr} in {route_table_id}"),
            });
        }
        Ok(())
    }

    async fn create_route(
        &self,
        route_table_id: &str,
        destination_cidr: &str,
        instance_id: &str,
    ) -> CloudResult<()> {
        let mut region = self.region();
        region.calls.push(CloudCall::CreateRoute {
            route_table_id: route_table_id.to_string(),
            destination_cidr: destination_cidr.to_string(),
            instance_id: instance_id.to_string(),
        });
        if region.failing_route_tables.contains(route_table_id) {
            return Err(CloudError::Api {
                code: "UnauthorizedOperation".to_string(),
                message: format!("not allowed to modify {route_table_id}"),
            });
        }
        let table = region
            .route_tables
            .iter_mut()
            .find(|t| t.id == route_table_id)
            .ok_or_else(|| CloudError::NotFound(route_table_id.to_string()))?;
        if table.routes.iter().any(|r| r.destination_cidr == destination_cidr) {
            return Err(CloudError::Api {
                code: "RouteAlreadyExists".to_string(),
                message: format!("route to {destination_cidr} already exists"),
            });
        }
        table.routes.push(Route {
            destination_cidr: destination_cidr.to_string(),
            instance_id: Some(instance_id.to_string()),
        });
        Ok(())
    }

    async fn terminate_instance(&self, instance_id: &str) -> CloudResult<()> {
        let mut region = self.region();
        region
            .calls
            .push(CloudCall::TerminateInstance(instance_id.to_string()));
        if region.fail_terminate {
            return Err(CloudError::Api {
                code: "OperationNotPermitted".to_string(),
                message: "termination protection is enabled".to_string(),
            });
        }
        match region.instances.get_mut(instance_id) {
            Some(instance) => {
                instance.state = LifecycleState::Terminated;
                Ok(())
            }
            None => Err(CloudError::Api {
                code: "InvalidInstanceID.NotFound".to_string(),
                message: format!("instance {instance_id} does not exist"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> MemoryCloud {
        MemoryCloud::new()
            .with_zone("us-east-1a")
            .with_zone("us-east-1b")
            .with_subnet("subnet-a", "vpc-1", "us-east-1a", "10.0.0.0/20")
            .with_subnet("subnet-b", "vpc-1", "us-east-1b", "10.0.16.0/20")
            .with_subnet("subnet-x", "vpc-2", "us-east-1b", "192.168.0.0/24")
            .with_route_table("rtb-1", "vpc-1")
            .with_instance("i-old", "subnet-a", "ami-1")
    }

    #[tokio::test]
    async fn describe_missing_instance_is_not_found() {
        let cloud = region();
        let err = cloud.describe_instance("i-ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn route_listing_recovers_after_injected_failures() {
        let cloud = region();
        cloud.fail_route_listing(2);
        assert!(cloud.route_tables("vpc-1").await.is_err());
        assert!(cloud.route_tables("vpc-1").await.is_err());
        let tables = cloud.route_tables("vpc-1").await.unwrap();
        assert_eq!(tables.len(), 1);
    }

    #[tokio::test]
    async fn unreadable_instance_is_not_a_not_found() {
        let cloud = region();
        cloud.fail_describe("i-old");
        let err = cloud.describe_instance("i-old").await.unwrap_err();
        assert!(!err.is_not_found());
    }

    #[tokio::test]
    async fn subnet_filter_combines_vpc_and_zone() {
        let cloud = region();
        let hits = cloud
            .find_subnets(&SubnetFilter::in_vpc_and_zone("vpc-1", "us-east-1b"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "subnet-b");

        let any_vpc = cloud
            .find_subnets(&SubnetFilter::in_zone("us-east-1b"))
            .await
            .unwrap();
        assert_eq!(any_vpc.len(), 2);
    }

    #[tokio::test]
    async fn delete_absent_route_reports_not_found() {
        let cloud = region();
        let err = cloud.delete_route("rtb-1", "10.0.0.10/32").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn create_route_twice_is_rejected() {
        let cloud = region();
        cloud.create_route("rtb-1", "10.0.0.10/32", "i-old").await.unwrap();
        let err = cloud
            .create_route("rtb-1", "10.0.0.10/32", "i-old")
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Api { ref code, .. } if code == "RouteAlreadyExists"));
    }

    #[tokio::test]
    async fn terminate_keeps_instance_visible_as_terminated() {
        let cloud = region();
        cloud.terminate_instance("i-old").await.unwrap();
        let inst = cloud.describe_instance("i-old").await.unwrap();
        assert_eq!(inst.state, LifecycleState::Terminated);
        assert!(
            cloud
                .calls()
                .contains(&CloudCall::TerminateInstance("i-old".to_string()))
        );
    }

    #[tokio::test]
    async fn launched_instance_lands_in_requested_subnet() {
        let cloud = region();
        let id = cloud
            .run_instance(&RunInstanceRequest {
                image_id: "ami-1".into(),
                instance_type: "t3.small".into(),
                key_name: "ops".into(),
                security_group: "sg-1".into(),
                subnet_id: "subnet-b".into(),
                user_data: "#!/bin/sh".into(),
                name: "sec-ip-vip-10000".into(),
            })
            .await
            .unwrap();
        let inst = cloud.instance(&id).unwrap();
        assert_eq!(inst.availability_zone, "us-east-1b");
        assert_eq!(inst.subnet_id.as_deref(), Some("subnet-b"));
        assert_eq!(cloud.user_data(&id).as_deref(), Some("#!/bin/sh"));
    }
}
