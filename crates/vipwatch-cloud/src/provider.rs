//! The cloud provider capability.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use vipwatch_core::{InstanceId, MonitoredInstance, RouteTable, Subnet};

use crate::error::CloudResult;

/// Filter for subnet lookups. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubnetFilter {
    pub vpc_id: Option<String>,
    pub availability_zone: Option<String>,
}

impl SubnetFilter {
    /// Subnets of `vpc_id` located in `zone`.
    pub fn in_vpc_and_zone(vpc_id: &str, zone: &str) -> Self {
        Self {
            vpc_id: Some(vpc_id.to_string()),
            availability_zone: Some(zone.to_string()),
        }
    }

    /// Subnets of any VPC located in `zone`.
    pub fn in_zone(zone: &str) -> Self {
        Self {
            vpc_id: None,
            availability_zone: Some(zone.to_string()),
        }
    }
}

/// Parameters of a single-instance launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInstanceRequest {
    pub image_id: String,
    pub instance_type: String,
    pub key_name: String,
    pub security_group: String,
    pub subnet_id: String,
    /// Rendered bootstrap payload, passed verbatim as user data.
    pub user_data: String,
    /// Value of the `Name` tag.
    pub name: String,
}

/// Resource lookup and mutation operations the controller relies on.
///
/// Lookups of a missing resource return an error for which
/// [`CloudError::is_not_found`](crate::CloudError::is_not_found) holds.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn describe_instance(&self, instance_id: &str) -> CloudResult<MonitoredInstance>;

    async fn describe_subnet(&self, subnet_id: &str) -> CloudResult<Subnet>;

    /// Subnets matching the filter, in provider order.
    async fn find_subnets(&self, filter: &SubnetFilter) -> CloudResult<Vec<Subnet>>;

    /// Every route table of a VPC.
    async fn route_tables(&self, vpc_id: &str) -> CloudResult<Vec<RouteTable>>;

    /// Names of every availability zone in the region, in provider order.
    async fn availability_zones(&self) -> CloudResult<Vec<String>>;

    async fn run_instance(&self, request: &RunInstanceRequest) -> CloudResult<InstanceId>;

    /// Block until the instance is running, or fail once `timeout` elapses.
    async fn wait_until_running(&self, instance_id: &str, timeout: Duration) -> CloudResult<()>;

    /// Block until platform status checks pass, or fail once `timeout` elapses.
    async fn wait_until_status_ok(&self, instance_id: &str, timeout: Duration) -> CloudResult<()>;

    async fn disable_source_dest_check(&self, interface_id: &str) -> CloudResult<()>;

    async fn delete_route(&self, route_table_id: &str, destination_cidr: &str) -> CloudResult<()>;

    async fn create_route(
        &self,
        route_table_id: &str,
        destination_cidr: &str,
        instance_id: &str,
    ) -> CloudResult<()>;

    async fn terminate_instance(&self, instance_id: &str) -> CloudResult<()>;
}
