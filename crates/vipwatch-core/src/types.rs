//! Domain types for the vipwatch controller.
//!
//! Snapshots returned by the cloud provider are read-only and re-fetched
//! every cycle; nothing here is cached beyond a single monitoring pass.

use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

/// Cloud identifier of a compute instance (e.g. `i-0abc...`).
pub type InstanceId = String;

/// Cloud identifier of a subnet.
pub type SubnetId = String;

/// Cloud identifier of a VPC.
pub type VpcId = String;

/// Cloud identifier of a route table.
pub type RouteTableId = String;

// ── Instance ──────────────────────────────────────────────────────

/// Lifecycle state of a compute instance as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LifecycleState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
    /// Any state name the controller does not know about.
    Other(String),
}

impl LifecycleState {
    pub fn as_str(&self) -> &str {
        match self {
            LifecycleState::Pending => "pending",
            LifecycleState::Running => "running",
            LifecycleState::ShuttingDown => "shutting-down",
            LifecycleState::Terminated => "terminated",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Other(name) => name,
        }
    }

    pub fn is_running(&self) -> bool {
        *self == LifecycleState::Running
    }
}

impl From<&str> for LifecycleState {
    fn from(name: &str) -> Self {
        match name {
            "pending" => LifecycleState::Pending,
            "running" => LifecycleState::Running,
            "shutting-down" => LifecycleState::ShuttingDown,
            "terminated" => LifecycleState::Terminated,
            "stopping" => LifecycleState::Stopping,
            "stopped" => LifecycleState::Stopped,
            other => LifecycleState::Other(other.to_string()),
        }
    }
}

impl From<String> for LifecycleState {
    fn from(name: String) -> Self {
        LifecycleState::from(name.as_str())
    }
}

impl From<LifecycleState> for String {
    fn from(state: LifecycleState) -> Self {
        state.as_str().to_string()
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time snapshot of the monitored instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredInstance {
    pub id: InstanceId,
    /// Primary private address; absent while the instance is still pending.
    pub private_ip: Option<Ipv4Addr>,
    pub availability_zone: String,
    pub state: LifecycleState,
    pub image_id: String,
    pub instance_type: String,
    /// Absent once a terminated instance has been detached from its subnet.
    pub subnet_id: Option<SubnetId>,
    /// Network interface at device index 0, if the provider reported one.
    pub primary_interface: Option<String>,
}

// ── Network ───────────────────────────────────────────────────────

/// A subnet inside a VPC, pinned to one availability zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: SubnetId,
    pub vpc_id: VpcId,
    pub availability_zone: String,
    pub cidr_block: Ipv4Net,
}

impl Subnet {
    /// First usable address of the subnet's block, which the platform
    /// reserves for the subnet router.
    ///
    /// Returns `None` only for a block at the very top of the address space.
    pub fn gateway(&self) -> Option<Ipv4Addr> {
        u32::from(self.cidr_block.network())
            .checked_add(1)
            .map(Ipv4Addr::from)
    }
}

/// A single static route inside a route table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub destination_cidr: String,
    /// Instance next hop, if the route targets an instance.
    pub instance_id: Option<InstanceId>,
}

/// A route table and the routes it currently holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTable {
    pub id: RouteTableId,
    pub vpc_id: VpcId,
    pub routes: Vec<Route>,
}

impl RouteTable {
    /// Routes in this table matching the given destination.
    pub fn routes_to<'a>(&'a self, destination: &'a str) -> impl Iterator<Item = &'a Route> + 'a {
        self.routes
            .iter()
            .filter(move |r| r.destination_cidr == destination)
    }
}

/// The desired state of one table's route for the monitored CIDR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTarget {
    pub route_table_id: RouteTableId,
    pub destination_cidr: Ipv4Net,
    pub instance_id: InstanceId,
}

// ── Health ────────────────────────────────────────────────────────

/// What one monitoring pass learned about the current instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthObservation {
    /// Unix timestamp (seconds) when the observation was taken.
    pub observed_at: u64,
    pub exists: bool,
    /// Lifecycle state; `None` when the instance was not found.
    pub state: Option<LifecycleState>,
    pub reachable: bool,
}

impl HealthObservation {
    pub fn not_found(observed_at: u64) -> Self {
        Self {
            observed_at,
            exists: false,
            state: None,
            reachable: false,
        }
    }

    pub fn not_running(observed_at: u64, state: LifecycleState) -> Self {
        Self {
            observed_at,
            exists: true,
            state: Some(state),
            reachable: false,
        }
    }

    pub fn probed(observed_at: u64, reachable: bool) -> Self {
        Self {
            observed_at,
            exists: true,
            state: Some(LifecycleState::Running),
            reachable,
        }
    }
}

/// Why the current instance must be replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "state", rename_all = "snake_case")]
pub enum ReplaceReason {
    NotFound,
    NotRunning(LifecycleState),
    Unreachable,
}

impl fmt::Display for ReplaceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplaceReason::NotFound => f.write_str("not found"),
            ReplaceReason::NotRunning(state) => write!(f, "state is {state}"),
            ReplaceReason::Unreachable => f.write_str("unreachable"),
        }
    }
}

/// Outcome of judging a [`HealthObservation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    NoAction,
    Replace(ReplaceReason),
}

// ── Failover ──────────────────────────────────────────────────────

/// The image, size and placement a replacement is cloned from.
///
/// Usually taken from the monitored instance; synthesized from defaults
/// when nothing is known about the instance any more.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub image_id: String,
    pub instance_type: String,
    /// Subnet the VPC is discovered from.
    pub subnet_id: SubnetId,
    /// Availability zone the replacement must avoid.
    pub availability_zone: String,
}

impl LaunchSpec {
    /// Clone the launch parameters of an existing instance.
    ///
    /// Returns `None` if the instance no longer reports a subnet.
    pub fn from_instance(instance: &MonitoredInstance) -> Option<Self> {
        Some(Self {
            image_id: instance.image_id.clone(),
            instance_type: instance.instance_type.clone(),
            subnet_id: instance.subnet_id.clone()?,
            availability_zone: instance.availability_zone.clone(),
        })
    }
}

/// Everything needed to carry out one failover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverPlan {
    /// Instance being replaced; absent if it could not be found.
    pub old_instance_id: Option<InstanceId>,
    pub target_az: String,
    pub destination_cidr: Ipv4Net,
    pub security_group: String,
    pub key_name: String,
    /// Bootstrap template text, rendered per launch.
    pub template: String,
}
