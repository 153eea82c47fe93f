//! AWS backend driven through the `aws` command line.
//!
//! Each capability call runs one `aws ec2 <operation> --output json`
//! process and decodes its stdout. Failures are classified from the
//! `An error occurred (Code) when calling ...` line the CLI prints on
//! stderr, so `InvalidRoute.NotFound` and friends surface as not-found.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::process::Command;
use tracing::{debug, warn};

use vipwatch_core::config::AwsConfig;
use vipwatch_core::{InstanceId, LifecycleState, MonitoredInstance, Route, RouteTable, Subnet};

use crate::error::{CloudError, CloudResult};
use crate::provider::{CloudProvider, RunInstanceRequest, SubnetFilter};

/// [`CloudProvider`] backed by the AWS command line.
#[derive(Debug, Clone)]
pub struct AwsCli {
    program: String,
    region: Option<String>,
    profile: Option<String>,
    /// Delay between polls while waiting on an instance.
    poll_interval: Duration,
}

impl AwsCli {
    pub fn new(config: &AwsConfig, poll_interval: Duration) -> Self {
        Self {
            program: config.cli.clone(),
            region: config.region.clone(),
            profile: config.profile.clone(),
            poll_interval,
        }
    }

    /// Full argument vector for one `ec2` operation.
    fn command_args(&self, operation: &[&str]) -> Vec<String> {
        let mut args = vec!["ec2".to_string()];
        args.extend(operation.iter().map(|a| a.to_string()));
        args.extend(["--output".to_string(), "json".to_string()]);
        if let Some(region) = &self.region {
            args.extend(["--region".to_string(), region.clone()]);
        }
        if let Some(profile) = &self.profile {
            args.extend(["--profile".to_string(), profile.clone()]);
        }
        args
    }

    async fn run(&self, operation: &[&str]) -> CloudResult<Vec<u8>> {
        let args = self.command_args(operation);
        debug!(program = %self.program, operation = operation.first().copied().unwrap_or(""), "aws call");

        let output = Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_failure(&output.status.to_string(), &stderr))
        }
    }

    async fn call<T: DeserializeOwned>(&self, operation: &[&str]) -> CloudResult<T> {
        let stdout = self.run(operation).await?;
        Ok(serde_json::from_slice(&stdout)?)
    }

    async fn instance_status_ok(&self, instance_id: &str) -> CloudResult<bool> {
        let out: DescribeInstanceStatusOutput = self
            .call(&[
                "describe-instance-status",
                "--instance-ids",
                instance_id,
                "--include-all-instances",
            ])
            .await?;
        Ok(out
            .instance_statuses
            .first()
            .is_some_and(RawInstanceStatus::passed))
    }
}

/// Turn a failed CLI invocation into a typed error.
fn classify_failure(status: &str, stderr: &str) -> CloudError {
    const MARKER: &str = "An error occurred (";
    if let Some(start) = stderr.find(MARKER) {
        let rest = &stderr[start + MARKER.len()..];
        if let Some(end) = rest.find(')') {
            let code = rest[..end].to_string();
            let message = rest[end..]
                .split_once(": ")
                .map(|(_, m)| m.trim().to_string())
                .unwrap_or_default();
            return CloudError::Api { code, message };
        }
    }
    CloudError::Command {
        status: status.to_string(),
        stderr: stderr.trim().to_string(),
    }
}

// ── Response shapes ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesOutput {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<RawInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawInstance {
    instance_id: String,
    private_ip_address: Option<String>,
    placement: RawPlacement,
    state: RawState,
    image_id: String,
    instance_type: String,
    subnet_id: Option<String>,
    #[serde(default)]
    network_interfaces: Vec<RawInterface>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawPlacement {
    availability_zone: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawState {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawInterface {
    network_interface_id: String,
    attachment: Option<RawAttachment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawAttachment {
    device_index: Option<u32>,
}

impl RawInstance {
    fn into_instance(self) -> MonitoredInstance {
        let primary_interface = self
            .network_interfaces
            .iter()
            .find(|i| i.attachment.as_ref().and_then(|a| a.device_index) == Some(0))
            .or_else(|| self.network_interfaces.first())
            .map(|i| i.network_interface_id.clone());

        MonitoredInstance {
            id: self.instance_id,
            private_ip: self
                .private_ip_address
                .as_deref()
                .and_then(|ip| ip.parse::<Ipv4Addr>().ok()),
            availability_zone: self.placement.availability_zone,
            state: LifecycleState::from(self.state.name),
            image_id: self.image_id,
            instance_type: self.instance_type,
            subnet_id: self.subnet_id,
            primary_interface,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeSubnetsOutput {
    #[serde(default)]
    subnets: Vec<RawSubnet>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawSubnet {
    subnet_id: String,
    vpc_id: String,
    availability_zone: String,
    cidr_block: String,
}

impl RawSubnet {
    fn into_subnet(self) -> CloudResult<Subnet> {
        let cidr_block = self.cidr_block.parse().map_err(|e| {
            CloudError::Parse(format!("subnet {} cidr {:?}: {e}", self.subnet_id, self.cidr_block))
        })?;
        Ok(Subnet {
            id: self.subnet_id,
            vpc_id: self.vpc_id,
            availability_zone: self.availability_zone,
            cidr_block,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeRouteTablesOutput {
    #[serde(default)]
    route_tables: Vec<RawRouteTable>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawRouteTable {
    route_table_id: String,
    vpc_id: String,
    #[serde(default)]
    routes: Vec<RawRoute>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawRoute {
    destination_cidr_block: Option<String>,
    instance_id: Option<String>,
}

impl RawRouteTable {
    fn into_route_table(self) -> RouteTable {
        RouteTable {
            id: self.route_table_id,
            vpc_id: self.vpc_id,
            // IPv6 and prefix-list routes carry no IPv4 destination.
            routes: self
                .routes
                .into_iter()
                .filter_map(|r| {
                    Some(Route {
                        destination_cidr: r.destination_cidr_block?,
                        instance_id: r.instance_id,
                    })
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeZonesOutput {
    #[serde(default)]
    availability_zones: Vec<RawZone>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawZone {
    zone_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstancesOutput {
    #[serde(default)]
    instances: Vec<RawLaunched>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawLaunched {
    instance_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstanceStatusOutput {
    #[serde(default)]
    instance_statuses: Vec<RawInstanceStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawInstanceStatus {
    instance_status: Option<RawStatusSummary>,
    system_status: Option<RawStatusSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawStatusSummary {
    status: String,
}

impl RawInstanceStatus {
    fn passed(&self) -> bool {
        let ok = |s: &Option<RawStatusSummary>| s.as_ref().is_some_and(|s| s.status == "ok");
        ok(&self.instance_status) && ok(&self.system_status)
    }
}

fn name_tag(name: &str) -> String {
    format!("ResourceType=instance,Tags=[{{Key=Name,Value={name}}}]")
}

#[async_trait]
impl CloudProvider for AwsCli {
    async fn describe_instance(&self, instance_id: &str) -> CloudResult<MonitoredInstance> {
        let out: DescribeInstancesOutput = self
            .call(&["describe-instances", "--instance-ids", instance_id])
            .await?;
        out.reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .next()
            .map(RawInstance::into_instance)
            .ok_or_else(|| CloudError::NotFound(instance_id.to_string()))
    }

    async fn describe_subnet(&self, subnet_id: &str) -> CloudResult<Subnet> {
        let out: DescribeSubnetsOutput = self
            .call(&["describe-subnets", "--subnet-ids", subnet_id])
            .await?;
        out.subnets
            .into_iter()
            .next()
            .ok_or_else(|| CloudError::NotFound(subnet_id.to_string()))?
            .into_subnet()
    }

    async fn find_subnets(&self, filter: &SubnetFilter) -> CloudResult<Vec<Subnet>> {
        let mut filters = Vec::new();
        if let Some(vpc) = &filter.vpc_id {
            filters.push(format!("Name=vpc-id,Values={vpc}"));
        }
        if let Some(zone) = &filter.availability_zone {
            filters.push(format!("Name=availability-zone,Values={zone}"));
        }
        let mut operation = vec!["describe-subnets"];
        if !filters.is_empty() {
            operation.push("--filters");
            operation.extend(filters.iter().map(String::as_str));
        }
        let out: DescribeSubnetsOutput = self.call(&operation).await?;
        out.subnets.into_iter().map(RawSubnet::into_subnet).collect()
    }

    async fn route_tables(&self, vpc_id: &str) -> CloudResult<Vec<RouteTable>> {
        let filter = format!("Name=vpc-id,Values={vpc_id}");
        let out: DescribeRouteTablesOutput = self
            .call(&["describe-route-tables", "--filters", &filter])
            .await?;
        Ok(out
            .route_tables
            .into_iter()
            .map(RawRouteTable::into_route_table)
            .collect())
    }

    async fn availability_zones(&self) -> CloudResult<Vec<String>> {
        let out: DescribeZonesOutput = self.call(&["describe-availability-zones"]).await?;
        Ok(out
            .availability_zones
            .into_iter()
            .map(|z| z.zone_name)
            .collect())
    }

    async fn run_instance(&self, request: &RunInstanceRequest) -> CloudResult<InstanceId> {
        let tags = name_tag(&request.name);
        let out: RunInstancesOutput = self
            .call(&[
                "run-instances",
                "--image-id",
                &request.image_id,
                "--count",
                "1",
                "--instance-type",
                &request.instance_type,
                "--key-name",
                &request.key_name,
                "--security-group-ids",
                &request.security_group,
                "--subnet-id",
                &request.subnet_id,
                "--user-data",
                &request.user_data,
                "--tag-specifications",
                &tags,
            ])
            .await?;
        out.instances
            .into_iter()
            .next()
            .map(|i| i.instance_id)
            .ok_or_else(|| CloudError::Parse("run-instances returned no instance".to_string()))
    }

    async fn wait_until_running(&self, instance_id: &str, timeout: Duration) -> CloudResult<()> {
        let poll = async {
            loop {
                match self.describe_instance(instance_id).await {
                    Ok(instance) => match instance.state {
                        LifecycleState::Running => return Ok(()),
                        LifecycleState::Pending => {}
                        state => {
                            return Err(CloudError::Wait(format!("{instance_id} is {state}")));
                        }
                    },
                    // Freshly launched instances may not be visible yet.
                    Err(e) if e.is_not_found() => {
                        debug!(instance = %instance_id, "instance not visible yet");
                    }
                    Err(e) => return Err(e),
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| CloudError::Timeout {
                what: format!("{instance_id} to reach running"),
                after: timeout,
            })?
    }

    async fn wait_until_status_ok(&self, instance_id: &str, timeout: Duration) -> CloudResult<()> {
        let poll = async {
            loop {
                match self.instance_status_ok(instance_id).await {
                    Ok(true) => return Ok(()),
                    Ok(false) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        warn!(instance = %instance_id, error = %e, "status check poll failed");
                    }
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| CloudError::Timeout {
                what: format!("status checks of {instance_id}"),
                after: timeout,
            })?
    }

    async fn disable_source_dest_check(&self, interface_id: &str) -> CloudResult<()> {
        self.run(&[
            "modify-network-interface-attribute",
            "--network-interface-id",
            interface_id,
            "--no-source-dest-check",
        ])
        .await?;
        Ok(())
    }

    async fn delete_route(&self, route_table_id: &str, destination_cidr: &str) -> CloudResult<()> {
        self.run(&[
            "delete-route",
            "--route-table-id",
            route_table_id,
            "--destination-cidr-block",
            destination_cidr,
        ])
        .await?;
        Ok(())
    }

    async fn create_route(
        &self,
        route_table_id: &str,
        destination_cidr: &str,
        instance_id: &str,
    ) -> CloudResult<()> {
        self.run(&[
            "create-route",
            "--route-table-id",
            route_table_id,
            "--destination-cidr-block",
            destination_cidr,
            "--instance-id",
            instance_id,
        ])
        .await?;
        Ok(())
    }

    async fn terminate_instance(&self, instance_id: &str) -> CloudResult<()> {
        self.run(&["terminate-instances", "--instance-ids", instance_id])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIBE_INSTANCES: &str = r#"{
        "Reservations": [{
            "Instances": [{
                "InstanceId": "i-0abc",
                "PrivateIpAddress": "10.0.1.25",
                "Placement": {"AvailabilityZone": "us-east-1a"},
                "State": {"Code": 16, "Name": "running"},
                "ImageId": "ami-123",
                "InstanceType": "t3.small",
                "SubnetId": "subnet-a",
                "NetworkInterfaces": [
                    {"NetworkInterfaceId": "eni-secondary", "Attachment": {"DeviceIndex": 1}},
                    {"NetworkInterfaceId": "eni-primary", "Attachment": {"DeviceIndex": 0}}
                ]
            }]
        }]
    }"#;

    #[test]
    fn decodes_running_instance() {
        let out: DescribeInstancesOutput = serde_json::from_str(DESCRIBE_INSTANCES).unwrap();
        let inst = out.reservations.into_iter().next().unwrap().instances.remove(0);
        let inst = inst.into_instance();
        assert_eq!(inst.id, "i-0abc");
        assert_eq!(inst.private_ip, Some(Ipv4Addr::new(10, 0, 1, 25)));
        assert_eq!(inst.state, LifecycleState::Running);
        assert_eq!(inst.subnet_id.as_deref(), Some("subnet-a"));
        assert_eq!(inst.primary_interface.as_deref(), Some("eni-primary"));
    }

    #[test]
    fn decodes_terminated_instance_without_subnet() {
        let json = r#"{"Reservations":[{"Instances":[{
            "InstanceId": "i-gone",
            "Placement": {"AvailabilityZone": "us-east-1b"},
            "State": {"Name": "terminated"},
            "ImageId": "ami-123",
            "InstanceType": "t3.small",
            "NetworkInterfaces": []
        }]}]}"#;
        let out: DescribeInstancesOutput = serde_json::from_str(json).unwrap();
        let inst = out.reservations.into_iter().next().unwrap().instances.remove(0);
        let inst = inst.into_instance();
        assert_eq!(inst.state, LifecycleState::Terminated);
        assert_eq!(inst.subnet_id, None);
        assert_eq!(inst.private_ip, None);
        assert_eq!(inst.primary_interface, None);
    }

    #[test]
    fn route_tables_skip_routes_without_ipv4_destination() {
        let json = r#"{"RouteTables":[{
            "RouteTableId": "rtb-1",
            "VpcId": "vpc-1",
            "Routes": [
                {"DestinationCidrBlock": "10.0.0.0/16", "GatewayId": "local"},
                {"DestinationIpv6CidrBlock": "::/0", "GatewayId": "igw-1"},
                {"DestinationCidrBlock": "10.0.0.10/32", "InstanceId": "i-0abc"}
            ]
        }]}"#;
        let out: DescribeRouteTablesOutput = serde_json::from_str(json).unwrap();
        let table = out.route_tables.into_iter().next().unwrap().into_route_table();
        assert_eq!(table.routes.len(), 2);
        assert_eq!(table.routes[1].instance_id.as_deref(), Some("i-0abc"));
    }

    #[test]
    fn subnet_with_bad_cidr_is_a_parse_error() {
        let raw = RawSubnet {
            subnet_id: "subnet-a".into(),
            vpc_id: "vpc-1".into(),
            availability_zone: "us-east-1a".into(),
            cidr_block: "not-a-cidr".into(),
        };
        assert!(matches!(raw.into_subnet(), Err(CloudError::Parse(_))));
    }

    #[test]
    fn status_requires_both_checks_ok() {
        let json = r#"{"InstanceStatuses":[{
            "InstanceStatus": {"Status": "ok"},
            "SystemStatus": {"Status": "initializing"}
        }]}"#;
        let out: DescribeInstanceStatusOutput = serde_json::from_str(json).unwrap();
        assert!(!out.instance_statuses[0].passed());

        let json = r#"{"InstanceStatuses":[{
            "InstanceStatus": {"Status": "ok"},
            "SystemStatus": {"Status": "ok"}
        }]}"#;
        let out: DescribeInstanceStatusOutput = serde_json::from_str(json).unwrap();
        assert!(out.instance_statuses[0].passed());
    }

    #[test]
    fn classifies_api_error_codes() {
        let stderr = "\nAn error occurred (InvalidRoute.NotFound) when calling the DeleteRoute \
                      operation: There is no route defined for '10.0.0.10/32' in the route table.\n";
        let err = classify_failure("exit status: 254", stderr);
        assert!(err.is_not_found());
        match err {
            CloudError::Api { code, message } => {
                assert_eq!(code, "InvalidRoute.NotFound");
                assert!(message.starts_with("There is no route"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unrecognized_failure_keeps_stderr() {
        let err = classify_failure("exit status: 255", "Could not connect to the endpoint URL\n");
        assert!(matches!(
            err,
            CloudError::Command { ref stderr, .. } if stderr == "Could not connect to the endpoint URL"
        ));
        assert!(!err.is_not_found());
    }

    #[test]
    fn command_args_carry_region_and_profile() {
        let cli = AwsCli::new(
            &AwsConfig {
                cli: "aws".into(),
                region: Some("eu-west-1".into()),
                profile: Some("ops".into()),
            },
            Duration::from_secs(15),
        );
        let args = cli.command_args(&["terminate-instances", "--instance-ids", "i-1"]);
        assert_eq!(
            args,
            [
                "ec2",
                "terminate-instances",
                "--instance-ids",
                "i-1",
                "--output",
                "json",
                "--region",
                "eu-west-1",
                "--profile",
                "ops"
            ]
        );
    }

    #[test]
    fn name_tag_specification() {
        assert_eq!(
            name_tag("sec-ip-vip-12345"),
            "ResourceType=instance,Tags=[{Key=Name,Value=sec-ip-vip-12345}]"
        );
    }

    #[tokio::test]
    async fn missing_binary_is_a_launch_error() {
        let cli = AwsCli::new(
            &AwsConfig {
                cli: "/nonexistent/aws-cli-for-tests".into(),
                region: None,
                profile: None,
            },
            Duration::from_millis(10),
        );
        let err = cli.availability_zones().await.unwrap_err();
        assert!(matches!(err, CloudError::Launch(_)));
    }
}
