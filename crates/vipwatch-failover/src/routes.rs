//! Route convergence.
//!
//! Every route table of the VPC gets its route for the monitored CIDR
//! replaced with one pointing at the new instance. Each table is handled
//! on its own: a failure on one is logged and reported, and the pass moves
//! on to the next.

use std::sync::Arc;

use ipnet::Ipv4Net;
use tracing::{debug, info, warn};

use vipwatch_cloud::CloudProvider;
use vipwatch_core::{RouteTarget, VpcId};

use crate::error::RouteError;
use crate::outcome::Outcome;

/// Result of reconciling one route table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableReport {
    pub target: RouteTarget,
    /// Removal of the previous route. `NotFound` is the normal case for a
    /// table that never had one.
    pub removed: Outcome,
    pub created: Outcome,
}

impl TableReport {
    /// The table now routes the CIDR at the new instance.
    pub fn converged(&self) -> bool {
        self.created.is_ok()
    }
}

/// Result of a whole reconcile pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub vpc_id: VpcId,
    pub tables: Vec<TableReport>,
}

impl ReconcileReport {
    pub fn converged(&self) -> usize {
        self.tables.iter().filter(|t| t.converged()).count()
    }

    pub fn failed(&self) -> usize {
        self.tables.len() - self.converged()
    }

    pub fn fully_converged(&self) -> bool {
        self.failed() == 0
    }
}

pub struct RouteReconciler {
    cloud: Arc<dyn CloudProvider>,
}

impl RouteReconciler {
    pub fn new(cloud: Arc<dyn CloudProvider>) -> Self {
        Self { cloud }
    }

    /// Point every route table of the VPC at `new_instance`.
    ///
    /// The VPC comes from the old instance's subnet when the old instance
    /// can still be described, otherwise from the new instance's.
    pub async fn reconcile(
        &self,
        old_instance: Option<&str>,
        new_instance: &str,
        destination_cidr: Ipv4Net,
    ) -> Result<ReconcileReport, RouteError> {
        let vpc_id = self
            .resolve_vpc(old_instance, new_instance)
            .await
            .ok_or_else(|| RouteError::VpcUnresolved {
                old: old_instance.map(str::to_string),
                new: new_instance.to_string(),
            })?;

        let tables = self
            .cloud
            .route_tables(&vpc_id)
            .await
            .map_err(|source| RouteError::ListTables {
                vpc_id: vpc_id.clone(),
                source,
            })?;

        let cidr = destination_cidr.to_string();
        let mut reports = Vec::with_capacity(tables.len());

        for table in tables {
            let removed = Outcome::from(self.cloud.delete_route(&table.id, &cidr).await);
            match &removed {
                Outcome::Failed(detail) => {
                    warn!(route_table = %table.id, %cidr, error = %detail, "failed to delete route");
                }
                other => debug!(route_table = %table.id, %cidr, result = %other, "deleted route"),
            }

            let created =
                Outcome::from(self.cloud.create_route(&table.id, &cidr, new_instance).await);
            if created.is_ok() {
                info!(route_table = %table.id, %cidr, instance = %new_instance, "route updated");
            } else {
                warn!(route_table = %table.id, %cidr, instance = %new_instance, result = %created, "failed to create route");
            }

            reports.push(TableReport {
                target: RouteTarget {
                    route_table_id: table.id,
                    destination_cidr,
                    instance_id: new_instance.to_string(),
                },
                removed,
                created,
            });
        }

        let report = ReconcileReport {
            vpc_id,
            tables: reports,
        };
        info!(
            vpc = %report.vpc_id,
            converged = report.converged(),
            failed = report.failed(),
            "route reconcile finished"
        );
        Ok(report)
    }

    async fn resolve_vpc(&self, old_instance: Option<&str>, new_instance: &str) -> Option<VpcId> {
        for instance_id in old_instance.into_iter().chain(std::iter::once(new_instance)) {
            match self.vpc_of(instance_id).await {
                Some(vpc) => return Some(vpc),
                None => debug!(instance = %instance_id, "cannot resolve VPC from instance"),
            }
        }
        None
    }

    async fn vpc_of(&self, instance_id: &str) -> Option<VpcId> {
        let instance = self.cloud.describe_instance(instance_id).await.ok()?;
        let subnet_id = instance.subnet_id?;
        let subnet = self.cloud.describe_subnet(&subnet_id).await.ok()?;
        Some(subnet.vpc_id)
    }
}
