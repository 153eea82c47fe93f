//! Failover error types.

use std::time::Duration;

use thiserror::Error;

use vipwatch_cloud::CloudError;

/// Errors raised while launching and readying a replacement.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("target zone {0} is the zone being replaced")]
    SameZone(String),

    #[error("no subnet found in AZ {zone} within {vpc_id}")]
    NoSubnetInZone { zone: String, vpc_id: String },

    #[error("subnet {0} has no usable gateway address")]
    NoGateway(String),

    #[error("failed to render bootstrap template: {0}")]
    Template(#[from] handlebars::RenderError),

    #[error("instance {0} reports no network interface")]
    NoInterface(String),

    #[error("instance {instance_id} did not reach {what} within {after:?}")]
    WaitTimeout {
        instance_id: String,
        what: &'static str,
        after: Duration,
    },

    #[error("{step} failed: {source}")]
    Cloud {
        step: &'static str,
        #[source]
        source: CloudError,
    },
}

impl ProvisionError {
    pub(crate) fn cloud(step: &'static str) -> impl FnOnce(CloudError) -> Self {
        move |source| ProvisionError::Cloud { step, source }
    }

    /// Whether the target zone simply has nowhere to put the replacement.
    pub fn is_capacity_gap(&self) -> bool {
        matches!(self, ProvisionError::NoSubnetInZone { .. })
    }
}

/// Errors that stop a reconcile pass before any table is touched.
///
/// Failures on individual tables are reported, not raised.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("cannot resolve the VPC of {old:?} or {new}")]
    VpcUnresolved { old: Option<String>, new: String },

    #[error("failed to list route tables of {vpc_id}: {source}")]
    ListTables {
        vpc_id: String,
        #[source]
        source: CloudError,
    },
}

/// Errors surfaced by a controller cycle.
#[derive(Debug, Error)]
pub enum FailoverError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("cloud lookup failed: {0}")]
    Cloud(#[from] CloudError),
}

impl FailoverError {
    /// Whether the loop must stop: retrying can never succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FailoverError::Provision(ProvisionError::Template(_))
                | FailoverError::Provision(ProvisionError::SameZone(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_config_and_invariant_errors_are_fatal() {
        let timeout = FailoverError::Provision(ProvisionError::WaitTimeout {
            instance_id: "i-new".into(),
            what: "running",
            after: Duration::from_secs(600),
        });
        assert!(!timeout.is_fatal());

        let same = FailoverError::Provision(ProvisionError::SameZone("us-east-1a".into()));
        assert!(same.is_fatal());

        let lookup = FailoverError::Cloud(CloudError::NotFound("subnet-a".into()));
        assert!(!lookup.is_fatal());
    }

    #[test]
    fn capacity_gap_is_recognized() {
        let err = ProvisionError::NoSubnetInZone {
            zone: "us-east-1b".into(),
            vpc_id: "vpc-1".into(),
        };
        assert!(err.is_capacity_gap());
        assert_eq!(err.to_string(), "no subnet found in AZ us-east-1b within vpc-1");
    }
}
