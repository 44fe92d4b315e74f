//! Mesh API boundary
//!
//! [`LatticeApi`] is the seam between synthesis and the VPC Lattice control
//! plane. Every call is keyed by names, IDs or tags so synthesis can run as
//! find-or-create/find-or-update against a shared account.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use lattice_common::crd::HealthCheckConfig;
use lattice_common::retry::{retry_if, RetryConfig};
use lattice_common::{Error, Result};
use lattice_model::resources::RuleConditions;
use thiserror::Error as ThisError;

#[cfg(test)]
use mockall::automock;

/// Resource tags
pub type Tags = BTreeMap<String, String>;

/// Delay before retrying after an eventual-consistency failure
pub const CONSISTENCY_DELAY: Duration = Duration::from_secs(10);

/// In-place attempts for throttled calls before giving up to a requeue
const THROTTLE_ATTEMPTS: u32 = 3;

/// Mesh API failure classes
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum ApiError {
    /// Resource does not exist
    #[error("not found: {0}")]
    NotFound(String),
    /// Resource state conflicts with the request (in use, duplicate, not ready)
    #[error("conflict: {0}")]
    Conflict(String),
    /// Request rate exceeded
    #[error("throttled: {0}")]
    Throttled(String),
    /// Request rejected as invalid
    #[error("validation: {0}")]
    Validation(String),
    /// Any other failure
    #[error("{0}")]
    Other(String),
}

impl ApiError {
    /// Whether the call was throttled
    pub fn is_throttled(&self) -> bool {
        matches!(self, ApiError::Throttled(_))
    }

    /// Whether the resource does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }

    /// Convert into a controller error.
    ///
    /// Conflicts and throttling are eventual-consistency failures and become
    /// a bounded requeue; rejected requests are permanent.
    pub fn into_error(self, operation: &str) -> Error {
        match self {
            ApiError::Conflict(msg) | ApiError::Throttled(msg) => {
                Error::requeue(format!("{operation}: {msg}"), CONSISTENCY_DELAY)
            }
            ApiError::Validation(msg) => Error::cloud_permanent(operation, msg),
            ApiError::NotFound(msg) | ApiError::Other(msg) => Error::cloud(operation, msg),
        }
    }
}

/// Result of a mesh API call
pub type ApiResult<T> = std::result::Result<T, ApiError>;

async fn attempt<T, F, Fut>(operation: &str, f: F) -> ApiResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ApiResult<T>>,
{
    retry_if(
        &RetryConfig::with_max_attempts(THROTTLE_ATTEMPTS),
        operation,
        ApiError::is_throttled,
        f,
    )
    .await
}

/// Run a mesh API call, retrying throttling in place and classifying failures
pub async fn call<T, F, Fut>(operation: &str, f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ApiResult<T>>,
{
    attempt(operation, f)
        .await
        .map_err(|e| e.into_error(operation))
}

/// Run a mesh API delete; a resource that is already gone counts as deleted
pub async fn call_delete<F, Fut>(operation: &str, f: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ApiResult<()>>,
{
    match attempt(operation, f).await {
        Err(e) if e.is_not_found() => Ok(()),
        other => other.map_err(|e| e.into_error(operation)),
    }
}

// =============================================================================
// Records
// =============================================================================

/// Desired state of a service network
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceNetworkInput {
    /// Network name
    pub name: String,
    /// IAM auth policy; `None` disables IAM auth
    pub auth_policy: Option<String>,
    /// Tags
    pub tags: Tags,
}

/// A service network
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceNetworkRecord {
    /// ID
    pub id: String,
    /// ARN
    pub arn: String,
    /// Current state
    pub network: ServiceNetworkInput,
}

/// Association of a service network with a VPC
#[derive(Clone, Debug, PartialEq)]
pub struct VpcAssociationRecord {
    /// ID
    pub id: String,
    /// Service network
    pub service_network_id: String,
    /// VPC
    pub vpc_id: String,
    /// Security groups
    pub security_group_ids: Vec<String>,
    /// Tags
    pub tags: Tags,
}

/// Desired state of a service
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceInput {
    /// Service name
    pub name: String,
    /// Custom domain name
    pub custom_domain_name: Option<String>,
    /// Certificate ARN
    pub certificate_arn: Option<String>,
    /// IAM auth policy; `None` disables IAM auth
    pub auth_policy: Option<String>,
    /// Tags
    pub tags: Tags,
}

/// A service
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceRecord {
    /// ID
    pub id: String,
    /// ARN
    pub arn: String,
    /// Generated DNS name
    pub dns_name: String,
    /// Current state
    pub service: ServiceInput,
}

/// Association of a service with a service network
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceNetworkAssociationRecord {
    /// ID
    pub id: String,
    /// Service
    pub service_id: String,
    /// Service network
    pub service_network_id: String,
}

/// Weighted forward target of an action
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeightedTargetRecord {
    /// Target group ID
    pub target_group_id: String,
    /// Weight
    pub weight: i32,
}

/// Listener default action or rule action
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionRecord {
    /// Fixed status code
    FixedResponse {
        /// HTTP status code
        status_code: i32,
    },
    /// Weighted forward
    Forward(Vec<WeightedTargetRecord>),
}

/// Desired state of a listener
#[derive(Clone, Debug, PartialEq)]
pub struct ListenerInput {
    /// Owning service
    pub service_id: String,
    /// Listener name
    pub name: String,
    /// Port
    pub port: i32,
    /// Protocol
    pub protocol: String,
    /// Default action
    pub default_action: ActionRecord,
    /// Tags
    pub tags: Tags,
}

/// A listener
#[derive(Clone, Debug, PartialEq)]
pub struct ListenerRecord {
    /// ID
    pub id: String,
    /// ARN
    pub arn: String,
    /// Current state
    pub listener: ListenerInput,
}

/// Desired state of a rule
#[derive(Clone, Debug, PartialEq)]
pub struct RuleInput {
    /// Owning service
    pub service_id: String,
    /// Owning listener
    pub listener_id: String,
    /// Rule name
    pub name: String,
    /// Priority (1..=100, lower evaluates first)
    pub priority: u32,
    /// Match conditions
    pub conditions: RuleConditions,
    /// Action
    pub action: ActionRecord,
    /// Tags
    pub tags: Tags,
}

/// A rule
#[derive(Clone, Debug, PartialEq)]
pub struct RuleRecord {
    /// ID
    pub id: String,
    /// ARN
    pub arn: String,
    /// Current state
    pub rule: RuleInput,
}

/// Desired state of a target group
#[derive(Clone, Debug, PartialEq)]
pub struct TargetGroupInput {
    /// Name
    pub name: String,
    /// VPC
    pub vpc_id: String,
    /// Default port
    pub port: i32,
    /// Protocol
    pub protocol: String,
    /// Protocol version
    pub protocol_version: String,
    /// Address family
    pub ip_address_type: String,
    /// Health check
    pub health_check: Option<HealthCheckConfig>,
    /// Tags
    pub tags: Tags,
}

/// A target group
#[derive(Clone, Debug, PartialEq)]
pub struct TargetGroupRecord {
    /// ID
    pub id: String,
    /// ARN
    pub arn: String,
    /// Current state
    pub target_group: TargetGroupInput,
}

/// A registered target
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetRecord {
    /// IP address
    pub ip: String,
    /// Port
    pub port: i32,
}

/// Desired state of an access log subscription
#[derive(Clone, Debug, PartialEq)]
pub struct AccessLogSubscriptionInput {
    /// Logged service or service network
    pub resource_arn: String,
    /// Destination
    pub destination_arn: String,
    /// Tags
    pub tags: Tags,
}

/// An access log subscription
#[derive(Clone, Debug, PartialEq)]
pub struct AccessLogSubscriptionRecord {
    /// ID
    pub id: String,
    /// ARN
    pub arn: String,
    /// Current state
    pub subscription: AccessLogSubscriptionInput,
}

// =============================================================================
// API
// =============================================================================

/// VPC Lattice control plane operations used by synthesis
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LatticeApi: Send + Sync {
    /// Find a service network by name
    async fn find_service_network(&self, name: &str) -> ApiResult<Option<ServiceNetworkRecord>>;

    /// Create a service network
    async fn create_service_network(
        &self,
        input: ServiceNetworkInput,
    ) -> ApiResult<ServiceNetworkRecord>;

    /// Update a service network's auth policy and tags
    async fn update_service_network(
        &self,
        id: &str,
        input: ServiceNetworkInput,
    ) -> ApiResult<ServiceNetworkRecord>;

    /// Delete a service network
    async fn delete_service_network(&self, id: &str) -> ApiResult<()>;

    /// Find the association of a service network with a VPC
    async fn find_vpc_association(
        &self,
        service_network_id: &str,
        vpc_id: &str,
    ) -> ApiResult<Option<VpcAssociationRecord>>;

    /// Associate a service network with a VPC
    async fn create_vpc_association(
        &self,
        service_network_id: &str,
        vpc_id: &str,
        security_group_ids: Vec<String>,
        tags: Tags,
    ) -> ApiResult<VpcAssociationRecord>;

    /// Replace the security groups of a VPC association
    async fn update_vpc_association(
        &self,
        id: &str,
        security_group_ids: Vec<String>,
    ) -> ApiResult<()>;

    /// Remove a VPC association
    async fn delete_vpc_association(&self, id: &str) -> ApiResult<()>;

    /// Find a service by name
    async fn find_service(&self, name: &str) -> ApiResult<Option<ServiceRecord>>;

    /// Create a service
    async fn create_service(&self, input: ServiceInput) -> ApiResult<ServiceRecord>;

    /// Update a service
    async fn update_service(&self, id: &str, input: ServiceInput) -> ApiResult<ServiceRecord>;

    /// Delete a service
    async fn delete_service(&self, id: &str) -> ApiResult<()>;

    /// List the service network associations of a service
    async fn list_service_network_associations(
        &self,
        service_id: &str,
    ) -> ApiResult<Vec<ServiceNetworkAssociationRecord>>;

    /// Associate a service with a service network
    async fn create_service_network_association(
        &self,
        service_id: &str,
        service_network_id: &str,
        tags: Tags,
    ) -> ApiResult<ServiceNetworkAssociationRecord>;

    /// Remove a service network association
    async fn delete_service_network_association(&self, id: &str) -> ApiResult<()>;

    /// List the listeners of a service
    async fn list_listeners(&self, service_id: &str) -> ApiResult<Vec<ListenerRecord>>;

    /// Create a listener
    async fn create_listener(&self, input: ListenerInput) -> ApiResult<ListenerRecord>;

    /// Replace a listener's default action
    async fn update_listener(
        &self,
        service_id: &str,
        listener_id: &str,
        default_action: ActionRecord,
    ) -> ApiResult<()>;

    /// Delete a listener
    async fn delete_listener(&self, service_id: &str, listener_id: &str) -> ApiResult<()>;

    /// List the rules of a listener
    async fn list_rules(&self, service_id: &str, listener_id: &str) -> ApiResult<Vec<RuleRecord>>;

    /// Create a rule
    async fn create_rule(&self, input: RuleInput) -> ApiResult<RuleRecord>;

    /// Update a rule
    async fn update_rule(&self, rule_id: &str, input: RuleInput) -> ApiResult<RuleRecord>;

    /// Delete a rule
    async fn delete_rule(&self, service_id: &str, listener_id: &str, rule_id: &str)
        -> ApiResult<()>;

    /// Find a target group by name
    async fn find_target_group(&self, name: &str) -> ApiResult<Option<TargetGroupRecord>>;

    /// List every target group in the account
    async fn list_target_groups(&self) -> ApiResult<Vec<TargetGroupRecord>>;

    /// Create a target group
    async fn create_target_group(&self, input: TargetGroupInput) -> ApiResult<TargetGroupRecord>;

    /// Replace a target group's health check
    async fn update_target_group(
        &self,
        id: &str,
        health_check: Option<HealthCheckConfig>,
    ) -> ApiResult<()>;

    /// Delete a target group
    async fn delete_target_group(&self, id: &str) -> ApiResult<()>;

    /// List the targets registered in a target group
    async fn list_targets(&self, target_group_id: &str) -> ApiResult<Vec<TargetRecord>>;

    /// Register targets
    async fn register_targets(
        &self,
        target_group_id: &str,
        targets: Vec<TargetRecord>,
    ) -> ApiResult<()>;

    /// Deregister targets
    async fn deregister_targets(
        &self,
        target_group_id: &str,
        targets: Vec<TargetRecord>,
    ) -> ApiResult<()>;

    /// List the access log subscriptions of a service or service network
    async fn list_access_log_subscriptions(
        &self,
        resource_arn: &str,
    ) -> ApiResult<Vec<AccessLogSubscriptionRecord>>;

    /// Create an access log subscription
    async fn create_access_log_subscription(
        &self,
        input: AccessLogSubscriptionInput,
    ) -> ApiResult<AccessLogSubscriptionRecord>;

    /// Change the destination of an access log subscription
    async fn update_access_log_subscription(
        &self,
        id: &str,
        destination_arn: &str,
    ) -> ApiResult<()>;

    /// Delete an access log subscription
    async fn delete_access_log_subscription(&self, id: &str) -> ApiResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistency_failures_requeue() {
        let err = ApiError::Conflict("listener busy".to_string()).into_error("DeleteListener");
        assert_eq!(err.requeue_after(), Some(CONSISTENCY_DELAY));

        let err = ApiError::Throttled("slow down".to_string()).into_error("CreateRule");
        assert!(err.requeue_after().is_some());
    }

    #[test]
    fn rejected_requests_are_permanent() {
        let err = ApiError::Validation("bad port".to_string()).into_error("CreateListener");
        assert!(!err.is_retryable());

        let err = ApiError::Other("boom".to_string()).into_error("CreateListener");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn call_classifies_the_final_error() {
        let result: Result<()> = call("DeleteService", || async {
            Err(ApiError::Conflict("has listeners".to_string()))
        })
        .await;
        let err = result.expect_err("should fail");
        assert!(err.requeue_after().is_some());
    }

    #[tokio::test]
    async fn deleting_a_missing_resource_succeeds() {
        call_delete("DeleteRule", || async {
            Err(ApiError::NotFound("rule-1".to_string()))
        })
        .await
        .expect("missing resource should count as deleted");
    }

    #[tokio::test]
    async fn call_retries_throttling_in_place() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let value = call("ListTargets", || {
            let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(ApiError::Throttled("slow down".to_string()))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .expect("should succeed after retry");
        assert_eq!(value, 7);
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
