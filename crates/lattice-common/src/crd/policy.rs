//! Policy CRDs attached to gateways, routes and services
//!
//! Every policy carries a `targetRef` naming the object it applies to. Policies
//! are optional: when a CRD is not installed the feature is simply absent.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference from a policy to the object it applies to
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct PolicyTargetReference {
    /// API group of the target ("" for core)
    #[serde(default)]
    pub group: String,
    /// Kind of the target
    pub kind: String,
    /// Name of the target
    pub name: String,
    /// Namespace of the target; absent means the policy namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Status shared by every policy kind
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    /// Accepted / Programmed conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

// =============================================================================
// TargetGroupPolicy
// =============================================================================

/// Overrides target group protocol and health checking for a Service
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "application-networking.k8s.aws",
    version = "v1alpha1",
    kind = "TargetGroupPolicy",
    plural = "targetgrouppolicies",
    namespaced,
    status = "PolicyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct TargetGroupPolicySpec {
    /// Service or ServiceExport the policy applies to
    pub target_ref: PolicyTargetReference,
    /// Target group protocol (HTTP, HTTPS, TCP)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Target group protocol version (HTTP1, HTTP2, GRPC)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    /// Health check configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckConfig>,
}

/// Target group health check configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    /// Whether health checks are enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Seconds between checks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<i64>,
    /// Seconds before a check times out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,
    /// Successes before a target is healthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthy_threshold_count: Option<i64>,
    /// Failures before a target is unhealthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unhealthy_threshold_count: Option<i64>,
    /// HTTP status codes counted as healthy (e.g. "200-299")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_match: Option<String>,
    /// Request path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Port; absent means the target port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i64>,
    /// Health check protocol
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Health check protocol version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
}

// =============================================================================
// VpcAssociationPolicy
// =============================================================================

/// Controls association of a gateway's service network with the cluster VPC
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "application-networking.k8s.aws",
    version = "v1alpha1",
    kind = "VpcAssociationPolicy",
    plural = "vpcassociationpolicies",
    namespaced,
    status = "PolicyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VpcAssociationPolicySpec {
    /// Gateway the policy applies to
    pub target_ref: PolicyTargetReference,
    /// Security groups attached to the VPC association
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_group_ids: Vec<String>,
    /// Whether to associate; absent means true
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub associate_with_vpc: Option<bool>,
}

// =============================================================================
// AccessLogPolicy
// =============================================================================

/// Streams access logs of a gateway or route to a destination
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "application-networking.k8s.aws",
    version = "v1alpha1",
    kind = "AccessLogPolicy",
    plural = "accesslogpolicies",
    namespaced,
    status = "PolicyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogPolicySpec {
    /// Gateway, HTTPRoute or GRPCRoute the policy applies to
    pub target_ref: PolicyTargetReference,
    /// S3 bucket, CloudWatch log group or Firehose stream ARN
    pub destination_arn: String,
}

// =============================================================================
// IAMAuthPolicy
// =============================================================================

/// Attaches an IAM auth policy to a gateway's network or a route's service
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "application-networking.k8s.aws",
    version = "v1alpha1",
    kind = "IAMAuthPolicy",
    plural = "iamauthpolicies",
    namespaced,
    status = "PolicyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct IamAuthPolicySpec {
    /// Gateway, HTTPRoute or GRPCRoute the policy applies to
    pub target_ref: PolicyTargetReference,
    /// IAM policy document (JSON)
    pub policy: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn policy_crds_share_the_controller_group() {
        for crd in [
            TargetGroupPolicy::crd(),
            VpcAssociationPolicy::crd(),
            AccessLogPolicy::crd(),
            IAMAuthPolicy::crd(),
        ] {
            assert_eq!(crd.spec.group, "application-networking.k8s.aws");
            assert_eq!(crd.spec.scope, "Namespaced");
        }
    }

    #[test]
    fn target_group_policy_decodes() {
        let json = serde_json::json!({
            "targetRef": {"group": "", "kind": "Service", "name": "tg1"},
            "protocol": "HTTPS",
            "protocolVersion": "HTTP2",
            "healthCheck": {"enabled": true, "path": "/healthz", "intervalSeconds": 10}
        });
        let spec: TargetGroupPolicySpec =
            serde_json::from_value(json).expect("should decode policy spec");
        assert_eq!(spec.target_ref.kind, "Service");
        assert_eq!(spec.target_ref.namespace, None);
        let hc = spec.health_check.expect("should have health check");
        assert_eq!(hc.path.as_deref(), Some("/healthz"));
        assert_eq!(hc.interval_seconds, Some(10));
    }
}
