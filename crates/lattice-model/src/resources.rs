//! Specs of the mesh resources a stack can hold
//!
//! Specs are plain data. Deletion is an attribute (`is_deleted`) on the
//! top-level resources, never the absence of a resource, so synthesis always
//! has a complete graph to diff against.

use std::collections::BTreeMap;
use std::fmt;

use lattice_common::crd::HealthCheckConfig;
use lattice_common::kube_utils::{deterministic_hash, truncate, NamespacedName};

use crate::route::RouteKind;
use crate::stack::ResourceId;

/// Maximum length of a mesh target group name
pub const MAX_TARGET_GROUP_NAME_LEN: usize = 128;

/// Maximum length of a mesh listener name
pub const MAX_LISTENER_NAME_LEN: usize = 63;

/// Status code of the fallback action of non-passthrough listeners
pub const FALLBACK_STATUS_CODE: i32 = 404;

/// Maximum number of header matches per rule
pub const MAX_HEADER_MATCHES: usize = 5;

/// Route a mesh resource was built from
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RouteRef {
    /// Route name
    pub name: String,
    /// Route namespace
    pub namespace: String,
    /// Route kind
    pub kind: RouteKind,
}

// =============================================================================
// Service
// =============================================================================

/// Mesh service built from one route
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceSpec {
    /// Source route
    pub route: RouteRef,
    /// Custom domain name (first route hostname)
    pub custom_domain_name: Option<String>,
    /// Certificate ARN from the matched gateway listener
    pub certificate_arn: Option<String>,
    /// Service networks to associate with; empty in standalone mode
    pub service_network_names: Vec<String>,
    /// Explicit service name
    pub name_override: Option<String>,
    /// Owner a pre-existing service may be taken over from
    pub allow_takeover_from: Option<String>,
    /// Free-form tags from the route annotation
    pub additional_tags: BTreeMap<String, String>,
    /// IAM auth policy document; `None` disables IAM auth
    pub auth_policy: Option<String>,
    /// Mirrors the route's deletion timestamp
    pub is_deleted: bool,
}

impl ServiceSpec {
    /// Name of the mesh service
    pub fn lattice_name(&self) -> String {
        match &self.name_override {
            Some(name) => name.clone(),
            None => default_service_name(&self.route.name, &self.route.namespace),
        }
    }
}

/// Default mesh service name for a route
pub fn default_service_name(name: &str, namespace: &str) -> String {
    format!("{}-{}", truncate(name, 20), truncate(namespace, 18))
}

// =============================================================================
// Listener
// =============================================================================

/// Listener protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ListenerProtocol {
    /// Plain HTTP
    Http,
    /// HTTPS (HTTP and gRPC)
    Https,
    /// TLS passthrough
    TlsPassthrough,
}

impl ListenerProtocol {
    /// Mesh API protocol string
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerProtocol::Http => "HTTP",
            ListenerProtocol::Https => "HTTPS",
            ListenerProtocol::TlsPassthrough => "TLS_PASSTHROUGH",
        }
    }
}

impl fmt::Display for ListenerProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Listener default action
#[derive(Clone, Debug, PartialEq)]
pub enum DefaultAction {
    /// Respond with a fixed status code
    FixedResponse {
        /// HTTP status code
        status_code: i32,
    },
    /// Forward to target groups (TLS passthrough)
    Forward(RuleAction),
}

/// Listener on a mesh service
#[derive(Clone, Debug, PartialEq)]
pub struct ListenerSpec {
    /// Owning service
    pub service: ResourceId,
    /// Listener name
    pub name: String,
    /// Port
    pub port: i32,
    /// Protocol
    pub protocol: ListenerProtocol,
    /// Default action
    pub default_action: DefaultAction,
}

impl ListenerSpec {
    /// Whether this listener forwards through its default action only
    pub fn is_passthrough(&self) -> bool {
        self.protocol == ListenerProtocol::TlsPassthrough
    }
}

/// Deterministic listener name: `{route}-{namespace}-{port}-{protocol}`
pub fn listener_name(
    route: &str,
    namespace: &str,
    port: i32,
    protocol: ListenerProtocol,
) -> String {
    let name = format!(
        "{}-{}-{}-{}",
        truncate(route, 20),
        truncate(namespace, 18),
        port,
        protocol.as_str().to_ascii_lowercase().replace('_', "-")
    );
    truncate(&name, MAX_LISTENER_NAME_LEN).to_string()
}

// =============================================================================
// Rule
// =============================================================================

/// Path condition of a rule
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PathMatch {
    /// Exact path
    Exact(String),
    /// Path prefix
    Prefix(String),
}

impl Default for PathMatch {
    fn default() -> Self {
        PathMatch::Prefix("/".to_string())
    }
}

/// Exact header condition
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HeaderCondition {
    /// Header name
    pub name: String,
    /// Exact value
    pub value: String,
}

/// Match conditions of one rule
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct RuleConditions {
    /// Path condition
    pub path: PathMatch,
    /// HTTP method
    pub method: Option<String>,
    /// Header conditions (at most [`MAX_HEADER_MATCHES`])
    pub headers: Vec<HeaderCondition>,
}

/// Target group an action forwards to
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TargetGroupRef {
    /// Target group built in this stack
    Stack(ResourceId),
    /// Backend reference that failed to resolve; receives no traffic
    Invalid,
}

/// Weighted forward target
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WeightedTargetGroup {
    /// Target group
    pub target: TargetGroupRef,
    /// Declared weight
    pub weight: i32,
}

/// Forward action of a rule
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct RuleAction {
    /// Weighted target groups; empty means a fixed 404 response
    pub target_groups: Vec<WeightedTargetGroup>,
}

/// Rule on a non-passthrough listener.
///
/// Priority is not part of the model: it is allocated during synthesis
/// against the rules already present on the live listener.
#[derive(Clone, Debug, PartialEq)]
pub struct RuleSpec {
    /// Owning listener
    pub listener: ResourceId,
    /// Position of the rule within the route (orders priorities)
    pub ordinal: usize,
    /// Match conditions
    pub conditions: RuleConditions,
    /// Forward action
    pub action: RuleAction,
}

impl RuleSpec {
    /// Deterministic mesh rule name
    pub fn name(&self) -> String {
        format!("k8s-{}-{}", self.ordinal, truncate(self.listener.as_str(), 40))
    }
}

// =============================================================================
// Target group
// =============================================================================

/// Target group protocol
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TargetGroupProtocol {
    /// HTTP
    #[default]
    Http,
    /// HTTPS
    Https,
    /// TCP (TLS passthrough)
    Tcp,
}

impl TargetGroupProtocol {
    /// Mesh API protocol string
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetGroupProtocol::Http => "HTTP",
            TargetGroupProtocol::Https => "HTTPS",
            TargetGroupProtocol::Tcp => "TCP",
        }
    }

    /// Parse a protocol (case-insensitive)
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "HTTP" => Some(TargetGroupProtocol::Http),
            "HTTPS" => Some(TargetGroupProtocol::Https),
            "TCP" => Some(TargetGroupProtocol::Tcp),
            _ => None,
        }
    }
}

/// Target group protocol version
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    /// HTTP/1.1
    #[default]
    Http1,
    /// HTTP/2
    Http2,
    /// gRPC
    Grpc,
}

impl ProtocolVersion {
    /// Mesh API protocol version string
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVersion::Http1 => "HTTP1",
            ProtocolVersion::Http2 => "HTTP2",
            ProtocolVersion::Grpc => "GRPC",
        }
    }

    /// Parse a protocol version (case-insensitive)
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "HTTP1" => Some(ProtocolVersion::Http1),
            "HTTP2" => Some(ProtocolVersion::Http2),
            "GRPC" => Some(ProtocolVersion::Grpc),
            _ => None,
        }
    }
}

/// IP address family of a target group
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum IpAddressType {
    /// IPv4
    #[default]
    Ipv4,
    /// IPv6
    Ipv6,
}

impl IpAddressType {
    /// Mesh API address type string
    pub fn as_str(&self) -> &'static str {
        match self {
            IpAddressType::Ipv4 => "IPV4",
            IpAddressType::Ipv6 => "IPV6",
        }
    }
}

/// Kind of source referencing a target group
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetGroupOrigin {
    /// A route backend reference
    BackendRef,
    /// A ServiceExport
    ServiceExport,
}

impl TargetGroupOrigin {
    /// Tag value
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetGroupOrigin::BackendRef => "BackendRef",
            TargetGroupOrigin::ServiceExport => "ServiceExport",
        }
    }
}

/// Cluster and VPC that own an imported target group
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImportSource {
    /// Exporting cluster
    pub cluster_name: String,
    /// Exporting VPC
    pub vpc_id: String,
}

/// Mesh target group
#[derive(Clone, Debug, PartialEq)]
pub struct TargetGroupSpec {
    /// Deterministic mesh name
    pub name: String,
    /// VPC the targets live in
    pub vpc_id: String,
    /// Cluster the targets live in
    pub cluster_name: String,
    /// Default target port
    pub port: i32,
    /// Protocol
    pub protocol: TargetGroupProtocol,
    /// Protocol version
    pub protocol_version: ProtocolVersion,
    /// Address family
    pub ip_address_type: IpAddressType,
    /// Health check from TargetGroupPolicy
    pub health_check: Option<HealthCheckConfig>,
    /// Kubernetes service behind the target group
    pub service: NamespacedName,
    /// Route owning the group; `None` for a ServiceExport's group, even
    /// when a route references it through a local ServiceImport
    pub route: Option<RouteRef>,
    /// Source referencing the group in this stack
    pub origin: TargetGroupOrigin,
    /// Set when the group is owned by another cluster (ServiceImport)
    pub import: Option<ImportSource>,
    /// Mirrors the source object's deletion timestamp
    pub is_deleted: bool,
}

impl TargetGroupSpec {
    /// Source that created the group and whose tags it carries
    pub fn owner(&self) -> TargetGroupOrigin {
        match self.route {
            Some(_) => TargetGroupOrigin::BackendRef,
            None => TargetGroupOrigin::ServiceExport,
        }
    }
}

/// Deterministic, length-bounded target group name.
///
/// The natural name is readable; the hash suffix is computed over the full
/// identity so truncated names remain distinct.
pub fn target_group_name(identity: &[&str]) -> String {
    let hash = deterministic_hash(&identity.join("/"));
    let natural = identity
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("-")
        .to_ascii_lowercase();
    // "k8s-" + natural + "-" + hash
    let budget = MAX_TARGET_GROUP_NAME_LEN - 4 - 1 - hash.len();
    format!(
        "k8s-{}-{}",
        truncate(&natural, budget).trim_end_matches('-'),
        hash
    )
}

// =============================================================================
// Targets
// =============================================================================

/// One endpoint registered in a target group
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Target {
    /// Endpoint IP
    pub ip: String,
    /// Endpoint port
    pub port: i32,
    /// Endpoint readiness
    pub ready: bool,
    /// Pod backing the endpoint
    pub pod: Option<NamespacedName>,
}

/// Targets of one target group
#[derive(Clone, Debug, PartialEq)]
pub struct TargetsSpec {
    /// Owning target group
    pub target_group: ResourceId,
    /// Endpoints, sorted by address
    pub targets: Vec<Target>,
}

// =============================================================================
// Service network
// =============================================================================

/// Mesh service network built from a gateway
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceNetworkSpec {
    /// Network name (gateway name)
    pub name: String,
    /// Associate the network with the cluster VPC
    pub associate_to_vpc: bool,
    /// Security groups of the VPC association
    pub security_group_ids: Vec<String>,
    /// IAM auth policy document
    pub auth_policy: Option<String>,
    /// Mirrors the gateway's deletion timestamp
    pub is_deleted: bool,
}

// =============================================================================
// Access log subscription
// =============================================================================

/// Mesh resource whose access logs are streamed
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AccessLogSource {
    /// Service network, by name
    ServiceNetwork(String),
    /// Service, by mesh name
    Service(String),
}

/// Access log subscription built from an AccessLogPolicy
#[derive(Clone, Debug, PartialEq)]
pub struct AccessLogSubscriptionSpec {
    /// Logged resource
    pub source: AccessLogSource,
    /// Destination ARN
    pub destination_arn: String,
    /// Owning policy
    pub policy: NamespacedName,
    /// Mirrors the policy's deletion timestamp
    pub is_deleted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_name_is_truncated_per_part() {
        assert_eq!(default_service_name("svc1", "ns1"), "svc1-ns1");
        let name = default_service_name(&"a".repeat(30), &"b".repeat(30));
        assert_eq!(name.len(), 20 + 1 + 18);
    }

    #[test]
    fn listener_names_follow_route_port_protocol() {
        assert_eq!(
            listener_name("svc1", "ns1", 80, ListenerProtocol::Http),
            "svc1-ns1-80-http"
        );
        assert_eq!(
            listener_name("db", "ns1", 443, ListenerProtocol::TlsPassthrough),
            "db-ns1-443-tls-passthrough"
        );
    }

    #[test]
    fn target_group_names_are_bounded_and_distinct() {
        let short = target_group_name(&["tg1", "ns1", "svc1", "ns1", "false"]);
        assert!(short.starts_with("k8s-tg1-ns1-svc1-ns1-false-"));

        let long_a = target_group_name(&[&"x".repeat(200), "ns1", "svc1", "ns1", "false"]);
        let long_b = target_group_name(&[&"x".repeat(200), "ns2", "svc1", "ns1", "false"]);
        assert!(long_a.len() <= MAX_TARGET_GROUP_NAME_LEN);
        assert_ne!(long_a, long_b);
    }

    #[test]
    fn protocols_parse_case_insensitively() {
        assert_eq!(TargetGroupProtocol::parse("https"), Some(TargetGroupProtocol::Https));
        assert_eq!(ProtocolVersion::parse("grpc"), Some(ProtocolVersion::Grpc));
        assert_eq!(TargetGroupProtocol::parse("UDP"), None);
    }
}
