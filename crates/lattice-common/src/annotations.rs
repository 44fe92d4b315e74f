//! Annotation keys, tag keys and well-known values
//!
//! Everything the controller reads from or writes to Kubernetes objects and
//! mesh resources is namespaced under [`PREFIX`].

/// Prefix shared by every annotation and tag owned by this controller
pub const PREFIX: &str = "application-networking.k8s.aws/";

/// Default controller name advertised in `GatewayClass.spec.controllerName`
pub const DEFAULT_CONTROLLER_NAME: &str = "application-networking.k8s.aws/gateway-api-controller";

/// Finalizer added to every object the controller manages
pub const FINALIZER: &str = "application-networking.k8s.aws/resources";

// =============================================================================
// Annotations read by the model builders
// =============================================================================

/// Route/Gateway: suppress service network association ("true"/"false")
pub const STANDALONE: &str = "application-networking.k8s.aws/standalone";

/// Route: identifier of the owner a pre-existing service may be taken over from
pub const ALLOW_TAKEOVER_FROM: &str = "application-networking.k8s.aws/allow-takeover-from";

/// Route: explicit Lattice service name
pub const SERVICE_NAME_OVERRIDE: &str = "application-networking.k8s.aws/service-name-override";

/// Gateway: Lattice service name applied to routes attached to it
pub const LATTICE_SERVICE_NAME: &str = "application-networking.k8s.aws/lattice-service-name";

/// Gateway listener TLS option: ACM certificate ARN
pub const CERTIFICATE_ARN: &str = "application-networking.k8s.aws/certificate-arn";

/// Gateway: associate the service network with the cluster VPC ("true"/"false")
pub const VPC_ASSOCIATION: &str = "application-networking.k8s.aws/lattice-vpc-association";

/// Route: free-form additional tags ("k1=v1,k2=v2")
pub const TAGS: &str = "application-networking.k8s.aws/tags";

/// ServiceExport: comma separated list of exported service ports
pub const EXPORT_PORT: &str = "application-networking.k8s.aws/port";

/// ServiceExport: federation backend; exports are only handled when this is
/// [`FEDERATION_LATTICE`]
pub const EXPORT_FEDERATION: &str = "application-networking.k8s.aws/federation";

/// Value of [`EXPORT_FEDERATION`] selecting this controller
pub const FEDERATION_LATTICE: &str = "amazon-vpc-lattice";

/// ServiceImport: VPC that owns the imported target group
pub const IMPORT_VPC: &str = "application-networking.k8s.aws/aws-vpc";

/// ServiceImport: cluster that exported the imported service
pub const IMPORT_CLUSTER: &str = "multicluster.x-k8s.io/aws-eks-cluster-name";

// =============================================================================
// Annotations written by the controllers
// =============================================================================

/// Route: DNS name assigned to the Lattice service
pub const ASSIGNED_DOMAIN_NAME: &str =
    "application-networking.k8s.aws/lattice-assigned-domain-name";

// =============================================================================
// Mesh resource tags
// =============================================================================

/// Tag identifying the controller instance owning a mesh resource
pub const TAG_MANAGED_BY: &str = "application-networking.k8s.aws/ManagedBy";
/// Tag: source route name
pub const TAG_ROUTE_NAME: &str = "application-networking.k8s.aws/RouteName";
/// Tag: source route namespace
pub const TAG_ROUTE_NAMESPACE: &str = "application-networking.k8s.aws/RouteNamespace";
/// Tag: source route kind
pub const TAG_ROUTE_TYPE: &str = "application-networking.k8s.aws/RouteType";
/// Tag: Kubernetes service name behind a target group
pub const TAG_SERVICE_NAME: &str = "application-networking.k8s.aws/K8SServiceName";
/// Tag: Kubernetes service namespace behind a target group
pub const TAG_SERVICE_NAMESPACE: &str = "application-networking.k8s.aws/K8SServiceNamespace";
/// Tag: cluster that produced a target group
pub const TAG_CLUSTER_NAME: &str = "application-networking.k8s.aws/K8SClusterName";
/// Tag: target group origin (BackendRef or ServiceExport)
pub const TAG_SOURCE_TYPE: &str = "application-networking.k8s.aws/K8SSourceType";
/// Tag: target group protocol version
pub const TAG_PROTOCOL_VERSION: &str = "application-networking.k8s.aws/K8SProtocolVersion";
/// Tag: access log policy namespace/name
pub const TAG_ACCESS_LOG_POLICY: &str = "application-networking.k8s.aws/AccessLogPolicy";

/// Tag key prefixes users may not set through [`TAGS`]
pub const RESERVED_TAG_PREFIXES: &[&str] = &["aws:", PREFIX];

/// Parse a boolean annotation value ("true"/"false", case-insensitive)
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}
