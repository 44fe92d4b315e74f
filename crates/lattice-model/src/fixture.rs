//! In-memory cluster fixtures for tests
//!
//! [`FixtureReader`] answers [`ClusterReader`] calls from maps populated by
//! the test, and the free functions build the objects a typical route graph
//! needs. Enabled for this crate's tests and, through the `testing` feature,
//! for downstream integration tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, ObjectReference, Service, ServicePort, ServiceSpec};
use k8s_openapi::api::discovery::v1::{
    Endpoint, EndpointConditions, EndpointPort, EndpointSlice,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, ObjectMeta, Time};
use kube::ResourceExt;
use lattice_common::crd::{
    BackendRef, GRPCRoute, Gateway, GatewayClass, GatewayClassSpec, GatewayListener, GatewaySpec,
    HTTPRoute, HttpRouteRule, HttpRouteSpec, ParentReference, RouteParentStatus, RouteStatus,
    ServiceExport, ServiceExportSpec, ServiceImport, ServiceImportSpec, TLSRoute,
    CONDITION_ACCEPTED,
};
use lattice_common::{annotations, ControllerConfig, Error, Result};

use crate::policy::{AnyPolicy, PolicyKind};
use crate::reader::ClusterReader;
use crate::route::{Route, RouteKind};

/// Cluster name used by fixtures
pub const CLUSTER: &str = "test-cluster";
/// VPC used by fixtures
pub const VPC: &str = "vpc-0123";
/// GatewayClass owned by the controller in fixtures
pub const GATEWAY_CLASS: &str = "amazon-vpc-lattice";

/// Configuration matching the fixtures
pub fn config() -> ControllerConfig {
    let mut config = ControllerConfig::new(CLUSTER, VPC);
    config.account_id = "111122223333".to_string();
    config
}

/// In-memory [`ClusterReader`]
#[derive(Clone, Debug, Default)]
pub struct FixtureReader {
    /// Gateways by namespace/name
    pub gateways: BTreeMap<(String, String), Gateway>,
    /// GatewayClasses by name
    pub gateway_classes: BTreeMap<String, GatewayClass>,
    /// Namespaces by name
    pub namespaces: BTreeMap<String, Namespace>,
    /// Routes by kind/namespace/name
    pub routes: BTreeMap<(RouteKind, String, String), Route>,
    /// Services by namespace/name
    pub services: BTreeMap<(String, String), Service>,
    /// ServiceImports by namespace/name
    pub service_imports: BTreeMap<(String, String), ServiceImport>,
    /// ServiceExports by namespace/name
    pub service_exports: BTreeMap<(String, String), ServiceExport>,
    /// EndpointSlices by owning service namespace/name
    pub endpoint_slices: BTreeMap<(String, String), Vec<EndpointSlice>>,
    /// Policies
    pub policies: Vec<AnyPolicy>,
    /// Policy kinds whose CRD is treated as missing
    pub missing_policy_crds: Vec<PolicyKind>,
}

fn key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

impl FixtureReader {
    /// Reader with the controller's GatewayClass installed
    pub fn new() -> Self {
        let mut reader = Self::default();
        reader.gateway_classes.insert(
            GATEWAY_CLASS.to_string(),
            GatewayClass::new(
                GATEWAY_CLASS,
                GatewayClassSpec {
                    controller_name: config().controller_name,
                    description: None,
                },
            ),
        );
        reader
    }

    /// Add a gateway
    pub fn with_gateway(mut self, gateway: Gateway) -> Self {
        let ns = gateway.namespace().unwrap_or_default();
        self.gateways.insert(key(&ns, &gateway.name_any()), gateway);
        self
    }

    /// Add a service together with its endpoint slices
    pub fn with_service(mut self, service: Service, slices: Vec<EndpointSlice>) -> Self {
        let ns = service.namespace().unwrap_or_default();
        let name = service.name_any();
        self.endpoint_slices.insert(key(&ns, &name), slices);
        self.services.insert(key(&ns, &name), service);
        self
    }

    /// Add a route
    pub fn with_route(mut self, route: Route) -> Self {
        self.routes
            .insert((route.kind(), route.namespace(), route.name()), route);
        self
    }

    /// Add a ServiceExport
    pub fn with_service_export(mut self, export: ServiceExport) -> Self {
        let ns = export.namespace().unwrap_or_default();
        self.service_exports.insert(key(&ns, &export.name_any()), export);
        self
    }

    /// Add a ServiceImport
    pub fn with_service_import(mut self, import: ServiceImport) -> Self {
        let ns = import.namespace().unwrap_or_default();
        self.service_imports.insert(key(&ns, &import.name_any()), import);
        self
    }

    /// Add a policy
    pub fn with_policy(mut self, policy: AnyPolicy) -> Self {
        self.policies.push(policy);
        self
    }
}

#[async_trait]
impl ClusterReader for FixtureReader {
    async fn get_gateway(&self, namespace: &str, name: &str) -> Result<Option<Gateway>> {
        Ok(self.gateways.get(&key(namespace, name)).cloned())
    }

    async fn get_gateway_class(&self, name: &str) -> Result<Option<GatewayClass>> {
        Ok(self.gateway_classes.get(name).cloned())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        Ok(self.namespaces.get(name).cloned())
    }

    async fn get_route(
        &self,
        kind: RouteKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Route>> {
        Ok(self
            .routes
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self.services.get(&key(namespace, name)).cloned())
    }

    async fn get_service_import(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceImport>> {
        Ok(self.service_imports.get(&key(namespace, name)).cloned())
    }

    async fn get_service_export(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceExport>> {
        Ok(self.service_exports.get(&key(namespace, name)).cloned())
    }

    async fn list_endpoint_slices(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Vec<EndpointSlice>> {
        Ok(self
            .endpoint_slices
            .get(&key(namespace, service))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_policies(&self, kind: PolicyKind, namespace: &str) -> Result<Vec<AnyPolicy>> {
        if self.missing_policy_crds.contains(&kind) {
            return Err(Error::crd_not_installed(kind.as_str()));
        }
        Ok(self
            .policies
            .iter()
            .filter(|p| p.kind() == kind && p.namespace() == namespace)
            .cloned()
            .collect())
    }
}

// =============================================================================
// Object builders
// =============================================================================

fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Gateway of the controller's class with the given listeners
pub fn gateway(namespace: &str, name: &str, listeners: Vec<GatewayListener>) -> Gateway {
    Gateway {
        metadata: meta(namespace, name),
        spec: GatewaySpec {
            gateway_class_name: GATEWAY_CLASS.to_string(),
            listeners,
        },
        status: None,
    }
}

/// Gateway listener section
pub fn listener(name: &str, port: i32, protocol: &str) -> GatewayListener {
    GatewayListener {
        name: name.to_string(),
        port,
        protocol: protocol.to_string(),
        ..Default::default()
    }
}

/// Parent reference to a gateway in the route namespace
pub fn parent(gateway: &str) -> ParentReference {
    ParentReference {
        name: gateway.to_string(),
        ..Default::default()
    }
}

/// Service backend reference
pub fn backend(name: &str, port: i32, weight: i32) -> BackendRef {
    BackendRef {
        name: name.to_string(),
        port: Some(port),
        weight: Some(weight),
        ..Default::default()
    }
}

/// HTTPRoute with one rule forwarding to the given backends
pub fn http_route(
    namespace: &str,
    name: &str,
    gateway: &str,
    backends: Vec<BackendRef>,
) -> HTTPRoute {
    HTTPRoute {
        metadata: meta(namespace, name),
        spec: HttpRouteSpec {
            parent_refs: vec![parent(gateway)],
            hostnames: vec![],
            rules: vec![HttpRouteRule {
                matches: vec![],
                backend_refs: backends,
            }],
        },
        status: None,
    }
}

/// Record every parent of the route as accepted by the controller
pub fn accept_parents(mut route: Route) -> Route {
    let controller_name = config().controller_name;
    let parents = route
        .parent_refs()
        .iter()
        .map(|parent_ref| RouteParentStatus {
            parent_ref: parent_ref.clone(),
            controller_name: controller_name.clone(),
            conditions: vec![Condition {
                type_: CONDITION_ACCEPTED.to_string(),
                status: "True".to_string(),
                reason: "Accepted".to_string(),
                message: String::new(),
                last_transition_time: Time(chrono::Utc::now()),
                observed_generation: None,
            }],
        })
        .collect();
    *route.status_mut() = RouteStatus { parents };
    route
}

/// Mark a route as being deleted
pub fn deleted<R: Into<Route>>(route: R) -> Route {
    route.into().detached()
}

/// ClusterIP service with the given (name, port) ports
pub fn service(namespace: &str, name: &str, ports: &[(Option<&str>, i32)]) -> Service {
    Service {
        metadata: meta(namespace, name),
        spec: Some(ServiceSpec {
            ports: Some(
                ports
                    .iter()
                    .map(|(port_name, port)| ServicePort {
                        name: port_name.map(str::to_string),
                        port: *port,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        status: None,
    }
}

/// Endpoint address with readiness and terminating flags
pub struct Address<'a> {
    /// IP address
    pub ip: &'a str,
    /// Ready condition
    pub ready: bool,
    /// Terminating condition
    pub terminating: bool,
}

/// Ready, non-terminating address
pub fn ready(ip: &str) -> Address<'_> {
    Address {
        ip,
        ready: true,
        terminating: false,
    }
}

/// EndpointSlice of a service exposing the given (name, port) ports
pub fn endpoint_slice(
    namespace: &str,
    service: &str,
    ports: &[(Option<&str>, i32)],
    addresses: &[Address<'_>],
) -> EndpointSlice {
    EndpointSlice {
        metadata: ObjectMeta {
            name: Some(format!("{service}-abcde")),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                crate::reader::SERVICE_NAME_LABEL.to_string(),
                service.to_string(),
            )])),
            ..Default::default()
        },
        address_type: "IPv4".to_string(),
        endpoints: addresses
            .iter()
            .enumerate()
            .map(|(i, a)| Endpoint {
                addresses: vec![a.ip.to_string()],
                conditions: Some(EndpointConditions {
                    ready: Some(a.ready),
                    serving: Some(a.ready),
                    terminating: Some(a.terminating),
                }),
                target_ref: Some(ObjectReference {
                    kind: Some("Pod".to_string()),
                    name: Some(format!("{service}-{i}")),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect(),
        ports: Some(
            ports
                .iter()
                .map(|(name, port)| EndpointPort {
                    name: name.map(str::to_string),
                    port: Some(*port),
                    ..Default::default()
                })
                .collect(),
        ),
    }
}

/// Standard single-backend graph: gateway `gw1` with an HTTP listener on 80,
/// HTTPRoute `svc1` in `ns1` forwarding to Service `tg1` (weight 10)
pub fn standard_graph() -> (FixtureReader, Route) {
    let route = accept_parents(
        http_route("ns1", "svc1", "gw1", vec![backend("tg1", 80, 10)]).into(),
    );
    let reader = FixtureReader::new()
        .with_gateway(gateway("ns1", "gw1", vec![listener("http", 80, "HTTP")]))
        .with_service(
            service("ns1", "tg1", &[(None, 80)]),
            vec![endpoint_slice(
                "ns1",
                "tg1",
                &[(Some(""), 8080)],
                &[ready("10.0.0.1"), ready("10.0.0.2")],
            )],
        )
        .with_route(route.clone());
    (reader, route)
}

/// ServiceExport federated to the mesh
pub fn service_export(namespace: &str, name: &str) -> ServiceExport {
    let mut metadata = meta(namespace, name);
    metadata.annotations = Some(
        [(
            annotations::EXPORT_FEDERATION.to_string(),
            annotations::FEDERATION_LATTICE.to_string(),
        )]
        .into(),
    );
    ServiceExport {
        metadata,
        spec: ServiceExportSpec {},
        status: None,
    }
}

/// Mark a ServiceExport as being deleted
pub fn deleted_export(mut export: ServiceExport) -> ServiceExport {
    export.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    export
}

/// ServiceImport without owner annotations, i.e. owned by this cluster
pub fn service_import(namespace: &str, name: &str) -> ServiceImport {
    ServiceImport {
        metadata: meta(namespace, name),
        spec: ServiceImportSpec::default(),
    }
}

/// Backend reference to a ServiceImport
pub fn import_backend(name: &str, port: i32, weight: i32) -> BackendRef {
    BackendRef {
        kind: Some("ServiceImport".to_string()),
        ..backend(name, port, weight)
    }
}

/// GRPCRoute with the given spec
pub fn grpc_route(
    namespace: &str,
    name: &str,
    spec: lattice_common::crd::GrpcRouteSpec,
) -> GRPCRoute {
    GRPCRoute {
        metadata: meta(namespace, name),
        spec,
        status: None,
    }
}

/// TLSRoute with the given spec
pub fn tls_route(
    namespace: &str,
    name: &str,
    spec: lattice_common::crd::TlsRouteSpec,
) -> TLSRoute {
    TLSRoute {
        metadata: meta(namespace, name),
        spec,
        status: None,
    }
}
