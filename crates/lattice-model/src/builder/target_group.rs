//! Target group builder
//!
//! Two entry points share one output type: route backend references and
//! ServiceExports. Identity is derived from the Kubernetes objects involved,
//! so repeated builds map to the same mesh target group.

use k8s_openapi::api::core::v1::Service;
use kube::{Resource, ResourceExt};
use lattice_common::annotations;
use lattice_common::crd::{BackendRef, ServiceExport, TargetGroupPolicy};
use lattice_common::kube_utils::{annotation, is_being_deleted, NamespacedName};
use lattice_common::{Error, Result};
use tracing::debug;

use super::targets::TargetsBuilder;
use super::{export_ports, BuildContext};
use crate::policy::{find_policy, PolicyTarget};
use crate::resources::{
    target_group_name, ImportSource, IpAddressType, ProtocolVersion, RouteRef,
    TargetGroupOrigin, TargetGroupProtocol, TargetGroupSpec,
};
use crate::route::{Route, RouteKind};
use crate::stack::{ResourceId, ResourceKind, Stack};

const KIND_SERVICE: &str = "Service";
const KIND_SERVICE_IMPORT: &str = "ServiceImport";
const DEFAULT_PORT: i32 = 80;

/// Builds target groups and their targets
pub(crate) struct TargetGroupBuilder<'a> {
    ctx: BuildContext<'a>,
}

impl<'a> TargetGroupBuilder<'a> {
    pub(crate) fn new(ctx: BuildContext<'a>) -> Self {
        Self { ctx }
    }

    // =========================================================================
    // Backend references
    // =========================================================================

    /// Build the target group of one route backend reference.
    ///
    /// Returns the existing ID when the same reference was already built in
    /// this pass.
    pub(crate) async fn build_for_backend(
        &self,
        stack: &mut Stack,
        route: &Route,
        backend_ref: &BackendRef,
    ) -> Result<ResourceId> {
        let route_ns = route.namespace();
        let namespace = backend_ref.resolve_namespace(&route_ns).to_string();
        let is_import = match backend_ref.kind() {
            KIND_SERVICE => false,
            KIND_SERVICE_IMPORT => true,
            other => {
                return Err(Error::validation_for(
                    route.id().to_string(),
                    format!("unsupported backend kind {other}"),
                ))
            }
        };

        let route_name = route.name();
        let import_flag = is_import.to_string();
        let identity = [
            backend_ref.name.as_str(),
            namespace.as_str(),
            route_name.as_str(),
            route_ns.as_str(),
            import_flag.as_str(),
        ];
        let id = ResourceId::derive(ResourceKind::TargetGroup, &identity);
        if stack.get::<TargetGroupSpec>(&id).is_some() {
            return Ok(id);
        }

        let route_ref = RouteRef {
            name: route_name.clone(),
            namespace: route_ns.clone(),
            kind: route.kind(),
        };

        if is_import {
            if let Some(spec) = self
                .local_export_spec(route, backend_ref, &namespace)
                .await?
            {
                return stack.add(id, spec);
            }
            let spec = self
                .import_spec(route, backend_ref, &namespace, &identity, route_ref)
                .await?;
            return stack.add(id, spec);
        }

        let is_deleted = route.is_deleted();
        let service = self.ctx.reader.get_service(&namespace, &backend_ref.name).await?;
        if service.is_none() && !is_deleted {
            return Err(Error::not_found(
                KIND_SERVICE,
                format!("{namespace}/{}", backend_ref.name),
            ));
        }

        let ip_address_type = match &service {
            Some(service) => ip_address_type(service)?,
            None => IpAddressType::default(),
        };
        let policy = find_policy::<TargetGroupPolicy>(
            self.ctx.reader,
            &PolicyTarget::new("", KIND_SERVICE, &namespace, &backend_ref.name),
        )
        .await?;
        let (protocol, protocol_version) = resolve_protocol(route.kind(), policy.as_ref())?;
        let port = backend_ref
            .port
            .or_else(|| service.as_ref().and_then(first_service_port))
            .unwrap_or(DEFAULT_PORT);

        let spec = TargetGroupSpec {
            name: target_group_name(&[
                identity[0],
                identity[1],
                identity[2],
                identity[3],
                identity[4],
                protocol.as_str(),
                protocol_version.as_str(),
            ]),
            vpc_id: self.ctx.config.vpc_id.clone(),
            cluster_name: self.ctx.config.cluster_name.clone(),
            port,
            protocol,
            protocol_version,
            ip_address_type,
            health_check: policy.and_then(|p| p.spec.health_check),
            service: NamespacedName::new(&namespace, &backend_ref.name),
            route: Some(route_ref),
            origin: TargetGroupOrigin::BackendRef,
            import: None,
            is_deleted,
        };
        let id = stack.add(id, spec)?;

        TargetsBuilder::new(self.ctx)
            .build(stack, &id, service.as_ref(), backend_ref.port, is_deleted)
            .await?;
        Ok(id)
    }

    /// Spec of a target group owned by another cluster; it carries no targets
    async fn import_spec(
        &self,
        route: &Route,
        backend_ref: &BackendRef,
        namespace: &str,
        identity: &[&str; 5],
        route_ref: RouteRef,
    ) -> Result<TargetGroupSpec> {
        let is_deleted = route.is_deleted();
        let import = self
            .ctx
            .reader
            .get_service_import(namespace, &backend_ref.name)
            .await?;
        if import.is_none() && !is_deleted {
            return Err(Error::not_found(
                KIND_SERVICE_IMPORT,
                format!("{namespace}/{}", backend_ref.name),
            ));
        }

        let source = ImportSource {
            cluster_name: import
                .as_ref()
                .and_then(|i| annotation(i, annotations::IMPORT_CLUSTER))
                .unwrap_or(&self.ctx.config.cluster_name)
                .to_string(),
            vpc_id: import
                .as_ref()
                .and_then(|i| annotation(i, annotations::IMPORT_VPC))
                .unwrap_or(&self.ctx.config.vpc_id)
                .to_string(),
        };
        let (protocol, protocol_version) = resolve_protocol(route.kind(), None)?;
        let port = backend_ref
            .port
            .or_else(|| {
                import
                    .as_ref()
                    .and_then(|i| i.spec.ports.first())
                    .map(|p| p.port)
            })
            .unwrap_or(DEFAULT_PORT);

        debug!(
            import = %backend_ref.name,
            cluster = %source.cluster_name,
            vpc = %source.vpc_id,
            "resolved service import"
        );

        Ok(TargetGroupSpec {
            name: target_group_name(&[
                identity[0],
                identity[1],
                identity[2],
                identity[3],
                identity[4],
                protocol.as_str(),
                protocol_version.as_str(),
            ]),
            vpc_id: source.vpc_id.clone(),
            cluster_name: source.cluster_name.clone(),
            port,
            protocol,
            protocol_version,
            ip_address_type: IpAddressType::default(),
            health_check: None,
            service: NamespacedName::new(namespace, &backend_ref.name),
            route: Some(route_ref),
            origin: TargetGroupOrigin::BackendRef,
            import: Some(source),
            is_deleted,
        })
    }

    // =========================================================================
    // ServiceExports
    // =========================================================================

    /// Build the target group of an exported service port
    pub(crate) async fn build_for_export(
        &self,
        stack: &mut Stack,
        export: &ServiceExport,
        export_port: Option<i32>,
    ) -> Result<ResourceId> {
        let (id, spec, service) = self.export_spec(export, export_port).await?;
        let is_deleted = spec.is_deleted;
        let id = stack.add(id, spec)?;

        TargetsBuilder::new(self.ctx)
            .build(stack, &id, service.as_ref(), export_port, is_deleted)
            .await?;
        Ok(id)
    }

    /// Group of an exported service port, with the service behind it
    async fn export_spec(
        &self,
        export: &ServiceExport,
        export_port: Option<i32>,
    ) -> Result<(ResourceId, TargetGroupSpec, Option<Service>)> {
        let export_id = NamespacedName::of(export);
        let is_deleted = is_being_deleted(export);

        let service = self
            .ctx
            .reader
            .get_service(&export_id.namespace, &export_id.name)
            .await?;
        if service.is_none() && !is_deleted {
            return Err(Error::not_found(KIND_SERVICE, export_id.to_string()));
        }

        let port = export_port
            .or_else(|| service.as_ref().and_then(first_service_port))
            .unwrap_or(DEFAULT_PORT);
        let port_str = port.to_string();
        let identity = [
            export_id.name.as_str(),
            export_id.namespace.as_str(),
            port_str.as_str(),
            "export",
        ];
        let id = ResourceId::derive(ResourceKind::TargetGroup, &identity);

        let ip_address_type = match &service {
            Some(service) => ip_address_type(service)?,
            None => IpAddressType::default(),
        };
        let policy = self.export_policy(export, &export_id).await?;
        let (protocol, protocol_version) = resolve_protocol(RouteKind::Http, policy.as_ref())?;

        let spec = TargetGroupSpec {
            name: target_group_name(&[
                identity[0],
                identity[1],
                identity[2],
                identity[3],
                protocol.as_str(),
                protocol_version.as_str(),
            ]),
            vpc_id: self.ctx.config.vpc_id.clone(),
            cluster_name: self.ctx.config.cluster_name.clone(),
            port,
            protocol,
            protocol_version,
            ip_address_type,
            health_check: policy.and_then(|p| p.spec.health_check),
            service: export_id,
            route: None,
            origin: TargetGroupOrigin::ServiceExport,
            import: None,
            is_deleted,
        };
        Ok((id, spec, service))
    }

    /// The group a ServiceImport backend shares with this cluster's own
    /// export of the same service port, if there is one.
    ///
    /// The export keeps owning the group and its targets; the route only
    /// adds a backend-ref reference to it.
    async fn local_export_spec(
        &self,
        route: &Route,
        backend_ref: &BackendRef,
        namespace: &str,
    ) -> Result<Option<TargetGroupSpec>> {
        let config = self.ctx.config;
        let Some(import) = self
            .ctx
            .reader
            .get_service_import(namespace, &backend_ref.name)
            .await?
        else {
            return Ok(None);
        };
        let cluster = annotation(&import, annotations::IMPORT_CLUSTER);
        let vpc = annotation(&import, annotations::IMPORT_VPC);
        if cluster.is_some_and(|c| c != config.cluster_name)
            || vpc.is_some_and(|v| v != config.vpc_id)
        {
            return Ok(None);
        }

        let Some(export) = self
            .ctx
            .reader
            .get_service_export(namespace, &backend_ref.name)
            .await?
        else {
            return Ok(None);
        };
        // A terminating export keeps its group until the route lets go
        let federation = annotation(&export, annotations::EXPORT_FEDERATION);
        if federation != Some(annotations::FEDERATION_LATTICE) {
            return Ok(None);
        }

        let export_port = match export_ports(&export)? {
            Some(ports) => match backend_ref.port {
                Some(port) if ports.contains(&port) => Some(port),
                _ => return Ok(None),
            },
            None => None,
        };
        let (_, mut spec, _) = self.export_spec(&export, export_port).await?;
        if backend_ref.port.is_some_and(|port| port != spec.port) {
            return Ok(None);
        }

        debug!(
            import = %backend_ref.name,
            target_group = %spec.name,
            "service import resolves to a local export"
        );
        spec.origin = TargetGroupOrigin::BackendRef;
        spec.is_deleted = route.is_deleted();
        Ok(Some(spec))
    }

    /// TargetGroupPolicy of an export: targeting the export first, then the service
    async fn export_policy(
        &self,
        export: &ServiceExport,
        export_id: &NamespacedName,
    ) -> Result<Option<TargetGroupPolicy>> {
        let on_export = PolicyTarget::new(
            ServiceExport::group(&()),
            ServiceExport::kind(&()),
            &export_id.namespace,
            &export_id.name,
        );
        if let Some(policy) = find_policy(self.ctx.reader, &on_export).await? {
            return Ok(Some(policy));
        }
        debug!(export = %export.name_any(), "no export policy, trying service policy");
        find_policy(
            self.ctx.reader,
            &PolicyTarget::new("", KIND_SERVICE, &export_id.namespace, &export_id.name),
        )
        .await
    }
}

/// Protocol and version of a target group: route-kind defaults, overridden by policy.
///
/// TLS routes always use TCP.
fn resolve_protocol(
    kind: RouteKind,
    policy: Option<&TargetGroupPolicy>,
) -> Result<(TargetGroupProtocol, ProtocolVersion)> {
    match kind {
        RouteKind::Tls => return Ok((TargetGroupProtocol::Tcp, ProtocolVersion::default())),
        RouteKind::Http | RouteKind::Grpc => {}
    }

    let default_version = match kind {
        RouteKind::Grpc => ProtocolVersion::Grpc,
        _ => ProtocolVersion::Http1,
    };
    let Some(policy) = policy else {
        return Ok((TargetGroupProtocol::Http, default_version));
    };

    let policy_id = NamespacedName::of(policy).to_string();
    let protocol = match policy.spec.protocol.as_deref() {
        Some(value) => TargetGroupProtocol::parse(value)
            .filter(|p| *p != TargetGroupProtocol::Tcp)
            .ok_or_else(|| {
                Error::validation_for_field(
                    policy_id.clone(),
                    "spec.protocol",
                    format!("unsupported protocol {value:?}"),
                )
            })?,
        None => TargetGroupProtocol::Http,
    };
    let version = match policy.spec.protocol_version.as_deref() {
        Some(value) => ProtocolVersion::parse(value).ok_or_else(|| {
            Error::validation_for_field(
                policy_id,
                "spec.protocolVersion",
                format!("unsupported protocol version {value:?}"),
            )
        })?,
        None => default_version,
    };
    Ok((protocol, version))
}

/// Address family of a service; dual-stack services are rejected
fn ip_address_type(service: &Service) -> Result<IpAddressType> {
    let spec = service.spec.as_ref();
    let families = spec.and_then(|s| s.ip_families.as_deref()).unwrap_or_default();
    let policy = spec.and_then(|s| s.ip_family_policy.as_deref());

    if families.len() > 1 || policy == Some("RequireDualStack") {
        return Err(Error::validation_for(
            NamespacedName::of(service).to_string(),
            "dual-stack services are not supported",
        ));
    }
    Ok(match families.first().map(String::as_str) {
        Some("IPv6") => IpAddressType::Ipv6,
        _ => IpAddressType::Ipv4,
    })
}

fn first_service_port(service: &Service) -> Option<i32> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .and_then(|ports| ports.first())
        .map(|p| p.port)
}
