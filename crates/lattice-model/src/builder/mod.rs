//! Model builders
//!
//! A build pass turns one triggering object into a [`Stack`]. Routes drive
//! Service → Listener → Rule → TargetGroup → Targets; ServiceExports drive
//! TargetGroup → Targets; gateways and access log policies have their own
//! single-resource builders.
//!
//! Builders only read the cluster. Every lookup goes through the
//! [`ClusterReader`] carried by [`BuildContext`], and process-wide settings
//! arrive through the [`ControllerConfig`] on the same context.

mod access_log;
mod listener;
mod rule;
mod service;
mod service_network;
mod target_group;
mod targets;

use lattice_common::annotations;
use lattice_common::crd::ServiceExport;
use lattice_common::kube_utils::{annotation, is_being_deleted, NamespacedName};
use lattice_common::{ControllerConfig, Error, Result};
use tracing::{debug, instrument};

use crate::reader::ClusterReader;
use crate::route::Route;
use crate::stack::Stack;

pub use access_log::AccessLogSubscriptionBuilder;
pub use rule::rule_conditions;
pub use service::resolve_service_name;
pub use service_network::ServiceNetworkBuilder;
pub use targets::select_targets;

use listener::ListenerBuilder;
use rule::RuleBuilder;
use service::ServiceBuilder;
use target_group::TargetGroupBuilder;

/// Read access and configuration shared by every builder of one pass
#[derive(Clone, Copy)]
pub struct BuildContext<'a> {
    /// Cluster read boundary
    pub reader: &'a dyn ClusterReader,
    /// Controller configuration
    pub config: &'a ControllerConfig,
}

impl<'a> BuildContext<'a> {
    /// Create a build context
    pub fn new(reader: &'a dyn ClusterReader, config: &'a ControllerConfig) -> Self {
        Self { reader, config }
    }
}

// =============================================================================
// Route pipeline
// =============================================================================

/// Builds the stack of one route
pub struct RouteModelBuilder<'a> {
    ctx: BuildContext<'a>,
}

impl<'a> RouteModelBuilder<'a> {
    /// Create a route model builder
    pub fn new(ctx: BuildContext<'a>) -> Self {
        Self { ctx }
    }

    /// Build the complete stack of a route.
    ///
    /// A deleted route still yields its service and the target groups of
    /// every backend reference, all marked deleted, so synthesis can tear
    /// them down.
    #[instrument(skip(self, route), fields(route = %route.id(), kind = %route.kind()))]
    pub async fn build(&self, route: &Route) -> Result<Stack> {
        let mut stack = Stack::new(route.id());
        let service_id = ServiceBuilder::new(self.ctx).build(&mut stack, route).await?;

        if route.is_deleted() {
            let target_groups = TargetGroupBuilder::new(self.ctx);
            for backend_ref in route.backend_refs() {
                if let Err(e) = target_groups
                    .build_for_backend(&mut stack, route, &backend_ref)
                    .await
                {
                    debug!(
                        backend = %backend_ref.name,
                        error = %e,
                        "skipping backend of deleted route"
                    );
                }
            }
            debug!(resources = stack.len(), "built deletion stack");
            return Ok(stack);
        }

        let listeners = ListenerBuilder::new(self.ctx)
            .build(&mut stack, route, &service_id)
            .await?;

        let rules = RuleBuilder::new(self.ctx);
        for listener_id in &listeners {
            rules.build(&mut stack, route, listener_id).await?;
        }

        debug!(
            listeners = listeners.len(),
            resources = stack.len(),
            "built route stack"
        );
        Ok(stack)
    }
}

// =============================================================================
// ServiceExport pipeline
// =============================================================================

/// Builds the stack of one ServiceExport
pub struct ServiceExportModelBuilder<'a> {
    ctx: BuildContext<'a>,
}

impl<'a> ServiceExportModelBuilder<'a> {
    /// Create a service export model builder
    pub fn new(ctx: BuildContext<'a>) -> Self {
        Self { ctx }
    }

    /// Build the target groups and targets of an exported service.
    ///
    /// Exports not federated to the mesh produce an empty stack.
    #[instrument(skip(self, export), fields(export = %NamespacedName::of(export)))]
    pub async fn build(&self, export: &ServiceExport) -> Result<Stack> {
        let id = NamespacedName::of(export);
        let mut stack = Stack::new(id.clone());

        match annotation(export, annotations::EXPORT_FEDERATION) {
            Some(annotations::FEDERATION_LATTICE) => {}
            other => {
                debug!(federation = ?other, "export is not federated to the mesh");
                return Ok(stack);
            }
        }

        let ports = export_ports(export)?;
        let target_groups = TargetGroupBuilder::new(self.ctx);
        match ports {
            Some(ports) => {
                for port in ports {
                    target_groups
                        .build_for_export(&mut stack, export, Some(port))
                        .await?;
                }
            }
            None => {
                target_groups.build_for_export(&mut stack, export, None).await?;
            }
        }

        debug!(
            resources = stack.len(),
            deleted = is_being_deleted(export),
            "built export stack"
        );
        Ok(stack)
    }
}

/// Ports listed in the export-port annotation, `None` when absent
pub(super) fn export_ports(export: &ServiceExport) -> Result<Option<Vec<i32>>> {
    let Some(raw) = annotation(export, annotations::EXPORT_PORT) else {
        return Ok(None);
    };

    let mut ports = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let port = part
            .parse::<i32>()
            .ok()
            .filter(|p| (1..=65535).contains(p))
            .ok_or_else(|| {
                Error::validation_for_field(
                    NamespacedName::of(export).to_string(),
                    format!("metadata.annotations[{}]", annotations::EXPORT_PORT),
                    format!("invalid port {part:?}"),
                )
            })?;
        if !ports.contains(&port) {
            ports.push(port);
        }
    }
    Ok(if ports.is_empty() { None } else { Some(ports) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::fixture::{
        self, accept_parents, backend, deleted, endpoint_slice, http_route, ready, service,
        Address, FixtureReader,
    };
    use crate::resources::{
        DefaultAction, ListenerProtocol, ListenerSpec, PathMatch, RuleSpec, ServiceSpec,
        TargetGroupOrigin, TargetGroupProtocol, TargetGroupRef, TargetGroupSpec, TargetsSpec,
    };
    use crate::stack::{ResourceId, ResourceKind};
    use kube::api::ObjectMeta;
    use lattice_common::crd::{
        GatewayTlsConfig, HeaderMatch, HttpRouteMatch, HttpRouteRule, ServiceExportSpec,
        TlsRouteRule, TlsRouteSpec, TLS_MODE_PASSTHROUGH,
    };

    async fn build(reader: &FixtureReader, route: &Route) -> Result<Stack> {
        let config = fixture::config();
        RouteModelBuilder::new(BuildContext::new(reader, &config))
            .build(route)
            .await
    }

    fn tg_id(name: &str) -> ResourceId {
        ResourceId::derive(
            ResourceKind::TargetGroup,
            &[name, "ns1", "svc1", "ns1", "false"],
        )
    }

    // =========================================================================
    // End-to-end example
    // =========================================================================

    #[tokio::test]
    async fn story_single_backend_route_builds_full_graph() {
        let (reader, route) = fixture::standard_graph();
        let stack = build(&reader, &route).await.expect("should build");

        let services = stack.list::<ServiceSpec>();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].spec.route.name, "svc1");

        let listeners = stack.list::<ListenerSpec>();
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].spec.port, 80);
        assert_eq!(listeners[0].spec.protocol, ListenerProtocol::Http);
        assert_eq!(
            listeners[0].spec.default_action,
            DefaultAction::FixedResponse { status_code: 404 }
        );

        let rules = stack.list::<RuleSpec>();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].spec.conditions.path, PathMatch::Prefix("/".to_string()));
        assert_eq!(rules[0].spec.action.target_groups.len(), 1);
        assert_eq!(
            rules[0].spec.action.target_groups[0].target,
            TargetGroupRef::Stack(tg_id("tg1"))
        );
        assert_eq!(rules[0].spec.action.target_groups[0].weight, 10);

        let groups = stack.list::<TargetGroupSpec>();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, tg_id("tg1"));
        assert_eq!(
            groups[0].spec.name,
            crate::resources::target_group_name(&[
                "tg1", "ns1", "svc1", "ns1", "false", "HTTP", "HTTP1"
            ])
        );
        assert_eq!(groups[0].spec.protocol, TargetGroupProtocol::Http);

        let targets = stack.list::<TargetsSpec>();
        assert_eq!(targets.len(), 1);
        let ips: Vec<_> = targets[0].spec.targets.iter().map(|t| t.ip.as_str()).collect();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.2"]);
        assert!(targets[0].spec.targets.iter().all(|t| t.port == 8080));
    }

    #[tokio::test]
    async fn story_repeated_builds_are_identical() {
        let (reader, route) = fixture::standard_graph();
        let first = build(&reader, &route).await.expect("should build");
        let second = build(&reader, &route).await.expect("should build");
        assert_eq!(first, second);
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    #[tokio::test]
    async fn story_deleted_route_still_builds_marked_resources() {
        let (reader, route) = fixture::standard_graph();
        let route = deleted(route);
        let stack = build(&reader, &route).await.expect("should build");

        let services = stack.list::<ServiceSpec>();
        assert_eq!(services.len(), 1);
        assert!(services[0].spec.is_deleted);

        let groups = stack.list::<TargetGroupSpec>();
        assert_eq!(groups.len(), 1);
        assert!(groups[0].spec.is_deleted);
        assert_eq!(groups[0].id, tg_id("tg1"));

        assert!(stack.list::<ListenerSpec>().is_empty());
        assert!(stack.list::<RuleSpec>().is_empty());
    }

    #[tokio::test]
    async fn story_deletion_succeeds_after_backend_disappears() {
        let (mut reader, route) = fixture::standard_graph();
        reader.services.clear();
        reader.endpoint_slices.clear();
        let stack = build(&reader, &deleted(route)).await.expect("should build");

        let groups = stack.list::<TargetGroupSpec>();
        assert_eq!(groups.len(), 1);
        assert!(groups[0].spec.is_deleted);
        assert!(stack.list::<TargetsSpec>()[0].spec.targets.is_empty());
    }

    // =========================================================================
    // Rule bounds and partial failure
    // =========================================================================

    fn route_with_headers(count: usize) -> Route {
        let mut route = http_route("ns1", "svc1", "gw1", vec![backend("tg1", 80, 10)]);
        route.spec.rules[0].matches = vec![HttpRouteMatch {
            headers: (0..count)
                .map(|i| HeaderMatch {
                    type_: None,
                    name: format!("x-h{i}"),
                    value: "v".to_string(),
                })
                .collect(),
            ..Default::default()
        }];
        accept_parents(route.into())
    }

    #[tokio::test]
    async fn story_header_match_bound() {
        let (reader, _) = fixture::standard_graph();
        let stack = build(&reader, &route_with_headers(5)).await.expect("5 headers should build");
        assert_eq!(stack.list::<RuleSpec>()[0].spec.conditions.headers.len(), 5);

        let err = build(&reader, &route_with_headers(6))
            .await
            .expect_err("6 headers should fail");
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn story_partial_backend_failure_keeps_valid_backend() {
        let (reader, _) = fixture::standard_graph();
        let route = accept_parents(
            http_route(
                "ns1",
                "svc1",
                "gw1",
                vec![backend("tg1", 80, 10), backend("missing", 80, 90)],
            )
            .into(),
        );
        let stack = build(&reader, &route).await.expect("should build");

        let action = &stack.list::<RuleSpec>()[0].spec.action;
        assert_eq!(action.target_groups.len(), 2);
        assert_eq!(action.target_groups[0].target, TargetGroupRef::Stack(tg_id("tg1")));
        assert_eq!(action.target_groups[0].weight, 10);
        assert_eq!(action.target_groups[1].target, TargetGroupRef::Invalid);
        assert_eq!(action.target_groups[1].weight, 90);
        assert_eq!(stack.list::<TargetGroupSpec>().len(), 1);
    }

    #[tokio::test]
    async fn story_one_rule_per_match_block() {
        let (reader, _) = fixture::standard_graph();
        let mut route = http_route("ns1", "svc1", "gw1", vec![backend("tg1", 80, 10)]);
        route.spec.rules[0].matches = vec![
            HttpRouteMatch {
                method: Some("get".to_string()),
                ..Default::default()
            },
            HttpRouteMatch::default(),
        ];
        route.spec.rules.push(HttpRouteRule {
            matches: vec![],
            backend_refs: vec![backend("tg1", 80, 1)],
        });
        let stack = build(&reader, &accept_parents(route.into()))
            .await
            .expect("should build");

        let rules = stack.list::<RuleSpec>();
        assert_eq!(rules.len(), 3);
        let ordinals: Vec<_> = rules.iter().map(|r| r.spec.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
        assert_eq!(rules[0].spec.conditions.method.as_deref(), Some("GET"));
        assert_eq!(stack.list::<TargetGroupSpec>().len(), 1);
    }

    // =========================================================================
    // TLS passthrough
    // =========================================================================

    fn passthrough_graph(rules: usize) -> (FixtureReader, Route) {
        let mut tls = fixture::listener("tls", 443, "TLS");
        tls.tls = Some(GatewayTlsConfig {
            mode: Some(TLS_MODE_PASSTHROUGH.to_string()),
            options: BTreeMap::new(),
        });
        let route = fixture::tls_route(
            "ns1",
            "db",
            TlsRouteSpec {
                parent_refs: vec![fixture::parent("gw1")],
                hostnames: vec!["db.example.com".to_string()],
                rules: (0..rules)
                    .map(|_| TlsRouteRule {
                        backend_refs: vec![backend("tg1", 443, 1)],
                    })
                    .collect(),
            },
        );
        let route = accept_parents(route.into());
        let (reader, _) = fixture::standard_graph();
        let reader = reader.with_gateway(fixture::gateway("ns1", "gw1", vec![tls]));
        (reader, route)
    }

    #[tokio::test]
    async fn story_passthrough_listener_forwards_from_default_action() {
        let (reader, route) = passthrough_graph(1);
        let stack = build(&reader, &route).await.expect("should build");

        let listeners = stack.list::<ListenerSpec>();
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].spec.protocol, ListenerProtocol::TlsPassthrough);
        match &listeners[0].spec.default_action {
            DefaultAction::Forward(action) => assert_eq!(action.target_groups.len(), 1),
            other => panic!("expected forward action, got {other:?}"),
        }
        assert!(stack.list::<RuleSpec>().is_empty());
        assert_eq!(
            stack.list::<TargetGroupSpec>()[0].spec.protocol,
            TargetGroupProtocol::Tcp
        );
    }

    #[tokio::test]
    async fn story_passthrough_with_two_rules_fails() {
        let (reader, route) = passthrough_graph(2);
        let err = build(&reader, &route).await.expect_err("should fail");
        assert!(err.is_validation());
    }

    // =========================================================================
    // Endpoint selection
    // =========================================================================

    #[tokio::test]
    async fn story_unnamed_port_includes_every_live_address() {
        let (reader, route) = fixture::standard_graph();
        let reader = reader.with_service(
            service("ns1", "tg1", &[(None, 80)]),
            vec![endpoint_slice(
                "ns1",
                "tg1",
                &[(None, 8080)],
                &[
                    ready("10.0.0.1"),
                    Address {
                        ip: "10.0.0.2",
                        ready: false,
                        terminating: false,
                    },
                    Address {
                        ip: "10.0.0.3",
                        ready: true,
                        terminating: true,
                    },
                ],
            )],
        );
        let stack = build(&reader, &route).await.expect("should build");

        let targets = &stack.list::<TargetsSpec>()[0].spec.targets;
        let ips: Vec<_> = targets.iter().map(|t| t.ip.as_str()).collect();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.2"]);
        assert!(!targets[1].ready);
    }

    // =========================================================================
    // ServiceExport
    // =========================================================================

    fn export(annotations: &[(&str, &str)]) -> ServiceExport {
        ServiceExport {
            metadata: ObjectMeta {
                name: Some("tg1".to_string()),
                namespace: Some("ns1".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: ServiceExportSpec {},
            status: None,
        }
    }

    async fn build_export(reader: &FixtureReader, export: &ServiceExport) -> Result<Stack> {
        let config = fixture::config();
        ServiceExportModelBuilder::new(BuildContext::new(reader, &config))
            .build(export)
            .await
    }

    #[tokio::test]
    async fn story_federated_export_builds_export_target_group() {
        let (reader, _) = fixture::standard_graph();
        let export = export(&[(annotations::EXPORT_FEDERATION, annotations::FEDERATION_LATTICE)]);
        let stack = build_export(&reader, &export).await.expect("should build");

        let groups = stack.list::<TargetGroupSpec>();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].spec.origin, TargetGroupOrigin::ServiceExport);
        assert!(groups[0].spec.route.is_none());
        assert_eq!(stack.list::<TargetsSpec>()[0].spec.targets.len(), 2);
    }

    #[tokio::test]
    async fn story_export_ports_build_one_group_each() {
        let (reader, _) = fixture::standard_graph();
        let reader = reader.with_service(
            service("ns1", "tg1", &[(Some("http"), 80), (Some("admin"), 9090)]),
            vec![endpoint_slice(
                "ns1",
                "tg1",
                &[(Some("http"), 8080), (Some("admin"), 9091)],
                &[ready("10.0.0.1")],
            )],
        );
        let export = export(&[
            (annotations::EXPORT_FEDERATION, annotations::FEDERATION_LATTICE),
            (annotations::EXPORT_PORT, "80, 9090"),
        ]);
        let stack = build_export(&reader, &export).await.expect("should build");

        let groups = stack.list::<TargetGroupSpec>();
        assert_eq!(groups.len(), 2);
        let targets = stack.list::<TargetsSpec>();
        assert_eq!(targets[0].spec.targets[0].port, 8080);
        assert_eq!(targets[1].spec.targets[0].port, 9091);
    }

    #[tokio::test]
    async fn story_unfederated_export_is_empty() {
        let (reader, _) = fixture::standard_graph();
        let stack = build_export(&reader, &export(&[])).await.expect("should build");
        assert!(stack.is_empty());
    }

    #[test]
    fn invalid_export_port_is_rejected() {
        let err = export_ports(&export(&[(annotations::EXPORT_PORT, "80,http")]))
            .expect_err("should reject");
        assert!(err.is_validation());
        assert_eq!(
            export_ports(&export(&[(annotations::EXPORT_PORT, "80,80")])).expect("should parse"),
            Some(vec![80])
        );
    }
}
