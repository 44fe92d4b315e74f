//! Listener builder

use std::collections::BTreeMap;

use kube::ResourceExt;
use lattice_common::crd::GatewayListener;
use lattice_common::{Error, Result};
use tracing::debug;

use super::rule::RuleBuilder;
use super::BuildContext;
use crate::gateway::{
    compatible_protocol, first_controlled_gateway, listener_matches_parent, parent_accepted,
    parent_targets_gateway, route_allowed,
};
use crate::resources::{
    listener_name, DefaultAction, ListenerProtocol, ListenerSpec, RuleAction,
    FALLBACK_STATUS_CODE,
};
use crate::route::Route;
use crate::stack::{ResourceId, ResourceKind, Stack};

/// Builds the listeners of a route's service
pub(crate) struct ListenerBuilder<'a> {
    ctx: BuildContext<'a>,
}

impl<'a> ListenerBuilder<'a> {
    pub(crate) fn new(ctx: BuildContext<'a>) -> Self {
        Self { ctx }
    }

    /// Add one listener per compatible, accepted gateway listener section.
    ///
    /// Returns the IDs of listeners that take rules (everything except TLS
    /// passthrough). Incompatible or rejected sections are skipped silently.
    pub(crate) async fn build(
        &self,
        stack: &mut Stack,
        route: &Route,
        service: &ResourceId,
    ) -> Result<Vec<ResourceId>> {
        if route.is_deleted() || route.parent_refs().is_empty() {
            return Ok(Vec::new());
        }

        let Some(gateway) =
            first_controlled_gateway(self.ctx.reader, self.ctx.config, route).await?
        else {
            debug!(route = %route.id(), "no controlled gateway, no listeners");
            return Ok(Vec::new());
        };

        let route_ns = route.namespace();
        let gateway_ns = gateway.namespace().unwrap_or_else(|| "default".to_string());
        let mut namespace_labels: Option<BTreeMap<String, String>> = None;
        let mut rule_listeners = Vec::new();

        for parent in route.parent_refs() {
            if !parent_targets_gateway(parent, &route_ns, &gateway)
                || !parent_accepted(route, self.ctx.config, parent)
            {
                continue;
            }

            for section in gateway
                .spec
                .listeners
                .iter()
                .filter(|l| listener_matches_parent(parent, l))
            {
                let Some(protocol) = compatible_protocol(route.kind(), section) else {
                    debug!(section = %section.name, "listener protocol incompatible with route");
                    continue;
                };

                if needs_namespace_labels(section) && namespace_labels.is_none() {
                    namespace_labels = Some(
                        self.ctx
                            .reader
                            .get_namespace(&route_ns)
                            .await?
                            .map(|ns| ns.labels().clone())
                            .unwrap_or_default(),
                    );
                }
                let labels = namespace_labels.clone().unwrap_or_default();
                if !route_allowed(section, route.kind(), &route_ns, &gateway_ns, &labels) {
                    debug!(section = %section.name, "route not allowed by listener");
                    continue;
                }

                let default_action = if protocol == ListenerProtocol::TlsPassthrough {
                    DefaultAction::Forward(self.passthrough_action(stack, route).await?)
                } else {
                    DefaultAction::FixedResponse {
                        status_code: FALLBACK_STATUS_CODE,
                    }
                };

                let spec = ListenerSpec {
                    service: service.clone(),
                    name: listener_name(&route.name(), &route_ns, section.port, protocol),
                    port: section.port,
                    protocol,
                    default_action,
                };
                let id = ResourceId::derive(
                    ResourceKind::Listener,
                    &[service.as_str(), &section.port.to_string(), protocol.as_str()],
                );
                let id = stack.add(id, spec)?;
                if protocol != ListenerProtocol::TlsPassthrough && !rule_listeners.contains(&id) {
                    rule_listeners.push(id);
                }
            }
        }

        Ok(rule_listeners)
    }

    /// Forward action of a passthrough listener, built from the route's only rule
    async fn passthrough_action(
        &self,
        stack: &mut Stack,
        route: &Route,
    ) -> Result<RuleAction> {
        let rules = route.rules();
        match rules.as_slice() {
            [rule] => Ok(RuleBuilder::new(self.ctx)
                .build_action(stack, route, &rule.backend_refs)
                .await),
            _ => Err(Error::validation_for_field(
                route.id().to_string(),
                "spec.rules",
                format!(
                    "TLS passthrough requires exactly one rule, found {}",
                    rules.len()
                ),
            )),
        }
    }
}

fn needs_namespace_labels(section: &GatewayListener) -> bool {
    section
        .allowed_routes
        .as_ref()
        .and_then(|a| a.namespaces.as_ref())
        .and_then(|n| n.from.as_deref())
        == Some("Selector")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{self, accept_parents, backend, http_route, FixtureReader};
    use k8s_openapi::api::core::v1::Namespace;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use kube::api::ObjectMeta;
    use lattice_common::crd::{AllowedRoutes, RouteNamespaces};

    async fn listeners(reader: &FixtureReader, route: &Route) -> Result<Vec<ListenerSpec>> {
        let config = fixture::config();
        let mut stack = Stack::new(route.id());
        let service = ResourceId::derive(ResourceKind::Service, &["svc"]);
        ListenerBuilder::new(BuildContext::new(reader, &config))
            .build(&mut stack, route, &service)
            .await?;
        Ok(stack
            .list::<ListenerSpec>()
            .into_iter()
            .map(|r| r.spec.clone())
            .collect())
    }

    fn two_listener_gateway() -> FixtureReader {
        let (reader, _) = fixture::standard_graph();
        reader.with_gateway(fixture::gateway(
            "ns1",
            "gw1",
            vec![
                fixture::listener("http", 80, "HTTP"),
                fixture::listener("https", 443, "HTTPS"),
            ],
        ))
    }

    #[tokio::test]
    async fn story_every_compatible_section_gets_a_listener() {
        let (_, route) = fixture::standard_graph();
        let specs = listeners(&two_listener_gateway(), &route)
            .await
            .expect("should build");
        let ports: Vec<_> = specs.iter().map(|l| (l.port, l.protocol)).collect();
        assert_eq!(
            ports,
            vec![(80, ListenerProtocol::Http), (443, ListenerProtocol::Https)]
        );
        assert_eq!(specs[0].name, "svc1-ns1-80-http");
    }

    #[tokio::test]
    async fn story_section_name_narrows_listeners() {
        let mut route = http_route("ns1", "svc1", "gw1", vec![backend("tg1", 80, 1)]);
        route.spec.parent_refs[0].section_name = Some("https".to_string());
        let specs = listeners(&two_listener_gateway(), &accept_parents(route.into()))
            .await
            .expect("should build");
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].port, 443);
    }

    #[tokio::test]
    async fn story_grpc_route_skips_plain_http_listener() {
        let route = fixture::grpc_route(
            "ns1",
            "svc1",
            lattice_common::crd::GrpcRouteSpec {
                parent_refs: vec![fixture::parent("gw1")],
                ..Default::default()
            },
        );
        let specs = listeners(&two_listener_gateway(), &accept_parents(route.into()))
            .await
            .expect("should build");
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].protocol, ListenerProtocol::Https);
    }

    #[tokio::test]
    async fn story_unaccepted_parent_builds_nothing() {
        let route: Route = http_route("ns1", "svc1", "gw1", vec![]).into();
        let specs = listeners(&two_listener_gateway(), &route)
            .await
            .expect("should build");
        assert!(specs.is_empty());
    }

    #[tokio::test]
    async fn story_cross_namespace_route_needs_selector_match() {
        let mut l = fixture::listener("http", 80, "HTTP");
        l.allowed_routes = Some(AllowedRoutes {
            namespaces: Some(RouteNamespaces {
                from: Some("Selector".to_string()),
                selector: Some(LabelSelector {
                    match_labels: Some([("mesh".to_string(), "on".to_string())].into()),
                    ..Default::default()
                }),
            }),
            kinds: vec![],
        });
        let mut route = http_route("apps", "svc1", "gw1", vec![]);
        route.spec.parent_refs[0].namespace = Some("ns1".to_string());
        let route = accept_parents(route.into());

        let mut reader = FixtureReader::new().with_gateway(fixture::gateway("ns1", "gw1", vec![l]));
        assert!(listeners(&reader, &route).await.expect("should build").is_empty());

        reader.namespaces.insert(
            "apps".to_string(),
            Namespace {
                metadata: ObjectMeta {
                    name: Some("apps".to_string()),
                    labels: Some([("mesh".to_string(), "on".to_string())].into()),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        assert_eq!(listeners(&reader, &route).await.expect("should build").len(), 1);
    }

    #[tokio::test]
    async fn story_route_without_parents_builds_nothing() {
        let mut route = http_route("ns1", "svc1", "gw1", vec![]);
        route.spec.parent_refs.clear();
        let specs = listeners(&two_listener_gateway(), &route.into())
            .await
            .expect("should build");
        assert!(specs.is_empty());
    }
}
