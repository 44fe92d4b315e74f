//! Gateway lookups shared by the builders and the route status computation
//!
//! A gateway participates only when its GatewayClass names this controller.
//! Listener sections are matched against parent references by section name
//! and port, then filtered by protocol compatibility and allowed routes.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use lattice_common::annotations::{self, parse_bool};
use lattice_common::crd::{
    Gateway, GatewayListener, ParentReference, CONDITION_ACCEPTED, GATEWAY_API_GROUP,
    TLS_MODE_PASSTHROUGH,
};
use lattice_common::kube_utils::annotation;
use lattice_common::{ControllerConfig, Error, Result};

use crate::reader::ClusterReader;
use crate::resources::ListenerProtocol;
use crate::route::{is_gateway_parent, Route, RouteKind};

/// Fetch the gateway a parent reference points at, if this controller owns it
pub async fn controlled_gateway(
    reader: &dyn ClusterReader,
    config: &ControllerConfig,
    parent: &ParentReference,
    route_namespace: &str,
) -> Result<Option<Gateway>> {
    if !is_gateway_parent(parent) {
        return Ok(None);
    }
    let namespace = parent.resolve_namespace(route_namespace);
    let Some(gateway) = reader.get_gateway(namespace, &parent.name).await? else {
        return Ok(None);
    };
    if is_controlled(reader, config, &gateway).await? {
        Ok(Some(gateway))
    } else {
        Ok(None)
    }
}

/// Whether the gateway's class is implemented by this controller
pub async fn is_controlled(
    reader: &dyn ClusterReader,
    config: &ControllerConfig,
    gateway: &Gateway,
) -> Result<bool> {
    let class = reader
        .get_gateway_class(&gateway.spec.gateway_class_name)
        .await?;
    Ok(class.is_some_and(|c| c.spec.controller_name == config.controller_name))
}

/// First controlled gateway among the route's parent references
pub async fn first_controlled_gateway(
    reader: &dyn ClusterReader,
    config: &ControllerConfig,
    route: &Route,
) -> Result<Option<Gateway>> {
    let namespace = route.namespace();
    for parent in route.parent_refs() {
        if let Some(gateway) = controlled_gateway(reader, config, parent, &namespace).await? {
            return Ok(Some(gateway));
        }
    }
    Ok(None)
}

/// Whether a parent reference refers to the given gateway
pub fn parent_targets_gateway(
    parent: &ParentReference,
    route_namespace: &str,
    gateway: &Gateway,
) -> bool {
    is_gateway_parent(parent)
        && parent.name == gateway.name_any()
        && Some(parent.resolve_namespace(route_namespace).to_string()) == gateway.namespace()
}

/// Whether a listener section matches the parent's section name and port filters
pub fn listener_matches_parent(parent: &ParentReference, listener: &GatewayListener) -> bool {
    parent
        .section_name
        .as_deref()
        .is_none_or(|section| section == listener.name)
        && parent.port.is_none_or(|port| port == listener.port)
}

/// Mesh listener protocol for a route kind on a gateway listener, if compatible
pub fn compatible_protocol(
    kind: RouteKind,
    listener: &GatewayListener,
) -> Option<ListenerProtocol> {
    let protocol = listener.protocol.to_ascii_uppercase();
    match (kind, protocol.as_str()) {
        (RouteKind::Http, "HTTP") => Some(ListenerProtocol::Http),
        (RouteKind::Http, "HTTPS") => Some(ListenerProtocol::Https),
        (RouteKind::Grpc, "HTTPS") => Some(ListenerProtocol::Https),
        (RouteKind::Tls, "TLS")
            if listener
                .tls
                .as_ref()
                .is_some_and(|tls| tls.mode() == TLS_MODE_PASSTHROUGH) =>
        {
            Some(ListenerProtocol::TlsPassthrough)
        }
        _ => None,
    }
}

/// Whether a listener's allowed-routes policy admits the route.
///
/// `namespace_labels` are the labels of the route namespace; they are only
/// consulted for `from: Selector`.
pub fn route_allowed(
    listener: &GatewayListener,
    kind: RouteKind,
    route_namespace: &str,
    gateway_namespace: &str,
    namespace_labels: &BTreeMap<String, String>,
) -> bool {
    let Some(allowed) = listener.allowed_routes.as_ref() else {
        return route_namespace == gateway_namespace;
    };

    if !allowed.kinds.is_empty()
        && !allowed.kinds.iter().any(|k| {
            k.group.as_deref().unwrap_or(GATEWAY_API_GROUP) == GATEWAY_API_GROUP
                && k.kind == kind.as_str()
        })
    {
        return false;
    }

    let namespaces = allowed.namespaces.as_ref();
    match namespaces.and_then(|n| n.from.as_deref()).unwrap_or("Same") {
        "All" => true,
        "Selector" => namespaces
            .and_then(|n| n.selector.as_ref())
            .is_some_and(|selector| selector_matches(selector, namespace_labels)),
        _ => route_namespace == gateway_namespace,
    }
}

/// Evaluate a label selector against a label set
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let labels_match = selector
        .match_labels
        .as_ref()
        .is_none_or(|wanted| wanted.iter().all(|(k, v)| labels.get(k) == Some(v)));

    let expressions_match = selector.match_expressions.iter().flatten().all(|expr| {
        let value = labels.get(&expr.key);
        let values = expr.values.as_deref().unwrap_or_default();
        match expr.operator.as_str() {
            "In" => value.is_some_and(|v| values.contains(v)),
            "NotIn" => value.is_none_or(|v| !values.contains(v)),
            "Exists" => value.is_some(),
            "DoesNotExist" => value.is_none(),
            _ => false,
        }
    });

    labels_match && expressions_match
}

/// Whether the route status records the parent as accepted by this controller
pub fn parent_accepted(route: &Route, config: &ControllerConfig, parent: &ParentReference) -> bool {
    route.status().is_some_and(|status| {
        status.parents.iter().any(|ps| {
            ps.controller_name == config.controller_name
                && &ps.parent_ref == parent
                && ps
                    .conditions
                    .iter()
                    .any(|c| c.type_ == CONDITION_ACCEPTED && c.status == "True")
        })
    })
}

/// Resolve standalone mode: route annotation, then gateway annotation, then false.
///
/// An unparseable annotation is a validation error rather than a guess.
pub fn resolve_standalone(route: &Route, gateway: Option<&Gateway>) -> Result<bool> {
    if let Some(value) = route.annotation(annotations::STANDALONE) {
        return parse_bool(value).ok_or_else(|| {
            Error::validation_for_field(
                route.id().to_string(),
                format!("metadata.annotations[{}]", annotations::STANDALONE),
                format!("invalid standalone value {value:?}"),
            )
        });
    }
    if let Some(gateway) = gateway {
        if let Some(value) = annotation(gateway, annotations::STANDALONE) {
            return parse_bool(value).ok_or_else(|| {
                Error::validation_for_field(
                    format!(
                        "{}/{}",
                        gateway.namespace().unwrap_or_default(),
                        gateway.name_any()
                    ),
                    format!("metadata.annotations[{}]", annotations::STANDALONE),
                    format!("invalid standalone value {value:?}"),
                )
            });
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::MockClusterReader;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
        Condition, LabelSelectorRequirement, ObjectMeta, Time,
    };
    use lattice_common::crd::{
        AllowedRoutes, GatewayClass, GatewayClassSpec, GatewaySpec, GatewayTlsConfig,
        HTTPRoute, HttpRouteSpec, RouteGroupKind, RouteNamespaces, RouteParentStatus,
        RouteStatus,
    };

    fn listener(name: &str, port: i32, protocol: &str) -> GatewayListener {
        GatewayListener {
            name: name.to_string(),
            port,
            protocol: protocol.to_string(),
            ..Default::default()
        }
    }

    fn gateway(annotations: &[(&str, &str)]) -> Gateway {
        let mut gw = Gateway::new(
            "gw1",
            GatewaySpec {
                gateway_class_name: "lattice".to_string(),
                listeners: vec![listener("http", 80, "HTTP")],
            },
        );
        gw.metadata.namespace = Some("ns1".to_string());
        gw.metadata.annotations = Some(
            annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        gw
    }

    fn route(annotations: &[(&str, &str)]) -> Route {
        HTTPRoute {
            metadata: ObjectMeta {
                name: Some("svc1".to_string()),
                namespace: Some("ns1".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: HttpRouteSpec {
                parent_refs: vec![ParentReference {
                    name: "gw1".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            status: None,
        }
        .into()
    }

    // =========================================================================
    // Standalone precedence
    // =========================================================================

    #[test]
    fn story_route_annotation_wins_over_gateway() {
        let gw = gateway(&[(annotations::STANDALONE, "true")]);
        let r = route(&[(annotations::STANDALONE, "false")]);
        assert!(!resolve_standalone(&r, Some(&gw)).expect("should resolve"));

        let r = route(&[(annotations::STANDALONE, "true")]);
        let gw = gateway(&[(annotations::STANDALONE, "false")]);
        assert!(resolve_standalone(&r, Some(&gw)).expect("should resolve"));
    }

    #[test]
    fn story_gateway_annotation_applies_when_route_is_silent() {
        let gw = gateway(&[(annotations::STANDALONE, "true")]);
        assert!(resolve_standalone(&route(&[]), Some(&gw)).expect("should resolve"));
    }

    #[test]
    fn story_standalone_defaults_to_false() {
        assert!(!resolve_standalone(&route(&[]), Some(&gateway(&[]))).expect("should resolve"));
        assert!(!resolve_standalone(&route(&[]), None).expect("should resolve"));
    }

    #[test]
    fn story_invalid_standalone_value_fails_closed() {
        let err = resolve_standalone(&route(&[(annotations::STANDALONE, "maybe")]), None)
            .expect_err("invalid value should fail");
        assert!(err.is_validation());
    }

    // =========================================================================
    // Listener matching
    // =========================================================================

    #[test]
    fn section_and_port_filters() {
        let l = listener("http", 80, "HTTP");
        let mut parent = ParentReference {
            name: "gw1".to_string(),
            ..Default::default()
        };
        assert!(listener_matches_parent(&parent, &l));

        parent.section_name = Some("https".to_string());
        assert!(!listener_matches_parent(&parent, &l));

        parent.section_name = None;
        parent.port = Some(8080);
        assert!(!listener_matches_parent(&parent, &l));
    }

    #[test]
    fn protocol_compatibility_by_route_kind() {
        assert_eq!(
            compatible_protocol(RouteKind::Http, &listener("l", 80, "HTTP")),
            Some(ListenerProtocol::Http)
        );
        assert_eq!(compatible_protocol(RouteKind::Grpc, &listener("l", 80, "HTTP")), None);
        assert_eq!(
            compatible_protocol(RouteKind::Grpc, &listener("l", 443, "HTTPS")),
            Some(ListenerProtocol::Https)
        );

        let mut tls = listener("tls", 443, "TLS");
        assert_eq!(compatible_protocol(RouteKind::Tls, &tls), None);
        tls.tls = Some(GatewayTlsConfig {
            mode: Some("Passthrough".to_string()),
            ..Default::default()
        });
        assert_eq!(
            compatible_protocol(RouteKind::Tls, &tls),
            Some(ListenerProtocol::TlsPassthrough)
        );
        assert_eq!(compatible_protocol(RouteKind::Http, &tls), None);
    }

    #[test]
    fn allowed_routes_namespaces() {
        let mut l = listener("http", 80, "HTTP");
        let labels = BTreeMap::from([("team".to_string(), "a".to_string())]);

        assert!(route_allowed(&l, RouteKind::Http, "ns1", "ns1", &labels));
        assert!(!route_allowed(&l, RouteKind::Http, "ns2", "ns1", &labels));

        l.allowed_routes = Some(AllowedRoutes {
            namespaces: Some(RouteNamespaces {
                from: Some("All".to_string()),
                selector: None,
            }),
            kinds: vec![],
        });
        assert!(route_allowed(&l, RouteKind::Http, "ns2", "ns1", &labels));

        l.allowed_routes = Some(AllowedRoutes {
            namespaces: Some(RouteNamespaces {
                from: Some("Selector".to_string()),
                selector: Some(LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                }),
            }),
            kinds: vec![RouteGroupKind {
                group: None,
                kind: "HTTPRoute".to_string(),
            }],
        });
        assert!(route_allowed(&l, RouteKind::Http, "ns2", "ns1", &labels));
        assert!(!route_allowed(&l, RouteKind::Http, "ns2", "ns1", &BTreeMap::new()));
        assert!(!route_allowed(&l, RouteKind::Grpc, "ns2", "ns1", &labels));
    }

    #[test]
    fn selector_expressions() {
        let labels = BTreeMap::from([("env".to_string(), "prod".to_string())]);
        let selector = |op: &str, values: Option<Vec<&str>>| LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "env".to_string(),
                operator: op.to_string(),
                values: values.map(|v| v.into_iter().map(str::to_string).collect()),
            }]),
        };
        assert!(selector_matches(&selector("In", Some(vec!["prod"])), &labels));
        assert!(!selector_matches(&selector("NotIn", Some(vec!["prod"])), &labels));
        assert!(selector_matches(&selector("Exists", None), &labels));
        assert!(!selector_matches(&selector("DoesNotExist", None), &labels));
    }

    // =========================================================================
    // Acceptance and ownership
    // =========================================================================

    #[test]
    fn acceptance_is_read_from_status() {
        let config = ControllerConfig::new("prod", "vpc-1");
        let mut r = route(&[]);
        let parent = r.parent_refs()[0].clone();
        assert!(!parent_accepted(&r, &config, &parent));

        *r.status_mut() = RouteStatus {
            parents: vec![RouteParentStatus {
                parent_ref: parent.clone(),
                controller_name: config.controller_name.clone(),
                conditions: vec![Condition {
                    type_: CONDITION_ACCEPTED.to_string(),
                    status: "True".to_string(),
                    reason: "Accepted".to_string(),
                    message: String::new(),
                    last_transition_time: Time(chrono::Utc::now()),
                    observed_generation: None,
                }],
            }],
        };
        assert!(parent_accepted(&r, &config, &parent));
    }

    #[tokio::test]
    async fn gateways_of_other_controllers_are_ignored() {
        let config = ControllerConfig::new("prod", "vpc-1");
        let mut reader = MockClusterReader::new();
        reader
            .expect_get_gateway()
            .returning(|_, _| Ok(Some(gateway(&[]))));
        reader.expect_get_gateway_class().returning(|_| {
            Ok(Some(GatewayClass::new(
                "lattice",
                GatewayClassSpec {
                    controller_name: "example.com/other".to_string(),
                    description: None,
                },
            )))
        });

        let found = first_controlled_gateway(&reader, &config, &route(&[]))
            .await
            .expect("lookup should succeed");
        assert!(found.is_none());
    }
}
