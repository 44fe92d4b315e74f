//! Ownership and identity tags stamped on mesh resources
//!
//! The `ManagedBy` tag marks what this controller instance created. Every
//! other tag lets resources be found again from Kubernetes identity alone:
//! orphaned target groups by route, imported target groups by exporting
//! service, access log subscriptions by policy.

use lattice_common::annotations::{
    TAG_ACCESS_LOG_POLICY, TAG_CLUSTER_NAME, TAG_MANAGED_BY, TAG_PROTOCOL_VERSION,
    TAG_ROUTE_NAME, TAG_ROUTE_NAMESPACE, TAG_ROUTE_TYPE, TAG_SERVICE_NAME,
    TAG_SERVICE_NAMESPACE, TAG_SOURCE_TYPE,
};
use lattice_common::kube_utils::NamespacedName;
use lattice_common::ControllerConfig;
use lattice_model::resources::{RouteRef, ServiceSpec, TargetGroupOrigin, TargetGroupSpec};

use crate::api::Tags;

/// Tags every resource we create carries
pub fn managed(config: &ControllerConfig) -> Tags {
    Tags::from([(TAG_MANAGED_BY.to_string(), config.managed_by())])
}

/// Whether the tags mark a resource as ours
pub fn is_managed(tags: &Tags, config: &ControllerConfig) -> bool {
    owner(tags) == Some(config.managed_by().as_str())
}

/// Owner recorded on a resource, if any
pub fn owner(tags: &Tags) -> Option<&str> {
    tags.get(TAG_MANAGED_BY).map(String::as_str)
}

fn with_route(tags: &mut Tags, route: &RouteRef) {
    tags.insert(TAG_ROUTE_NAME.to_string(), route.name.clone());
    tags.insert(TAG_ROUTE_NAMESPACE.to_string(), route.namespace.clone());
    tags.insert(TAG_ROUTE_TYPE.to_string(), route.kind.as_str().to_string());
}

/// Tags of a mesh service; user tags never shadow ours
pub fn service(config: &ControllerConfig, spec: &ServiceSpec) -> Tags {
    let mut tags = spec.additional_tags.clone();
    tags.extend(managed(config));
    with_route(&mut tags, &spec.route);
    tags
}

/// Tags of a listener or rule of a route's service
pub fn route_child(config: &ControllerConfig, route: &RouteRef) -> Tags {
    let mut tags = managed(config);
    with_route(&mut tags, route);
    tags
}

/// Tags of a target group we own
pub fn target_group(config: &ControllerConfig, spec: &TargetGroupSpec) -> Tags {
    let mut tags = managed(config);
    tags.insert(TAG_CLUSTER_NAME.to_string(), spec.cluster_name.clone());
    tags.insert(TAG_SERVICE_NAME.to_string(), spec.service.name.clone());
    tags.insert(TAG_SERVICE_NAMESPACE.to_string(), spec.service.namespace.clone());
    tags.insert(TAG_SOURCE_TYPE.to_string(), spec.owner().as_str().to_string());
    tags.insert(
        TAG_PROTOCOL_VERSION.to_string(),
        spec.protocol_version.as_str().to_string(),
    );
    if let Some(route) = &spec.route {
        with_route(&mut tags, route);
    }
    tags
}

/// Whether a target group was created for a backend reference of the route
pub fn is_route_target_group(tags: &Tags, route: &RouteRef) -> bool {
    tags.get(TAG_SOURCE_TYPE).map(String::as_str) == Some(TargetGroupOrigin::BackendRef.as_str())
        && tags.get(TAG_ROUTE_NAME) == Some(&route.name)
        && tags.get(TAG_ROUTE_NAMESPACE) == Some(&route.namespace)
        && tags.get(TAG_ROUTE_TYPE).map(String::as_str) == Some(route.kind.as_str())
}

/// Whether a target group was created for the export of a service
pub fn is_export_target_group(tags: &Tags, service: &NamespacedName) -> bool {
    tags.get(TAG_SOURCE_TYPE).map(String::as_str)
        == Some(TargetGroupOrigin::ServiceExport.as_str())
        && tags.get(TAG_SERVICE_NAME) == Some(&service.name)
        && tags.get(TAG_SERVICE_NAMESPACE) == Some(&service.namespace)
}

/// Whether a target group is the export another cluster made for an import
pub fn is_exported_by(tags: &Tags, service: &NamespacedName, cluster_name: &str) -> bool {
    is_export_target_group(tags, service)
        && tags.get(TAG_CLUSTER_NAME).map(String::as_str) == Some(cluster_name)
}

/// Tags of an access log subscription
pub fn access_log(config: &ControllerConfig, policy: &NamespacedName) -> Tags {
    let mut tags = managed(config);
    tags.insert(TAG_ACCESS_LOG_POLICY.to_string(), policy.to_string());
    tags
}

/// Whether a subscription belongs to the policy
pub fn is_policy_subscription(tags: &Tags, policy: &NamespacedName) -> bool {
    tags.get(TAG_ACCESS_LOG_POLICY) == Some(&policy.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_model::fixture;
    use lattice_model::route::RouteKind;

    fn route() -> RouteRef {
        RouteRef {
            name: "svc1".to_string(),
            namespace: "ns1".to_string(),
            kind: RouteKind::Http,
        }
    }

    #[test]
    fn user_tags_never_shadow_ownership() {
        let config = fixture::config();
        let spec = ServiceSpec {
            route: route(),
            custom_domain_name: None,
            certificate_arn: None,
            service_network_names: Vec::new(),
            name_override: None,
            allow_takeover_from: None,
            additional_tags: Tags::from([
                ("team".to_string(), "payments".to_string()),
                (TAG_MANAGED_BY.to_string(), "someone-else".to_string()),
            ]),
            auth_policy: None,
            is_deleted: false,
        };
        let tags = service(&config, &spec);
        assert!(is_managed(&tags, &config));
        assert_eq!(tags.get("team").map(String::as_str), Some("payments"));
        assert_eq!(tags.get(TAG_ROUTE_TYPE).map(String::as_str), Some("HTTPRoute"));
    }

    #[test]
    fn route_children_are_recognised_by_route() {
        let config = fixture::config();
        let mut tags = route_child(&config, &route());
        tags.insert(
            TAG_SOURCE_TYPE.to_string(),
            TargetGroupOrigin::BackendRef.as_str().to_string(),
        );
        assert!(is_route_target_group(&tags, &route()));

        let other = RouteRef {
            kind: RouteKind::Grpc,
            ..route()
        };
        assert!(!is_route_target_group(&tags, &other));
    }

    #[test]
    fn foreign_owner_is_not_managed() {
        let config = fixture::config();
        let tags = Tags::from([(TAG_MANAGED_BY.to_string(), "999/other/vpc-9".to_string())]);
        assert!(!is_managed(&tags, &config));
        assert_eq!(owner(&tags), Some("999/other/vpc-9"));
        assert!(!is_managed(&Tags::new(), &config));
    }
}
