//! Service builder: one mesh service per route

use std::collections::BTreeMap;

use kube::ResourceExt;
use lattice_common::annotations::{self, RESERVED_TAG_PREFIXES};
use lattice_common::crd::{
    Gateway, IAMAuthPolicy, ParentReference, GATEWAY_API_GROUP, TLS_MODE_TERMINATE,
};
use lattice_common::kube_utils::annotation;
use lattice_common::{Error, Result};
use tracing::{debug, warn};

use super::BuildContext;
use crate::gateway::{
    controlled_gateway, first_controlled_gateway, listener_matches_parent, parent_accepted,
    resolve_standalone,
};
use crate::policy::{find_policy, PolicyTarget};
use crate::resources::{default_service_name, RouteRef, ServiceSpec};
use crate::route::{Route, RouteKind};
use crate::stack::{ResourceId, ResourceKind, Stack};

/// Builds the [`ServiceSpec`] of a route
pub(crate) struct ServiceBuilder<'a> {
    ctx: BuildContext<'a>,
}

impl<'a> ServiceBuilder<'a> {
    pub(crate) fn new(ctx: BuildContext<'a>) -> Self {
        Self { ctx }
    }

    /// Build the route's service and add it to the stack.
    ///
    /// Runs unconditionally, including for deleted routes, which produce the
    /// same service with `is_deleted` set.
    pub(crate) async fn build(&self, stack: &mut Stack, route: &Route) -> Result<ResourceId> {
        let route_id = route.id().to_string();
        if route.kind() == RouteKind::Tls && route.hostnames().is_empty() {
            return Err(Error::validation_for_field(
                route_id,
                "spec.hostnames",
                "TLSRoute requires at least one hostname",
            ));
        }

        let parents = self.controlled_parents(route).await?;
        let first_gateway = parents.first().map(|(_, gw)| gw);
        let standalone = resolve_standalone(route, first_gateway)?;

        let service_network_names = if standalone {
            debug!(route = %route_id, "standalone mode, no service network association");
            Vec::new()
        } else if let Some(network) = self.ctx.config.override_service_network() {
            vec![network.to_string()]
        } else {
            let mut names: Vec<String> = Vec::new();
            for (parent, gateway) in &parents {
                let name = gateway.name_any();
                if parent_accepted(route, self.ctx.config, parent) && !names.contains(&name) {
                    names.push(name);
                }
            }
            names
        };

        let spec = ServiceSpec {
            route: RouteRef {
                name: route.name(),
                namespace: route.namespace(),
                kind: route.kind(),
            },
            custom_domain_name: route.hostnames().first().cloned(),
            certificate_arn: certificate_arn(&parents),
            service_network_names,
            name_override: service_name_override(route, first_gateway)?,
            allow_takeover_from: route
                .annotation(annotations::ALLOW_TAKEOVER_FROM)
                .map(str::to_string),
            additional_tags: parse_additional_tags(route)?,
            auth_policy: self.auth_policy(route).await?,
            is_deleted: route.is_deleted(),
        };

        let id = service_id(route);
        stack.add(id, spec)
    }

    async fn controlled_parents(&self, route: &Route) -> Result<Vec<(ParentReference, Gateway)>> {
        let namespace = route.namespace();
        let mut parents = Vec::new();
        for parent in route.parent_refs() {
            if let Some(gateway) =
                controlled_gateway(self.ctx.reader, self.ctx.config, parent, &namespace).await?
            {
                parents.push((parent.clone(), gateway));
            }
        }
        Ok(parents)
    }

    async fn auth_policy(&self, route: &Route) -> Result<Option<String>> {
        let target = PolicyTarget::new(
            GATEWAY_API_GROUP,
            route.kind().as_str(),
            route.namespace(),
            route.name(),
        );
        Ok(find_policy::<IAMAuthPolicy>(self.ctx.reader, &target)
            .await?
            .map(|policy| policy.spec.policy))
    }
}

/// Stack ID of the service built for a route
pub(crate) fn service_id(route: &Route) -> ResourceId {
    ResourceId::derive(
        ResourceKind::Service,
        &[route.kind().as_str(), &route.namespace(), &route.name()],
    )
}

/// Certificate ARN of the first terminating gateway listener matched by a parent
fn certificate_arn(parents: &[(ParentReference, Gateway)]) -> Option<String> {
    parents.iter().find_map(|(parent, gateway)| {
        gateway
            .spec
            .listeners
            .iter()
            .filter(|l| listener_matches_parent(parent, l))
            .filter_map(|l| l.tls.as_ref())
            .filter(|tls| tls.mode() == TLS_MODE_TERMINATE)
            .find_map(|tls| tls.options.get(annotations::CERTIFICATE_ARN).cloned())
    })
}

/// Mesh service name of a route, honoring overrides
pub async fn resolve_service_name(ctx: BuildContext<'_>, route: &Route) -> Result<String> {
    let gateway = first_controlled_gateway(ctx.reader, ctx.config, route).await?;
    Ok(service_name_override(route, gateway.as_ref())?
        .unwrap_or_else(|| default_service_name(&route.name(), &route.namespace())))
}

/// Service name override: route annotation, then gateway annotation
fn service_name_override(route: &Route, gateway: Option<&Gateway>) -> Result<Option<String>> {
    let value = route
        .annotation(annotations::SERVICE_NAME_OVERRIDE)
        .or_else(|| gateway.and_then(|gw| annotation(gw, annotations::LATTICE_SERVICE_NAME)));

    match value {
        Some(name) => {
            validate_service_name(name).map_err(|msg| {
                Error::validation_for_field(
                    route.id().to_string(),
                    format!("metadata.annotations[{}]", annotations::SERVICE_NAME_OVERRIDE),
                    msg,
                )
            })?;
            Ok(Some(name.to_string()))
        }
        None => Ok(None),
    }
}

/// Validate a mesh service name
fn validate_service_name(name: &str) -> std::result::Result<(), String> {
    if !(3..=40).contains(&name.len()) {
        return Err(format!("service name {name:?} must be 3-40 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(format!(
            "service name {name:?} may only contain lowercase letters, digits and hyphens"
        ));
    }
    if name.starts_with('-') || name.ends_with('-') || name.contains("--") {
        return Err(format!(
            "service name {name:?} must not start or end with a hyphen or contain consecutive hyphens"
        ));
    }
    if name.starts_with("svc-") {
        return Err(format!("service name {name:?} must not start with \"svc-\""));
    }
    Ok(())
}

/// Parse the additional tags annotation (`k1=v1,k2=v2`).
///
/// Keys with a reserved prefix are dropped; malformed pairs fail the build.
fn parse_additional_tags(route: &Route) -> Result<BTreeMap<String, String>> {
    let mut tags = BTreeMap::new();
    let Some(raw) = route.annotation(annotations::TAGS) else {
        return Ok(tags);
    };

    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .map(|(k, v)| (k.trim(), v.trim()))
            .filter(|(k, _)| !k.is_empty())
            .ok_or_else(|| {
                Error::validation_for_field(
                    route.id().to_string(),
                    format!("metadata.annotations[{}]", annotations::TAGS),
                    format!("malformed tag {pair:?}, expected key=value"),
                )
            })?;

        if RESERVED_TAG_PREFIXES.iter().any(|p| key.starts_with(p)) {
            warn!(route = %route.id(), tag = %key, "ignoring tag with reserved prefix");
            continue;
        }
        tags.insert(key.to_string(), value.to_string());
    }
    Ok(tags)
}
