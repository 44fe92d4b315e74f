//! Rule builder: one mesh rule per route match block

use lattice_common::crd::{BackendRef, GrpcRouteMatch, HeaderMatch, HttpRouteMatch};
use lattice_common::{Error, Result};
use tracing::warn;

use super::target_group::TargetGroupBuilder;
use super::BuildContext;
use crate::resources::{
    HeaderCondition, PathMatch, RuleAction, RuleConditions, RuleSpec, TargetGroupRef,
    WeightedTargetGroup, MAX_HEADER_MATCHES,
};
use crate::route::{Route, RouteMatch};
use crate::stack::{ResourceId, ResourceKind, Stack};

const HTTP_METHODS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "DELETE", "CONNECT", "OPTIONS", "TRACE", "PATCH",
];

const MATCH_TYPE_EXACT: &str = "Exact";
const MATCH_TYPE_PATH_PREFIX: &str = "PathPrefix";

/// Builds the rules of one non-passthrough listener
pub(crate) struct RuleBuilder<'a> {
    ctx: BuildContext<'a>,
}

impl<'a> RuleBuilder<'a> {
    pub(crate) fn new(ctx: BuildContext<'a>) -> Self {
        Self { ctx }
    }

    /// Add one rule per match block of the route under `listener`.
    ///
    /// Ordinals run across the whole route so rule order survives into
    /// priority allocation.
    pub(crate) async fn build(
        &self,
        stack: &mut Stack,
        route: &Route,
        listener: &ResourceId,
    ) -> Result<()> {
        let resource = route.id().to_string();
        let mut ordinal = 0;

        for (rule_index, rule) in route.rules().iter().enumerate() {
            let action = self.build_action(stack, route, &rule.backend_refs).await;

            let conditions: Vec<RuleConditions> = if rule.matches.is_empty() {
                vec![RuleConditions::default()]
            } else {
                rule.matches
                    .iter()
                    .enumerate()
                    .map(|(match_index, m)| {
                        rule_conditions(m).map_err(|message| {
                            Error::validation_for_field(
                                resource.clone(),
                                format!("spec.rules[{rule_index}].matches[{match_index}]"),
                                message,
                            )
                        })
                    })
                    .collect::<Result<_>>()?
            };

            for conditions in conditions {
                let spec = RuleSpec {
                    listener: listener.clone(),
                    ordinal,
                    conditions,
                    action: action.clone(),
                };
                let id = ResourceId::derive(
                    ResourceKind::Rule,
                    &[listener.as_str(), &ordinal.to_string()],
                );
                stack.add(id, spec)?;
                ordinal += 1;
            }
        }
        Ok(())
    }

    /// Weighted forward action for a set of backend references.
    ///
    /// Never fails: a backend that cannot be built becomes an invalid
    /// placeholder carrying its declared weight.
    pub(crate) async fn build_action(
        &self,
        stack: &mut Stack,
        route: &Route,
        backend_refs: &[BackendRef],
    ) -> RuleAction {
        let target_groups = TargetGroupBuilder::new(self.ctx);
        let mut weighted = Vec::with_capacity(backend_refs.len());

        for backend_ref in backend_refs {
            let target = match target_groups
                .build_for_backend(stack, route, backend_ref)
                .await
            {
                Ok(id) => TargetGroupRef::Stack(id),
                Err(e) => {
                    warn!(
                        route = %route.id(),
                        backend = %backend_ref.name,
                        error = %e,
                        "backend reference failed to build, routing no traffic to it"
                    );
                    TargetGroupRef::Invalid
                }
            };
            weighted.push(WeightedTargetGroup {
                target,
                weight: backend_ref.weight(),
            });
        }

        RuleAction {
            target_groups: weighted,
        }
    }
}

/// Translate one route match block into mesh rule conditions.
///
/// Returns a message describing the first unsupported construct.
pub fn rule_conditions(route_match: &RouteMatch) -> std::result::Result<RuleConditions, String> {
    match route_match {
        RouteMatch::Http(m) => http_conditions(m),
        RouteMatch::Grpc(m) => grpc_conditions(m),
    }
}

fn http_conditions(m: &HttpRouteMatch) -> std::result::Result<RuleConditions, String> {
    if !m.query_params.is_empty() {
        return Err("query parameter matches are not supported".to_string());
    }

    let path = match &m.path {
        None => PathMatch::default(),
        Some(path) => {
            let value = path.value.clone().unwrap_or_else(|| "/".to_string());
            match path.type_.as_deref().unwrap_or(MATCH_TYPE_PATH_PREFIX) {
                MATCH_TYPE_EXACT => PathMatch::Exact(value),
                MATCH_TYPE_PATH_PREFIX => PathMatch::Prefix(value),
                other => return Err(format!("path match type {other} is not supported")),
            }
        }
    };

    let method = match &m.method {
        Some(method) => {
            let upper = method.to_ascii_uppercase();
            if !HTTP_METHODS.contains(&upper.as_str()) {
                return Err(format!("unknown HTTP method {method:?}"));
            }
            Some(upper)
        }
        None => None,
    };

    Ok(RuleConditions {
        path,
        method,
        headers: header_conditions(&m.headers)?,
    })
}

fn grpc_conditions(m: &GrpcRouteMatch) -> std::result::Result<RuleConditions, String> {
    let path = match &m.method {
        None => PathMatch::default(),
        Some(method) => {
            let match_type = method.type_.as_deref().unwrap_or(MATCH_TYPE_EXACT);
            if match_type != MATCH_TYPE_EXACT {
                return Err(format!("gRPC method match type {match_type} is not supported"));
            }
            match (method.service.as_deref(), method.method.as_deref()) {
                (Some(service), Some(name)) => PathMatch::Exact(format!("/{service}/{name}")),
                (Some(service), None) => PathMatch::Prefix(format!("/{service}/")),
                (None, Some(_)) => {
                    return Err("gRPC method match requires a service".to_string());
                }
                (None, None) => PathMatch::default(),
            }
        }
    };

    Ok(RuleConditions {
        path,
        method: Some("POST".to_string()),
        headers: header_conditions(&m.headers)?,
    })
}

fn header_conditions(headers: &[HeaderMatch]) -> std::result::Result<Vec<HeaderCondition>, String> {
    if headers.len() > MAX_HEADER_MATCHES {
        return Err(format!(
            "at most {MAX_HEADER_MATCHES} header matches are supported, found {}",
            headers.len()
        ));
    }

    let mut conditions: Vec<HeaderCondition> = Vec::with_capacity(headers.len());
    for header in headers {
        let match_type = header.type_.as_deref().unwrap_or(MATCH_TYPE_EXACT);
        if match_type != MATCH_TYPE_EXACT {
            return Err(format!("header match type {match_type} is not supported"));
        }
        let name = header.name.to_ascii_lowercase();
        if conditions.iter().any(|c| c.name == name) {
            continue;
        }
        conditions.push(HeaderCondition {
            name,
            value: header.value.clone(),
        });
    }
    Ok(conditions)
}
