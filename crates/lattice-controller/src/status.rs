//! Status conditions written back to watched objects
//!
//! Route status is computed per parent before the model is built, so the
//! listener builder sees acceptance decided in the same pass. Conditions keep
//! their transition time while their status is unchanged, which makes a
//! recomputed status compare equal and lets callers skip no-op patches.

use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::ResourceExt;
use lattice_common::crd::{
    BackendRef, Gateway, ParentReference, RouteParentStatus, RouteStatus, CONDITION_ACCEPTED,
    CONDITION_RESOLVED_REFS,
};
use lattice_common::{ControllerConfig, Result};
use lattice_model::gateway::{
    compatible_protocol, controlled_gateway, listener_matches_parent, route_allowed,
};
use lattice_model::route::is_gateway_parent;
use lattice_model::{ClusterReader, Route};
use tracing::debug;

/// Gateway condition: the service network is live
pub const CONDITION_PROGRAMMED: &str = "Programmed";
/// ServiceExport condition: the export was published to the mesh
pub const CONDITION_EXPORTED: &str = "Exported";

/// Condition reasons
pub mod reasons {
    /// Parent accepted the route / object accepted
    pub const ACCEPTED: &str = "Accepted";
    /// No listener section matches the parent's section name or port
    pub const NO_MATCHING_PARENT: &str = "NoMatchingParent";
    /// Sections matched but none admits the route kind or namespace
    pub const NOT_ALLOWED_BY_LISTENERS: &str = "NotAllowedByListeners";
    /// Every backend reference resolved
    pub const RESOLVED_REFS: &str = "ResolvedRefs";
    /// A backend reference names a missing object
    pub const BACKEND_NOT_FOUND: &str = "BackendNotFound";
    /// A backend reference has an unsupported kind
    pub const INVALID_KIND: &str = "InvalidKind";
    /// Mesh resources were deployed
    pub const PROGRAMMED: &str = "Programmed";
    /// The object's spec is invalid
    pub const INVALID: &str = "Invalid";
    /// The route uses a match, filter or shape the mesh cannot express
    pub const UNSUPPORTED_VALUE: &str = "UnsupportedValue";
    /// The object's target does not exist
    pub const TARGET_NOT_FOUND: &str = "TargetNotFound";
    /// Deploying to the mesh failed
    pub const DEPLOY_FAILED: &str = "DeployFailed";
}

/// Build a condition stamped with the current time
pub fn condition(
    type_: &str,
    ok: bool,
    reason: &str,
    message: impl Into<String>,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: if ok { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: message.into(),
        last_transition_time: Time(Utc::now()),
        observed_generation,
    }
}

/// Insert or replace a condition of the same type.
///
/// The previous transition time is kept when the status did not flip.
pub fn set_condition(conditions: &mut Vec<Condition>, mut new: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) => {
            if existing.status == new.status {
                new.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = new;
        }
        None => conditions.push(new),
    }
}

/// Route status computed for one reconcile pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RouteStatusReport {
    /// Status to write; parents owned by other controllers are preserved
    pub status: RouteStatus,
    /// Backend references that did not resolve, as namespace/name
    pub unresolved_backends: Vec<String>,
}

impl RouteStatusReport {
    /// Mark every parent owned by `controller_name` as not accepted because
    /// the route cannot be built
    pub fn reject(&mut self, controller_name: &str, message: &str, generation: Option<i64>) {
        for parent in self
            .status
            .parents
            .iter_mut()
            .filter(|p| p.controller_name == controller_name)
        {
            set_condition(
                &mut parent.conditions,
                condition(
                    CONDITION_ACCEPTED,
                    false,
                    reasons::UNSUPPORTED_VALUE,
                    message,
                    generation,
                ),
            );
        }
    }
}

/// Compute `Accepted` and `ResolvedRefs` for every parent this controller owns
pub async fn route_status(
    reader: &dyn ClusterReader,
    config: &ControllerConfig,
    route: &Route,
) -> Result<RouteStatusReport> {
    let route_ns = route.namespace();
    let generation = route.generation();
    let previous = route.status().cloned().unwrap_or_default();
    let refs = resolve_backends(reader, route).await?;

    let mut parents: Vec<RouteParentStatus> = previous
        .parents
        .iter()
        .filter(|p| p.controller_name != config.controller_name)
        .cloned()
        .collect();

    for parent in route.parent_refs() {
        if !is_gateway_parent(parent) {
            continue;
        }
        let Some(gateway) = controlled_gateway(reader, config, parent, &route_ns).await? else {
            continue;
        };

        let (accepted, reason, message) = acceptance(reader, route, parent, &gateway).await?;
        let mut conditions = previous
            .parents
            .iter()
            .find(|p| p.controller_name == config.controller_name && &p.parent_ref == parent)
            .map(|p| p.conditions.clone())
            .unwrap_or_default();
        set_condition(
            &mut conditions,
            condition(CONDITION_ACCEPTED, accepted, reason, message, generation),
        );
        set_condition(
            &mut conditions,
            condition(
                CONDITION_RESOLVED_REFS,
                refs.reason == reasons::RESOLVED_REFS,
                refs.reason,
                refs.message.clone(),
                generation,
            ),
        );

        debug!(gateway = %parent.name, accepted, reason, "computed parent status");
        parents.push(RouteParentStatus {
            parent_ref: parent.clone(),
            controller_name: config.controller_name.clone(),
            conditions,
        });
    }

    Ok(RouteStatusReport {
        status: RouteStatus { parents },
        unresolved_backends: refs.unresolved,
    })
}

/// Whether the gateway accepts the route through this parent reference
async fn acceptance(
    reader: &dyn ClusterReader,
    route: &Route,
    parent: &ParentReference,
    gateway: &Gateway,
) -> Result<(bool, &'static str, String)> {
    let route_ns = route.namespace();
    let gateway_ns = gateway.namespace().unwrap_or_else(|| "default".to_string());
    let sections: Vec<_> = gateway
        .spec
        .listeners
        .iter()
        .filter(|l| listener_matches_parent(parent, l))
        .collect();
    if sections.is_empty() {
        return Ok((
            false,
            reasons::NO_MATCHING_PARENT,
            format!("no listener of {} matches the parent reference", gateway.name_any()),
        ));
    }

    let mut labels: Option<BTreeMap<String, String>> = None;
    for section in sections {
        if compatible_protocol(route.kind(), section).is_none() {
            continue;
        }
        if labels.is_none() {
            labels = Some(
                reader
                    .get_namespace(&route_ns)
                    .await?
                    .map(|ns| ns.labels().clone())
                    .unwrap_or_default(),
            );
        }
        let labels = labels.clone().unwrap_or_default();
        if route_allowed(section, route.kind(), &route_ns, &gateway_ns, &labels) {
            return Ok((
                true,
                reasons::ACCEPTED,
                format!("accepted by listener {}", section.name),
            ));
        }
    }

    Ok((
        false,
        reasons::NOT_ALLOWED_BY_LISTENERS,
        format!(
            "no listener of {} admits a {} from namespace {route_ns}",
            gateway.name_any(),
            route.kind()
        ),
    ))
}

struct ResolvedRefs {
    reason: &'static str,
    message: String,
    unresolved: Vec<String>,
}

async fn resolve_backends(reader: &dyn ClusterReader, route: &Route) -> Result<ResolvedRefs> {
    let route_ns = route.namespace();
    let mut reason = reasons::RESOLVED_REFS;
    let mut message = String::from("all backend references resolved");
    let mut unresolved = Vec::new();

    for backend in route.backend_refs() {
        let namespace = backend.resolve_namespace(&route_ns).to_string();
        let name = format!("{namespace}/{}", backend.name);
        match backend_exists(reader, &backend, &namespace).await? {
            Some(true) => {}
            Some(false) => {
                if reason == reasons::RESOLVED_REFS {
                    reason = reasons::BACKEND_NOT_FOUND;
                    message = format!("{} {name} not found", backend.kind());
                }
                unresolved.push(name);
            }
            None => {
                reason = reasons::INVALID_KIND;
                message = format!("unsupported backend kind {}", backend.kind());
                unresolved.push(name);
            }
        }
    }

    Ok(ResolvedRefs {
        reason,
        message,
        unresolved,
    })
}

/// `None` for kinds that can never resolve
async fn backend_exists(
    reader: &dyn ClusterReader,
    backend: &BackendRef,
    namespace: &str,
) -> Result<Option<bool>> {
    Ok(match backend.kind() {
        "Service" => Some(reader.get_service(namespace, &backend.name).await?.is_some()),
        "ServiceImport" => Some(
            reader
                .get_service_import(namespace, &backend.name)
                .await?
                .is_some(),
        ),
        _ => None,
    })
}
