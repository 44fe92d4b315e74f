//! Kind-polymorphic route abstraction
//!
//! HTTPRoute, GRPCRoute and TLSRoute share parents, hostnames, backend refs
//! and status. The builders only ever see a [`Route`], so every kind flows
//! through one pipeline.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use lattice_common::crd::{
    BackendRef, GrpcRouteMatch, HttpRouteMatch, ParentReference, RouteStatus, GRPCRoute,
    HTTPRoute, TLSRoute, GATEWAY_API_GROUP,
};
use lattice_common::kube_utils::{is_being_deleted, NamespacedName};

/// Supported route kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RouteKind {
    /// HTTPRoute
    Http,
    /// GRPCRoute
    Grpc,
    /// TLSRoute
    Tls,
}

impl RouteKind {
    /// Every supported kind
    pub const ALL: [RouteKind; 3] = [RouteKind::Http, RouteKind::Grpc, RouteKind::Tls];

    /// Kubernetes kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteKind::Http => "HTTPRoute",
            RouteKind::Grpc => "GRPCRoute",
            RouteKind::Tls => "TLSRoute",
        }
    }

    /// Parse a Kubernetes kind name
    pub fn from_kind(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }
}

impl fmt::Display for RouteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific request match
#[derive(Clone, Debug, PartialEq)]
pub enum RouteMatch {
    /// HTTPRoute match
    Http(HttpRouteMatch),
    /// GRPCRoute match
    Grpc(GrpcRouteMatch),
}

/// Route rule normalized across kinds
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RouteRule {
    /// Request matches; empty matches everything
    pub matches: Vec<RouteMatch>,
    /// Backend references
    pub backend_refs: Vec<BackendRef>,
}

/// A Gateway API route of any supported kind
#[derive(Clone, Debug)]
pub enum Route {
    /// HTTPRoute
    Http(HTTPRoute),
    /// GRPCRoute
    Grpc(GRPCRoute),
    /// TLSRoute
    Tls(TLSRoute),
}

impl From<HTTPRoute> for Route {
    fn from(route: HTTPRoute) -> Self {
        Route::Http(route)
    }
}

impl From<GRPCRoute> for Route {
    fn from(route: GRPCRoute) -> Self {
        Route::Grpc(route)
    }
}

impl From<TLSRoute> for Route {
    fn from(route: TLSRoute) -> Self {
        Route::Tls(route)
    }
}

macro_rules! each_route {
    ($route:expr, $r:ident => $body:expr) => {
        match $route {
            Route::Http($r) => $body,
            Route::Grpc($r) => $body,
            Route::Tls($r) => $body,
        }
    };
}

impl Route {
    /// Route kind
    pub fn kind(&self) -> RouteKind {
        match self {
            Route::Http(_) => RouteKind::Http,
            Route::Grpc(_) => RouteKind::Grpc,
            Route::Tls(_) => RouteKind::Tls,
        }
    }

    /// Route name
    pub fn name(&self) -> String {
        each_route!(self, r => r.name_any())
    }

    /// Route namespace ("default" when unset)
    pub fn namespace(&self) -> String {
        each_route!(self, r => r.namespace().unwrap_or_else(|| "default".to_string()))
    }

    /// Namespace/name of the route
    pub fn id(&self) -> NamespacedName {
        NamespacedName::new(self.namespace(), self.name())
    }

    /// Route annotations
    pub fn annotations(&self) -> &BTreeMap<String, String> {
        each_route!(self, r => r.annotations())
    }

    /// Read a single annotation
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations().get(key).map(String::as_str)
    }

    /// Whether the route carries a deletion timestamp
    pub fn is_deleted(&self) -> bool {
        each_route!(self, r => is_being_deleted(r))
    }

    /// Generation of the route spec
    pub fn generation(&self) -> Option<i64> {
        each_route!(self, r => r.meta().generation)
    }

    /// The same route marked for teardown.
    ///
    /// Used when a route still carries the controller's finalizer but no
    /// longer names a controlled gateway: its mesh resources are built and
    /// deployed exactly as if the route had been deleted.
    pub fn detached(mut self) -> Self {
        let meta = each_route!(&mut self, r => r.meta_mut());
        if meta.deletion_timestamp.is_none() {
            meta.deletion_timestamp = Some(Time(Utc::now()));
        }
        self
    }

    /// Finalizers currently on the route
    pub fn finalizers(&self) -> &[String] {
        each_route!(self, r => r.finalizers())
    }

    /// Parent gateway references
    pub fn parent_refs(&self) -> &[ParentReference] {
        each_route!(self, r => &r.spec.parent_refs)
    }

    /// Hostnames
    pub fn hostnames(&self) -> &[String] {
        each_route!(self, r => &r.spec.hostnames)
    }

    /// Rules normalized across kinds
    pub fn rules(&self) -> Vec<RouteRule> {
        match self {
            Route::Http(r) => r
                .spec
                .rules
                .iter()
                .map(|rule| RouteRule {
                    matches: rule.matches.iter().cloned().map(RouteMatch::Http).collect(),
                    backend_refs: rule.backend_refs.clone(),
                })
                .collect(),
            Route::Grpc(r) => r
                .spec
                .rules
                .iter()
                .map(|rule| RouteRule {
                    matches: rule.matches.iter().cloned().map(RouteMatch::Grpc).collect(),
                    backend_refs: rule.backend_refs.clone(),
                })
                .collect(),
            Route::Tls(r) => r
                .spec
                .rules
                .iter()
                .map(|rule| RouteRule {
                    matches: Vec::new(),
                    backend_refs: rule.backend_refs.clone(),
                })
                .collect(),
        }
    }

    /// Every backend reference across all rules
    pub fn backend_refs(&self) -> Vec<BackendRef> {
        self.rules()
            .into_iter()
            .flat_map(|rule| rule.backend_refs)
            .collect()
    }

    /// Route status, if any
    pub fn status(&self) -> Option<&RouteStatus> {
        each_route!(self, r => r.status.as_ref())
    }

    /// Mutable route status, created empty when absent
    pub fn status_mut(&mut self) -> &mut RouteStatus {
        each_route!(self, r => r.status.get_or_insert_with(RouteStatus::default))
    }

    /// Object reference for event publishing
    pub fn object_ref(&self) -> ObjectReference {
        each_route!(self, r => r.object_ref(&()))
    }

    /// Whether the route's parent ref targets the given gateway
    pub fn references_gateway(&self, gateway: &NamespacedName) -> bool {
        let namespace = self.namespace();
        self.parent_refs().iter().any(|parent| {
            is_gateway_parent(parent)
                && parent.name == gateway.name
                && parent.resolve_namespace(&namespace) == gateway.namespace
        })
    }
}

/// Whether a parent reference points at a Gateway (group/kind defaults apply)
pub fn is_gateway_parent(parent: &ParentReference) -> bool {
    parent.group.as_deref().unwrap_or(GATEWAY_API_GROUP) == GATEWAY_API_GROUP
        && parent.kind.as_deref().unwrap_or("Gateway") == "Gateway"
}
