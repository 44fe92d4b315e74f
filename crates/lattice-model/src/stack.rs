//! Resource graph produced by one reconciliation pass
//!
//! A [`Stack`] owns every resource built from one triggering object. Resource
//! IDs are deterministic functions of domain identity, so repeated builds of
//! the same cluster state produce identical stacks and synthesis can match
//! them to the same cloud resources.

use std::collections::HashMap;
use std::fmt;

use lattice_common::kube_utils::{deterministic_hash, NamespacedName};
use lattice_common::{Error, Result};

use crate::resources::{
    AccessLogSubscriptionSpec, ListenerSpec, RuleSpec, ServiceNetworkSpec, ServiceSpec,
    TargetGroupSpec, TargetsSpec,
};

/// Identity of a stack: the triggering object's namespace/name
pub type StackId = NamespacedName;

/// Kinds of resources a stack can hold, in deploy order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// Service network (gateway)
    ServiceNetwork,
    /// Target group
    TargetGroup,
    /// Targets registered in one target group
    Targets,
    /// Mesh service (route)
    Service,
    /// Listener on a service
    Listener,
    /// Rule on a listener
    Rule,
    /// Access log subscription
    AccessLogSubscription,
}

impl ResourceKind {
    /// Short prefix used in resource IDs
    pub fn prefix(&self) -> &'static str {
        match self {
            ResourceKind::ServiceNetwork => "sn",
            ResourceKind::TargetGroup => "tg",
            ResourceKind::Targets => "targets",
            ResourceKind::Service => "svc",
            ResourceKind::Listener => "listener",
            ResourceKind::Rule => "rule",
            ResourceKind::AccessLogSubscription => "als",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Stack-local resource identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(String);

impl ResourceId {
    /// Derive an ID from the domain identity parts of a resource
    pub fn derive(kind: ResourceKind, parts: &[&str]) -> Self {
        Self(format!(
            "{}-{}",
            kind.prefix(),
            deterministic_hash(&parts.join("/"))
        ))
    }

    /// The ID as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A typed resource inside a stack
#[derive(Clone, Debug, PartialEq)]
pub struct Resource<S> {
    /// Owning stack
    pub stack: StackId,
    /// Stack-local ID
    pub id: ResourceId,
    /// Kind-specific spec
    pub spec: S,
}

/// Any resource held by a stack
#[derive(Clone, Debug, PartialEq)]
pub enum AnyResource {
    /// Service network
    ServiceNetwork(Resource<ServiceNetworkSpec>),
    /// Target group
    TargetGroup(Resource<TargetGroupSpec>),
    /// Targets
    Targets(Resource<TargetsSpec>),
    /// Service
    Service(Resource<ServiceSpec>),
    /// Listener
    Listener(Resource<ListenerSpec>),
    /// Rule
    Rule(Resource<RuleSpec>),
    /// Access log subscription
    AccessLogSubscription(Resource<AccessLogSubscriptionSpec>),
}

impl AnyResource {
    /// Kind of the wrapped resource
    pub fn kind(&self) -> ResourceKind {
        match self {
            AnyResource::ServiceNetwork(_) => ResourceKind::ServiceNetwork,
            AnyResource::TargetGroup(_) => ResourceKind::TargetGroup,
            AnyResource::Targets(_) => ResourceKind::Targets,
            AnyResource::Service(_) => ResourceKind::Service,
            AnyResource::Listener(_) => ResourceKind::Listener,
            AnyResource::Rule(_) => ResourceKind::Rule,
            AnyResource::AccessLogSubscription(_) => ResourceKind::AccessLogSubscription,
        }
    }

    /// ID of the wrapped resource
    pub fn id(&self) -> &ResourceId {
        match self {
            AnyResource::ServiceNetwork(r) => &r.id,
            AnyResource::TargetGroup(r) => &r.id,
            AnyResource::Targets(r) => &r.id,
            AnyResource::Service(r) => &r.id,
            AnyResource::Listener(r) => &r.id,
            AnyResource::Rule(r) => &r.id,
            AnyResource::AccessLogSubscription(r) => &r.id,
        }
    }
}

/// A spec type that can live in a stack
pub trait ResourceSpec: Clone + fmt::Debug + PartialEq + Sized {
    /// Resource kind of this spec
    const KIND: ResourceKind;

    /// Wrap a typed resource
    fn wrap(resource: Resource<Self>) -> AnyResource;

    /// Borrow the typed resource if the kind matches
    fn unwrap(any: &AnyResource) -> Option<&Resource<Self>>;
}

macro_rules! impl_resource_spec {
    ($spec:ty, $variant:ident) => {
        impl ResourceSpec for $spec {
            const KIND: ResourceKind = ResourceKind::$variant;

            fn wrap(resource: Resource<Self>) -> AnyResource {
                AnyResource::$variant(resource)
            }

            fn unwrap(any: &AnyResource) -> Option<&Resource<Self>> {
                match any {
                    AnyResource::$variant(r) => Some(r),
                    _ => None,
                }
            }
        }
    };
}

impl_resource_spec!(ServiceNetworkSpec, ServiceNetwork);
impl_resource_spec!(TargetGroupSpec, TargetGroup);
impl_resource_spec!(TargetsSpec, Targets);
impl_resource_spec!(ServiceSpec, Service);
impl_resource_spec!(ListenerSpec, Listener);
impl_resource_spec!(RuleSpec, Rule);
impl_resource_spec!(AccessLogSubscriptionSpec, AccessLogSubscription);

/// All resources produced by one reconciliation pass
#[derive(Clone, Debug, PartialEq)]
pub struct Stack {
    id: StackId,
    resources: Vec<AnyResource>,
    index: HashMap<ResourceId, usize>,
}

impl Stack {
    /// Create an empty stack
    pub fn new(id: StackId) -> Self {
        Self {
            id,
            resources: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Stack identity
    pub fn id(&self) -> &StackId {
        &self.id
    }

    /// Add a resource under the given ID.
    ///
    /// Adding an identical resource twice is a no-op, which lets independent
    /// rules share one target group. Adding a different spec under an existing
    /// ID is an internal error.
    pub fn add<S: ResourceSpec>(&mut self, id: ResourceId, spec: S) -> Result<ResourceId> {
        if let Some(&idx) = self.index.get(&id) {
            return match S::unwrap(&self.resources[idx]) {
                Some(existing) if existing.spec == spec => Ok(id),
                Some(_) => Err(Error::internal_with_context(
                    "stack",
                    format!("conflicting {} specs for resource {id}", S::KIND),
                )),
                None => Err(Error::internal_with_context(
                    "stack",
                    format!(
                        "resource {id} already registered as {}",
                        self.resources[idx].kind()
                    ),
                )),
            };
        }

        let resource = Resource {
            stack: self.id.clone(),
            id: id.clone(),
            spec,
        };
        self.index.insert(id.clone(), self.resources.len());
        self.resources.push(S::wrap(resource));
        Ok(id)
    }

    /// Look up a typed resource by ID
    pub fn get<S: ResourceSpec>(&self, id: &ResourceId) -> Option<&Resource<S>> {
        self.index
            .get(id)
            .and_then(|&idx| S::unwrap(&self.resources[idx]))
    }

    /// All resources of one kind, in insertion order
    pub fn list<S: ResourceSpec>(&self) -> Vec<&Resource<S>> {
        self.resources.iter().filter_map(S::unwrap).collect()
    }

    /// Every resource in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &AnyResource> {
        self.resources.iter()
    }

    /// Number of resources
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Whether the stack holds no resources
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}
