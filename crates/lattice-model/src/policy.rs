//! Policy resolution
//!
//! Policy kinds form a closed set. [`PolicyKind`] is the single mapping table
//! from kind to Kubernetes kind name, and [`PolicyObject`] ties each CRD type
//! to its variant so lookups are checked at compile time.

use kube::ResourceExt;
use lattice_common::crd::{
    AccessLogPolicy, IAMAuthPolicy, PolicyTargetReference, TargetGroupPolicy,
    VpcAssociationPolicy,
};
use lattice_common::{Error, Result};
use tracing::debug;

use crate::reader::ClusterReader;

/// Supported policy kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PolicyKind {
    /// TargetGroupPolicy
    TargetGroup,
    /// VpcAssociationPolicy
    VpcAssociation,
    /// AccessLogPolicy
    AccessLog,
    /// IAMAuthPolicy
    IamAuth,
}

impl PolicyKind {
    /// Kubernetes kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::TargetGroup => "TargetGroupPolicy",
            PolicyKind::VpcAssociation => "VpcAssociationPolicy",
            PolicyKind::AccessLog => "AccessLogPolicy",
            PolicyKind::IamAuth => "IAMAuthPolicy",
        }
    }
}

/// A policy object of any supported kind
#[derive(Clone, Debug)]
pub enum AnyPolicy {
    /// TargetGroupPolicy
    TargetGroup(TargetGroupPolicy),
    /// VpcAssociationPolicy
    VpcAssociation(VpcAssociationPolicy),
    /// AccessLogPolicy
    AccessLog(AccessLogPolicy),
    /// IAMAuthPolicy
    IamAuth(IAMAuthPolicy),
}

impl AnyPolicy {
    /// Kind of the wrapped policy
    pub fn kind(&self) -> PolicyKind {
        match self {
            AnyPolicy::TargetGroup(_) => PolicyKind::TargetGroup,
            AnyPolicy::VpcAssociation(_) => PolicyKind::VpcAssociation,
            AnyPolicy::AccessLog(_) => PolicyKind::AccessLog,
            AnyPolicy::IamAuth(_) => PolicyKind::IamAuth,
        }
    }

    /// Target reference of the wrapped policy
    pub fn target_ref(&self) -> &PolicyTargetReference {
        match self {
            AnyPolicy::TargetGroup(p) => &p.spec.target_ref,
            AnyPolicy::VpcAssociation(p) => &p.spec.target_ref,
            AnyPolicy::AccessLog(p) => &p.spec.target_ref,
            AnyPolicy::IamAuth(p) => &p.spec.target_ref,
        }
    }

    /// Namespace of the wrapped policy
    pub fn namespace(&self) -> String {
        let ns = match self {
            AnyPolicy::TargetGroup(p) => p.namespace(),
            AnyPolicy::VpcAssociation(p) => p.namespace(),
            AnyPolicy::AccessLog(p) => p.namespace(),
            AnyPolicy::IamAuth(p) => p.namespace(),
        };
        ns.unwrap_or_else(|| "default".to_string())
    }

    /// Whether the policy targets the given object
    pub fn targets(&self, target: &PolicyTarget) -> bool {
        let target_ref = self.target_ref();
        let policy_ns = self.namespace();
        target_ref.group == target.group
            && target_ref.kind == target.kind
            && target_ref.name == target.name
            && target_ref.namespace.as_deref().unwrap_or(&policy_ns) == target.namespace
    }
}

/// Object a policy may be attached to
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PolicyTarget {
    /// API group ("" for core)
    pub group: String,
    /// Kind
    pub kind: String,
    /// Name
    pub name: String,
    /// Namespace
    pub namespace: String,
}

impl PolicyTarget {
    /// Create a policy target
    pub fn new(
        group: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

/// A CRD type that is one variant of [`AnyPolicy`]
pub trait PolicyObject: Sized {
    /// Kind of this policy type
    const KIND: PolicyKind;

    /// Extract the typed policy
    fn from_any(policy: AnyPolicy) -> Option<Self>;
}

macro_rules! impl_policy_object {
    ($ty:ty, $variant:ident) => {
        impl PolicyObject for $ty {
            const KIND: PolicyKind = PolicyKind::$variant;

            fn from_any(policy: AnyPolicy) -> Option<Self> {
                match policy {
                    AnyPolicy::$variant(p) => Some(p),
                    _ => None,
                }
            }
        }
    };
}

impl_policy_object!(TargetGroupPolicy, TargetGroup);
impl_policy_object!(VpcAssociationPolicy, VpcAssociation);
impl_policy_object!(AccessLogPolicy, AccessLog);
impl_policy_object!(IAMAuthPolicy, IamAuth);

/// Find the policy of type `P` attached to `target`.
///
/// Returns `Ok(None)` when no policy matches or when the policy CRD is not
/// installed; the feature is then simply absent.
pub async fn find_policy<P: PolicyObject>(
    reader: &dyn ClusterReader,
    target: &PolicyTarget,
) -> Result<Option<P>> {
    let policies = match reader.list_policies(P::KIND, &target.namespace).await {
        Ok(policies) => policies,
        Err(Error::CrdNotInstalled { kind }) => {
            debug!(%kind, "policy CRD not installed");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    Ok(policies
        .into_iter()
        .filter(|policy| policy.kind() == P::KIND)
        .find(|policy| policy.targets(target))
        .and_then(P::from_any))
}
