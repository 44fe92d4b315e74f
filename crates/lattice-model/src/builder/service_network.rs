//! Service network builder: one mesh network per gateway

use kube::ResourceExt;
use lattice_common::annotations::{self, parse_bool};
use lattice_common::crd::{Gateway, IAMAuthPolicy, VpcAssociationPolicy, GATEWAY_API_GROUP};
use lattice_common::kube_utils::{annotation, is_being_deleted, NamespacedName};
use lattice_common::{Error, Result};
use tracing::{debug, instrument};

use super::BuildContext;
use crate::policy::{find_policy, PolicyTarget};
use crate::resources::ServiceNetworkSpec;
use crate::stack::{ResourceId, ResourceKind, Stack};

/// Builds the service network stack of a gateway
pub struct ServiceNetworkBuilder<'a> {
    ctx: BuildContext<'a>,
}

impl<'a> ServiceNetworkBuilder<'a> {
    /// Create a service network builder
    pub fn new(ctx: BuildContext<'a>) -> Self {
        Self { ctx }
    }

    /// Build the gateway's service network
    #[instrument(skip(self, gateway), fields(gateway = %NamespacedName::of(gateway)))]
    pub async fn build(&self, gateway: &Gateway) -> Result<Stack> {
        let gateway_id = NamespacedName::of(gateway);
        let mut stack = Stack::new(gateway_id.clone());
        let target = PolicyTarget::new(
            GATEWAY_API_GROUP,
            "Gateway",
            &gateway_id.namespace,
            &gateway_id.name,
        );

        let (associate_to_vpc, security_group_ids) = self.vpc_association(gateway, &target).await?;
        let auth_policy = find_policy::<IAMAuthPolicy>(self.ctx.reader, &target)
            .await?
            .map(|p| p.spec.policy);

        let name = gateway.name_any();
        let spec = ServiceNetworkSpec {
            name: name.clone(),
            associate_to_vpc,
            security_group_ids,
            auth_policy,
            is_deleted: is_being_deleted(gateway),
        };
        debug!(network = %name, associate_to_vpc, "built service network");
        stack.add(ResourceId::derive(ResourceKind::ServiceNetwork, &[&name]), spec)?;
        Ok(stack)
    }

    /// VPC association: policy, then gateway annotation, then none
    async fn vpc_association(
        &self,
        gateway: &Gateway,
        target: &PolicyTarget,
    ) -> Result<(bool, Vec<String>)> {
        if let Some(policy) = find_policy::<VpcAssociationPolicy>(self.ctx.reader, target).await? {
            return Ok((
                policy.spec.associate_with_vpc.unwrap_or(true),
                policy.spec.security_group_ids,
            ));
        }

        match annotation(gateway, annotations::VPC_ASSOCIATION) {
            Some(value) => {
                let associate = parse_bool(value).ok_or_else(|| {
                    Error::validation_for_field(
                        NamespacedName::of(gateway).to_string(),
                        format!("metadata.annotations[{}]", annotations::VPC_ASSOCIATION),
                        format!("invalid VPC association value {value:?}"),
                    )
                })?;
                Ok((associate, Vec::new()))
            }
            None => Ok((false, Vec::new())),
        }
    }
}
