use lattice_common::Result;
use lattice_model::resources::ServiceNetworkSpec;
use tracing::{debug, info, warn};

use super::SynthContext;
use crate::api::{call, call_delete, ServiceNetworkInput, ServiceNetworkRecord};
use crate::tags;

/// Reconciles a gateway's service network and its VPC association
pub(crate) struct ServiceNetworkSynthesizer<'a> {
    ctx: SynthContext<'a>,
}

impl<'a> ServiceNetworkSynthesizer<'a> {
    pub fn new(ctx: SynthContext<'a>) -> Self {
        Self { ctx }
    }

    /// Returns the live network, or `None` once it is deleted
    pub async fn synthesize(
        &self,
        spec: &ServiceNetworkSpec,
    ) -> Result<Option<ServiceNetworkRecord>> {
        let api = self.ctx.api;
        let existing = call("FindServiceNetwork", || api.find_service_network(&spec.name)).await?;

        if spec.is_deleted {
            if let Some(network) = existing {
                self.delete(&network).await?;
            }
            return Ok(None);
        }

        let network = match existing {
            None => {
                let input = ServiceNetworkInput {
                    name: spec.name.clone(),
                    auth_policy: spec.auth_policy.clone(),
                    tags: tags::managed(self.ctx.config),
                };
                let network = call("CreateServiceNetwork", || {
                    api.create_service_network(input.clone())
                })
                .await?;
                info!(network = %spec.name, id = %network.id, "created service network");
                network
            }
            Some(network) if !tags::is_managed(&network.network.tags, self.ctx.config) => {
                // Networks are commonly provisioned out of band; use them as-is.
                debug!(network = %spec.name, "using unmanaged service network");
                network
            }
            Some(network) if network.network.auth_policy != spec.auth_policy => {
                let input = ServiceNetworkInput {
                    auth_policy: spec.auth_policy.clone(),
                    ..network.network.clone()
                };
                call("UpdateServiceNetwork", || {
                    api.update_service_network(&network.id, input.clone())
                })
                .await?
            }
            Some(network) => network,
        };

        self.sync_vpc_association(&network, spec).await?;
        Ok(Some(network))
    }

    async fn sync_vpc_association(
        &self,
        network: &ServiceNetworkRecord,
        spec: &ServiceNetworkSpec,
    ) -> Result<()> {
        let api = self.ctx.api;
        let vpc_id = self.ctx.config.vpc_id.as_str();
        let existing = call("FindVpcAssociation", || {
            api.find_vpc_association(&network.id, vpc_id)
        })
        .await?;

        match existing {
            None if spec.associate_to_vpc => {
                let association = call("CreateVpcAssociation", || {
                    api.create_vpc_association(
                        &network.id,
                        vpc_id,
                        spec.security_group_ids.clone(),
                        tags::managed(self.ctx.config),
                    )
                })
                .await?;
                info!(
                    network = %spec.name,
                    association = %association.id,
                    "associated service network with VPC"
                );
            }
            Some(association) if spec.associate_to_vpc => {
                if association.security_group_ids != spec.security_group_ids {
                    call("UpdateVpcAssociation", || {
                        api.update_vpc_association(&association.id, spec.security_group_ids.clone())
                    })
                    .await?;
                }
            }
            Some(association) if tags::is_managed(&association.tags, self.ctx.config) => {
                call_delete("DeleteVpcAssociation", || {
                    api.delete_vpc_association(&association.id)
                })
                .await?;
                info!(network = %spec.name, "removed VPC association");
            }
            _ => {}
        }
        Ok(())
    }

    async fn delete(&self, network: &ServiceNetworkRecord) -> Result<()> {
        let api = self.ctx.api;
        if !tags::is_managed(&network.network.tags, self.ctx.config) {
            warn!(network = %network.network.name, "leaving unmanaged service network in place");
            return Ok(());
        }

        let vpc_id = self.ctx.config.vpc_id.as_str();
        if let Some(association) = call("FindVpcAssociation", || {
            api.find_vpc_association(&network.id, vpc_id)
        })
        .await?
        {
            call_delete("DeleteVpcAssociation", || {
                api.delete_vpc_association(&association.id)
            })
            .await?;
        }

        call_delete("DeleteServiceNetwork", || api.delete_service_network(&network.id)).await?;
        info!(network = %network.network.name, "deleted service network");
        Ok(())
    }
}
