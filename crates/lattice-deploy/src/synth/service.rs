use std::collections::HashSet;

use lattice_common::{Error, Result};
use lattice_model::resources::ServiceSpec;
use tracing::{debug, info, warn};

use super::{ListenerSynthesizer, SynthContext};
use crate::api::{call, call_delete, ServiceInput, ServiceRecord, CONSISTENCY_DELAY};
use crate::tags;

/// Reconciles a route's mesh service and its service network associations
pub(crate) struct ServiceSynthesizer<'a> {
    ctx: SynthContext<'a>,
}

impl<'a> ServiceSynthesizer<'a> {
    pub fn new(ctx: SynthContext<'a>) -> Self {
        Self { ctx }
    }

    pub async fn synthesize(&self, spec: &ServiceSpec) -> Result<ServiceRecord> {
        let api = self.ctx.api;
        let name = spec.lattice_name();
        let input = ServiceInput {
            name: name.clone(),
            custom_domain_name: spec.custom_domain_name.clone(),
            certificate_arn: spec.certificate_arn.clone(),
            auth_policy: spec.auth_policy.clone(),
            tags: tags::service(self.ctx.config, spec),
        };

        let record = match call("FindService", || api.find_service(&name)).await? {
            None => {
                let record = call("CreateService", || api.create_service(input.clone())).await?;
                info!(service = %name, id = %record.id, "created service");
                record
            }
            Some(existing) => {
                self.check_ownership(&existing, spec)?;
                if existing.service == input {
                    existing
                } else {
                    let record = call("UpdateService", || {
                        api.update_service(&existing.id, input.clone())
                    })
                    .await?;
                    info!(service = %name, "updated service");
                    record
                }
            }
        };

        self.sync_associations(&record, spec).await?;
        Ok(record)
    }

    /// A service owned by someone else is only adopted when the route names
    /// that owner in its takeover annotation
    fn check_ownership(&self, existing: &ServiceRecord, spec: &ServiceSpec) -> Result<()> {
        let config = self.ctx.config;
        if tags::is_managed(&existing.service.tags, config) {
            return Ok(());
        }
        let owner = tags::owner(&existing.service.tags);
        match (owner, spec.allow_takeover_from.as_deref()) {
            (Some(owner), Some(allowed)) if owner == allowed => {
                info!(service = %existing.service.name, from = %owner, "taking over service");
                Ok(())
            }
            _ => Err(Error::cloud_permanent(
                "CreateService",
                format!(
                    "service {} exists and is owned by {}",
                    existing.service.name,
                    owner.unwrap_or("an unknown owner")
                ),
            )),
        }
    }

    async fn sync_associations(&self, service: &ServiceRecord, spec: &ServiceSpec) -> Result<()> {
        let api = self.ctx.api;

        let mut desired = HashSet::new();
        for network_name in &spec.service_network_names {
            let network = call("FindServiceNetwork", || api.find_service_network(network_name))
                .await?
                .ok_or_else(|| {
                    Error::requeue(
                        format!("service network {network_name} does not exist yet"),
                        CONSISTENCY_DELAY,
                    )
                })?;
            desired.insert(network.id);
        }

        let live = call("ListServiceNetworkAssociations", || {
            api.list_service_network_associations(&service.id)
        })
        .await?;
        let associated: HashSet<&str> =
            live.iter().map(|a| a.service_network_id.as_str()).collect();

        for network_id in &desired {
            if associated.contains(network_id.as_str()) {
                continue;
            }
            call("CreateServiceNetworkAssociation", || {
                api.create_service_network_association(
                    &service.id,
                    network_id,
                    tags::managed(self.ctx.config),
                )
            })
            .await?;
            info!(service = %service.service.name, network = %network_id, "associated service");
        }

        for association in live.iter().filter(|a| !desired.contains(&a.service_network_id)) {
            call_delete("DeleteServiceNetworkAssociation", || {
                api.delete_service_network_association(&association.id)
            })
            .await?;
            info!(
                service = %service.service.name,
                network = %association.service_network_id,
                "disassociated service"
            );
        }
        Ok(())
    }

    /// Delete the route's service, its listeners, rules and associations
    pub async fn teardown(&self, spec: &ServiceSpec) -> Result<()> {
        let api = self.ctx.api;
        let name = spec.lattice_name();
        let Some(service) = call("FindService", || api.find_service(&name)).await? else {
            debug!(service = %name, "service already gone");
            return Ok(());
        };
        if !tags::is_managed(&service.service.tags, self.ctx.config) {
            warn!(service = %name, "leaving service owned by another controller in place");
            return Ok(());
        }

        let listeners = ListenerSynthesizer::new(self.ctx);
        for listener in call("ListListeners", || api.list_listeners(&service.id)).await? {
            listeners.remove(&service.id, &listener).await?;
        }

        for association in call("ListServiceNetworkAssociations", || {
            api.list_service_network_associations(&service.id)
        })
        .await?
        {
            call_delete("DeleteServiceNetworkAssociation", || {
                api.delete_service_network_association(&association.id)
            })
            .await?;
        }

        call_delete("DeleteService", || api.delete_service(&service.id)).await?;
        info!(service = %name, "deleted service");
        Ok(())
    }
}
