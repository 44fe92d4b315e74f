use std::collections::HashSet;

use lattice_common::Result;
use lattice_model::resources::{ListenerSpec, RouteRef};
use lattice_model::Stack;
use tracing::info;

use super::{Deployed, SynthContext};
use crate::api::{call, call_delete, ListenerInput, ListenerRecord, ServiceRecord};
use crate::tags;

/// Reconciles the listeners of a service
pub(crate) struct ListenerSynthesizer<'a> {
    ctx: SynthContext<'a>,
}

impl<'a> ListenerSynthesizer<'a> {
    pub fn new(ctx: SynthContext<'a>) -> Self {
        Self { ctx }
    }

    /// Create or update the stack's listeners and remove stale ones.
    ///
    /// Port and protocol cannot change in place; such listeners are replaced.
    pub async fn synthesize(
        &self,
        stack: &Stack,
        service: &ServiceRecord,
        route: &RouteRef,
        deployed: &mut Deployed,
    ) -> Result<()> {
        let api = self.ctx.api;
        let live = call("ListListeners", || api.list_listeners(&service.id)).await?;
        let desired = stack.list::<ListenerSpec>();

        let names: HashSet<&str> = desired.iter().map(|l| l.spec.name.as_str()).collect();
        for stale in live.iter().filter(|l| !names.contains(l.listener.name.as_str())) {
            if tags::is_managed(&stale.listener.tags, self.ctx.config) {
                self.remove(&service.id, stale).await?;
            }
        }

        for listener in desired {
            let spec = &listener.spec;
            let input = ListenerInput {
                service_id: service.id.clone(),
                name: spec.name.clone(),
                port: spec.port,
                protocol: spec.protocol.as_str().to_string(),
                default_action: deployed.default_action(&spec.default_action),
                tags: tags::route_child(self.ctx.config, route),
            };

            let existing = live.iter().find(|l| l.listener.name == spec.name);
            let record = match existing {
                Some(l)
                    if l.listener.port == input.port && l.listener.protocol == input.protocol =>
                {
                    if l.listener.default_action != input.default_action {
                        call("UpdateListener", || {
                            api.update_listener(&service.id, &l.id, input.default_action.clone())
                        })
                        .await?;
                        info!(listener = %spec.name, "updated listener default action");
                    }
                    ListenerRecord {
                        listener: input,
                        ..l.clone()
                    }
                }
                Some(l) => {
                    self.remove(&service.id, l).await?;
                    self.create(input).await?
                }
                None => self.create(input).await?,
            };
            deployed.listeners.insert(listener.id.clone(), record);
        }
        Ok(())
    }

    async fn create(&self, input: ListenerInput) -> Result<ListenerRecord> {
        let api = self.ctx.api;
        let record = call("CreateListener", || api.create_listener(input.clone())).await?;
        info!(
            listener = %record.listener.name,
            port = record.listener.port,
            protocol = %record.listener.protocol,
            "created listener"
        );
        Ok(record)
    }

    /// Delete a listener after its rules
    pub async fn remove(&self, service_id: &str, listener: &ListenerRecord) -> Result<()> {
        let api = self.ctx.api;
        for rule in call("ListRules", || api.list_rules(service_id, &listener.id)).await? {
            call_delete("DeleteRule", || {
                api.delete_rule(service_id, &listener.id, &rule.id)
            })
            .await?;
        }
        call_delete("DeleteListener", || api.delete_listener(service_id, &listener.id)).await?;
        info!(listener = %listener.listener.name, "deleted listener");
        Ok(())
    }
}
