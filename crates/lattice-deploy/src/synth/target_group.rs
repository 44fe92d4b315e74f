use std::collections::{BTreeSet, HashSet};

use lattice_common::kube_utils::NamespacedName;
use lattice_common::{Error, Result};
use lattice_model::resources::{
    ImportSource, RouteRef, TargetGroupOrigin, TargetGroupSpec, TargetsSpec,
};
use lattice_model::Stack;
use tracing::{debug, info, warn};

use super::{Deployed, SynthContext};
use crate::api::{
    call, call_delete, Tags, TargetGroupInput, TargetGroupRecord, TargetRecord,
    CONSISTENCY_DELAY,
};
use crate::tags;

/// Reconciles target groups, their targets and orphaned groups
pub(crate) struct TargetGroupSynthesizer<'a> {
    ctx: SynthContext<'a>,
}

impl<'a> TargetGroupSynthesizer<'a> {
    pub fn new(ctx: SynthContext<'a>) -> Self {
        Self { ctx }
    }

    /// Ensure every live target group of the stack and register its targets
    pub async fn synthesize(&self, stack: &Stack, deployed: &mut Deployed) -> Result<()> {
        for tg in stack.list::<TargetGroupSpec>() {
            if tg.spec.is_deleted {
                continue;
            }
            let record = match &tg.spec.import {
                Some(import) => self.find_imported(&tg.spec, import).await?,
                None => self.ensure(&tg.spec).await?,
            };
            deployed.target_groups.insert(tg.id.clone(), record.id);
        }

        for targets in stack.list::<TargetsSpec>() {
            let Some(tg) = stack.get::<TargetGroupSpec>(&targets.spec.target_group) else {
                continue;
            };
            if tg.spec.import.is_some() || tg.spec.is_deleted {
                continue;
            }
            if let Some(id) = deployed.target_groups.get(&tg.id) {
                self.sync_targets(id, &targets.spec).await?;
            }
        }
        Ok(())
    }

    async fn ensure(&self, spec: &TargetGroupSpec) -> Result<TargetGroupRecord> {
        let api = self.ctx.api;
        let existing = call("FindTargetGroup", || api.find_target_group(&spec.name)).await?;

        let record = match existing {
            None => {
                let input = TargetGroupInput {
                    name: spec.name.clone(),
                    vpc_id: spec.vpc_id.clone(),
                    port: spec.port,
                    protocol: spec.protocol.as_str().to_string(),
                    protocol_version: spec.protocol_version.as_str().to_string(),
                    ip_address_type: spec.ip_address_type.as_str().to_string(),
                    health_check: spec.health_check.clone(),
                    tags: tags::target_group(self.ctx.config, spec),
                };
                let record = call("CreateTargetGroup", || {
                    api.create_target_group(input.clone())
                })
                .await?;
                info!(target_group = %spec.name, id = %record.id, "created target group");
                record
            }
            Some(record) if !tags::is_managed(&record.target_group.tags, self.ctx.config) => {
                return Err(Error::cloud_permanent(
                    "CreateTargetGroup",
                    format!(
                        "target group {} exists and is owned by {}",
                        spec.name,
                        tags::owner(&record.target_group.tags).unwrap_or("an unknown owner")
                    ),
                ));
            }
            Some(mut record) => {
                if record.target_group.health_check != spec.health_check {
                    call("UpdateTargetGroup", || {
                        api.update_target_group(&record.id, spec.health_check.clone())
                    })
                    .await?;
                    record.target_group.health_check = spec.health_check.clone();
                    debug!(target_group = %spec.name, "updated health check");
                }
                record
            }
        };

        self.ctx.registry.mark(&spec.name, spec.origin, true);
        Ok(record)
    }

    /// Imported groups are owned by the exporting cluster and found by tags
    async fn find_imported(
        &self,
        spec: &TargetGroupSpec,
        import: &ImportSource,
    ) -> Result<TargetGroupRecord> {
        let api = self.ctx.api;
        let groups = call("ListTargetGroups", || api.list_target_groups()).await?;
        groups
            .into_iter()
            .find(|tg| {
                tg.target_group.vpc_id == import.vpc_id
                    && tags::is_exported_by(
                        &tg.target_group.tags,
                        &spec.service,
                        &import.cluster_name,
                    )
            })
            .ok_or_else(|| {
                Error::requeue(
                    format!(
                        "no target group exported for {} by cluster {}",
                        spec.service, import.cluster_name
                    ),
                    CONSISTENCY_DELAY,
                )
            })
    }

    async fn sync_targets(&self, target_group_id: &str, spec: &TargetsSpec) -> Result<()> {
        let api = self.ctx.api;
        let desired: BTreeSet<TargetRecord> = spec
            .targets
            .iter()
            .map(|t| TargetRecord {
                ip: t.ip.clone(),
                port: t.port,
            })
            .collect();
        let live: BTreeSet<TargetRecord> = call("ListTargets", || api.list_targets(target_group_id))
            .await?
            .into_iter()
            .collect();

        let register: Vec<TargetRecord> = desired.difference(&live).cloned().collect();
        let deregister: Vec<TargetRecord> = live.difference(&desired).cloned().collect();

        if !register.is_empty() {
            call("RegisterTargets", || {
                api.register_targets(target_group_id, register.clone())
            })
            .await?;
        }
        if !deregister.is_empty() {
            call("DeregisterTargets", || {
                api.deregister_targets(target_group_id, deregister.clone())
            })
            .await?;
        }
        if !register.is_empty() || !deregister.is_empty() {
            info!(
                target_group = %target_group_id,
                registered = register.len(),
                deregistered = deregister.len(),
                "synced targets"
            );
        }
        Ok(())
    }

    /// Delete the route's target groups the stack no longer wants
    pub async fn cleanup_route(&self, route: &RouteRef, stack: &Stack) -> Result<()> {
        self.cleanup(stack, TargetGroupOrigin::BackendRef, |tags| {
            tags::is_route_target_group(tags, route)
        })
        .await
    }

    /// Delete the export's target groups the stack no longer wants
    pub async fn cleanup_export(&self, service: &NamespacedName, stack: &Stack) -> Result<()> {
        self.cleanup(stack, TargetGroupOrigin::ServiceExport, |tags| {
            tags::is_export_target_group(tags, service)
        })
        .await
    }

    async fn cleanup<F>(&self, stack: &Stack, origin: TargetGroupOrigin, owned: F) -> Result<()>
    where
        F: Fn(&Tags) -> bool,
    {
        let api = self.ctx.api;
        let wanted: HashSet<&str> = stack
            .list::<TargetGroupSpec>()
            .into_iter()
            .filter(|tg| !tg.spec.is_deleted && tg.spec.import.is_none())
            .map(|tg| tg.spec.name.as_str())
            .collect();

        // Groups another source owns that this stack stopped referencing
        let dropped: HashSet<&str> = stack
            .list::<TargetGroupSpec>()
            .into_iter()
            .filter(|tg| {
                tg.spec.is_deleted
                    && tg.spec.import.is_none()
                    && tg.spec.origin == origin
                    && tg.spec.owner() != origin
            })
            .map(|tg| tg.spec.name.as_str())
            .collect();

        let groups = call("ListTargetGroups", || api.list_target_groups()).await?;
        for group in groups {
            let tags = &group.target_group.tags;
            let name = group.target_group.name.as_str();
            if !tags::is_managed(tags, self.ctx.config) || wanted.contains(name) {
                continue;
            }
            if owned(tags) || dropped.contains(name) {
                self.release(&group, origin).await?;
            }
        }
        Ok(())
    }

    /// Drop one source's reference and delete the group once nothing wants it
    async fn release(&self, group: &TargetGroupRecord, origin: TargetGroupOrigin) -> Result<()> {
        let api = self.ctx.api;
        let name = &group.target_group.name;
        let state = self.ctx.registry.mark(name, origin, false);
        if state.is_referenced() {
            debug!(target_group = %name, ?state, "target group still referenced");
            // The export's tags are the only way back to a shared group
            return match origin {
                TargetGroupOrigin::BackendRef => Ok(()),
                TargetGroupOrigin::ServiceExport => Err(Error::requeue(
                    format!("target group {name} is still referenced by a route"),
                    CONSISTENCY_DELAY,
                )),
            };
        }

        let targets = call("ListTargets", || api.list_targets(&group.id)).await?;
        if !targets.is_empty() {
            call("DeregisterTargets", || {
                api.deregister_targets(&group.id, targets.clone())
            })
            .await?;
        }
        match call_delete("DeleteTargetGroup", || api.delete_target_group(&group.id)).await {
            Ok(()) => {
                info!(target_group = %name, "deleted orphaned target group");
                Ok(())
            }
            Err(e) => {
                // Still attached to another service's rules; retry later.
                warn!(target_group = %name, error = %e, "target group not deletable yet");
                Err(e)
            }
        }
    }
}
