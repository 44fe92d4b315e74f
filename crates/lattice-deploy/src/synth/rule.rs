use std::collections::HashSet;

use lattice_common::Result;
use lattice_model::resources::{ListenerSpec, RouteRef, RuleSpec};
use lattice_model::Stack;
use tracing::{debug, info};

use super::{Deployed, SynthContext};
use crate::api::{call, call_delete, ListenerRecord, RuleInput, RuleRecord, ServiceRecord};
use crate::priority::{allocate, LiveRule};
use crate::tags;

/// Reconciles the rules of every non-passthrough listener
pub(crate) struct RuleSynthesizer<'a> {
    ctx: SynthContext<'a>,
}

impl<'a> RuleSynthesizer<'a> {
    pub fn new(ctx: SynthContext<'a>) -> Self {
        Self { ctx }
    }

    pub async fn synthesize(
        &self,
        stack: &Stack,
        service: &ServiceRecord,
        route: &RouteRef,
        deployed: &Deployed,
    ) -> Result<()> {
        for listener in stack.list::<ListenerSpec>() {
            if listener.spec.is_passthrough() {
                continue;
            }
            let Some(record) = deployed.listeners.get(&listener.id) else {
                continue;
            };
            let mut rules: Vec<&RuleSpec> = stack
                .list::<RuleSpec>()
                .into_iter()
                .map(|r| &r.spec)
                .filter(|r| r.listener == listener.id)
                .collect();
            rules.sort_by_key(|r| r.ordinal);
            self.sync_listener(service, record, &rules, route, deployed).await?;
        }
        Ok(())
    }

    async fn sync_listener(
        &self,
        service: &ServiceRecord,
        listener: &ListenerRecord,
        rules: &[&RuleSpec],
        route: &RouteRef,
        deployed: &Deployed,
    ) -> Result<()> {
        let api = self.ctx.api;
        let names: Vec<String> = rules.iter().map(|r| r.name()).collect();
        let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();

        let mut live = Vec::new();
        for rule in call("ListRules", || api.list_rules(&service.id, &listener.id)).await? {
            let stale = !wanted.contains(rule.rule.name.as_str())
                && tags::is_managed(&rule.rule.tags, self.ctx.config);
            if stale {
                call_delete("DeleteRule", || {
                    api.delete_rule(&service.id, &listener.id, &rule.id)
                })
                .await?;
                info!(rule = %rule.rule.name, "deleted stale rule");
            } else {
                live.push(rule);
            }
        }

        let current: Vec<LiveRule> = live
            .iter()
            .map(|r| LiveRule {
                name: r.rule.name.clone(),
                priority: r.rule.priority,
            })
            .collect();
        let priorities = allocate(&names, &current)?;

        for ((spec, name), priority) in rules.iter().zip(names).zip(priorities) {
            let input = RuleInput {
                service_id: service.id.clone(),
                listener_id: listener.id.clone(),
                name,
                priority,
                conditions: spec.conditions.clone(),
                action: deployed.action(&spec.action),
                tags: tags::route_child(self.ctx.config, route),
            };
            self.apply(&live, input).await?;
        }
        Ok(())
    }

    async fn apply(&self, live: &[RuleRecord], input: RuleInput) -> Result<()> {
        let api = self.ctx.api;
        match live.iter().find(|r| r.rule.name == input.name) {
            Some(existing) if existing.rule == input => {
                debug!(rule = %input.name, "rule up to date");
            }
            Some(existing) => {
                call("UpdateRule", || api.update_rule(&existing.id, input.clone())).await?;
                info!(rule = %input.name, priority = input.priority, "updated rule");
            }
            None => {
                call("CreateRule", || api.create_rule(input.clone())).await?;
                info!(rule = %input.name, priority = input.priority, "created rule");
            }
        }
        Ok(())
    }
}
