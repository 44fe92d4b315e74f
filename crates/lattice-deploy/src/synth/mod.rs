//! Per-kind synthesizers that reconcile stack resources against the mesh
//!
//! Each synthesizer finds the live resource by name or tag, creates it when
//! missing and updates it only when it differs, so redeploying an unchanged
//! stack issues no mutating calls.

mod access_log;
mod listener;
mod rule;
mod service;
mod service_network;
mod target_group;

use std::collections::HashMap;

use lattice_common::ControllerConfig;
use lattice_model::resources::{
    DefaultAction, RuleAction, TargetGroupRef, FALLBACK_STATUS_CODE,
};
use lattice_model::ResourceId;

use crate::api::{ActionRecord, LatticeApi, ListenerRecord, WeightedTargetRecord};
use crate::registry::TargetGroupRegistry;

pub(crate) use access_log::AccessLogSynthesizer;
pub(crate) use listener::ListenerSynthesizer;
pub(crate) use rule::RuleSynthesizer;
pub(crate) use service::ServiceSynthesizer;
pub(crate) use service_network::ServiceNetworkSynthesizer;
pub(crate) use target_group::TargetGroupSynthesizer;

/// Shared inputs of every synthesizer
#[derive(Clone, Copy)]
pub(crate) struct SynthContext<'a> {
    pub api: &'a dyn LatticeApi,
    pub config: &'a ControllerConfig,
    pub registry: &'a TargetGroupRegistry,
}

/// Mesh IDs of resources deployed so far in one pass
#[derive(Debug, Default)]
pub(crate) struct Deployed {
    /// Target group ID by stack resource ID
    pub target_groups: HashMap<ResourceId, String>,
    /// Listener by stack resource ID
    pub listeners: HashMap<ResourceId, ListenerRecord>,
}

impl Deployed {
    /// Resolve a model action to mesh target groups.
    ///
    /// Unresolved backends are dropped and keep no share of the traffic; an
    /// action left with no targets answers with the fallback status.
    pub fn action(&self, action: &RuleAction) -> ActionRecord {
        let targets: Vec<WeightedTargetRecord> = action
            .target_groups
            .iter()
            .filter_map(|tg| match &tg.target {
                TargetGroupRef::Stack(id) => {
                    self.target_groups
                        .get(id)
                        .map(|target_group_id| WeightedTargetRecord {
                            target_group_id: target_group_id.clone(),
                            weight: tg.weight,
                        })
                }
                TargetGroupRef::Invalid => None,
            })
            .collect();

        if targets.is_empty() {
            ActionRecord::FixedResponse {
                status_code: FALLBACK_STATUS_CODE,
            }
        } else {
            ActionRecord::Forward(targets)
        }
    }

    /// Resolve a listener default action
    pub fn default_action(&self, action: &DefaultAction) -> ActionRecord {
        match action {
            DefaultAction::FixedResponse { status_code } => ActionRecord::FixedResponse {
                status_code: *status_code,
            },
            DefaultAction::Forward(action) => self.action(action),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_model::resources::WeightedTargetGroup;
    use lattice_model::ResourceKind;

    #[test]
    fn invalid_backends_are_dropped_from_forwards() {
        let tg = ResourceId::derive(ResourceKind::TargetGroup, &["tg1"]);
        let mut deployed = Deployed::default();
        deployed.target_groups.insert(tg.clone(), "tg-0001".to_string());

        let action = RuleAction {
            target_groups: vec![
                WeightedTargetGroup {
                    target: TargetGroupRef::Stack(tg),
                    weight: 10,
                },
                WeightedTargetGroup {
                    target: TargetGroupRef::Invalid,
                    weight: 90,
                },
            ],
        };
        assert_eq!(
            deployed.action(&action),
            ActionRecord::Forward(vec![WeightedTargetRecord {
                target_group_id: "tg-0001".to_string(),
                weight: 10,
            }])
        );
    }

    #[test]
    fn empty_forward_answers_with_fallback() {
        let deployed = Deployed::default();
        assert_eq!(
            deployed.action(&RuleAction::default()),
            ActionRecord::FixedResponse {
                status_code: FALLBACK_STATUS_CODE
            }
        );
    }
}
