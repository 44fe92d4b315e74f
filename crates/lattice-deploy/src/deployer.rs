//! Stack deployer
//!
//! Walks a stack in dependency order: service networks, target groups and
//! targets, the service and its associations, listeners, rules, orphaned
//! target groups, then access log subscriptions. A deleted route tears its
//! service down in reverse before its target groups are released.

use std::sync::Arc;

use lattice_common::{ControllerConfig, Result};
use lattice_model::resources::{AccessLogSubscriptionSpec, ServiceNetworkSpec, ServiceSpec};
use lattice_model::Stack;
use tracing::{info, instrument};

use crate::api::LatticeApi;
use crate::registry::TargetGroupRegistry;
use crate::synth::{
    AccessLogSynthesizer, Deployed, ListenerSynthesizer, RuleSynthesizer, ServiceNetworkSynthesizer,
    ServiceSynthesizer, SynthContext, TargetGroupSynthesizer,
};

/// What a deploy left live, for status reporting
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeployOutcome {
    /// ARN of the route's service
    pub service_arn: Option<String>,
    /// Generated DNS name of the route's service
    pub service_dns: Option<String>,
    /// ARN of the gateway's service network
    pub service_network_arn: Option<String>,
    /// ARN of the policy's access log subscription
    pub access_log_subscription_arn: Option<String>,
}

/// Synthesizes stacks against the mesh API
#[derive(Clone)]
pub struct Deployer {
    api: Arc<dyn LatticeApi>,
    config: ControllerConfig,
    registry: Arc<TargetGroupRegistry>,
}

impl Deployer {
    /// Create a deployer with a fresh target group registry
    pub fn new(api: Arc<dyn LatticeApi>, config: ControllerConfig) -> Self {
        Self {
            api,
            config,
            registry: Arc::new(TargetGroupRegistry::new()),
        }
    }

    /// Target group reference registry shared by every deploy
    pub fn registry(&self) -> &TargetGroupRegistry {
        &self.registry
    }

    /// Deploy a stack.
    ///
    /// A stack with no service, network or subscription holds a ServiceExport's
    /// target groups; the stack ID names the exported service.
    #[instrument(skip(self, stack), fields(stack = %stack.id(), resources = stack.len()))]
    pub async fn deploy(&self, stack: &Stack) -> Result<DeployOutcome> {
        let ctx = SynthContext {
            api: self.api.as_ref(),
            config: &self.config,
            registry: &self.registry,
        };
        let mut outcome = DeployOutcome::default();
        let mut deployed = Deployed::default();

        for network in stack.list::<ServiceNetworkSpec>() {
            outcome.service_network_arn = ServiceNetworkSynthesizer::new(ctx)
                .synthesize(&network.spec)
                .await?
                .map(|n| n.arn);
        }

        let target_groups = TargetGroupSynthesizer::new(ctx);
        let subscriptions = stack.list::<AccessLogSubscriptionSpec>();
        match stack.list::<ServiceSpec>().first() {
            Some(service) if service.spec.is_deleted => {
                ServiceSynthesizer::new(ctx).teardown(&service.spec).await?;
                target_groups.cleanup_route(&service.spec.route, stack).await?;
            }
            Some(service) => {
                let route = &service.spec.route;
                target_groups.synthesize(stack, &mut deployed).await?;
                let record = ServiceSynthesizer::new(ctx).synthesize(&service.spec).await?;
                ListenerSynthesizer::new(ctx)
                    .synthesize(stack, &record, route, &mut deployed)
                    .await?;
                RuleSynthesizer::new(ctx)
                    .synthesize(stack, &record, route, &deployed)
                    .await?;
                target_groups.cleanup_route(route, stack).await?;
                outcome.service_arn = Some(record.arn);
                outcome.service_dns = Some(record.dns_name);
            }
            None if stack.list::<ServiceNetworkSpec>().is_empty() && subscriptions.is_empty() => {
                target_groups.synthesize(stack, &mut deployed).await?;
                target_groups.cleanup_export(stack.id(), stack).await?;
            }
            None => {}
        }

        for subscription in subscriptions {
            outcome.access_log_subscription_arn = AccessLogSynthesizer::new(ctx)
                .synthesize(&subscription.spec)
                .await?
                .map(|s| s.arn);
        }

        info!(
            target_groups = deployed.target_groups.len(),
            listeners = deployed.listeners.len(),
            "deployed stack"
        );
        Ok(outcome)
    }
}
