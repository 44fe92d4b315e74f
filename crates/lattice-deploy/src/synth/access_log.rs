use lattice_common::{Error, Result};
use lattice_model::resources::{AccessLogSource, AccessLogSubscriptionSpec};
use tracing::info;

use super::SynthContext;
use crate::api::{
    call, call_delete, AccessLogSubscriptionInput, AccessLogSubscriptionRecord, CONSISTENCY_DELAY,
};
use crate::tags;

/// Reconciles the access log subscription of one policy
pub(crate) struct AccessLogSynthesizer<'a> {
    ctx: SynthContext<'a>,
}

impl<'a> AccessLogSynthesizer<'a> {
    pub fn new(ctx: SynthContext<'a>) -> Self {
        Self { ctx }
    }

    /// Returns the live subscription, or `None` once it is deleted
    pub async fn synthesize(
        &self,
        spec: &AccessLogSubscriptionSpec,
    ) -> Result<Option<AccessLogSubscriptionRecord>> {
        let api = self.ctx.api;
        let Some(resource_arn) = self.source_arn(&spec.source).await? else {
            if spec.is_deleted {
                return Ok(None);
            }
            return Err(Error::requeue(
                format!("access log source {:?} does not exist yet", spec.source),
                CONSISTENCY_DELAY,
            ));
        };

        let existing = call("ListAccessLogSubscriptions", || {
            api.list_access_log_subscriptions(&resource_arn)
        })
        .await?
        .into_iter()
        .find(|s| {
            tags::is_managed(&s.subscription.tags, self.ctx.config)
                && tags::is_policy_subscription(&s.subscription.tags, &spec.policy)
        });

        match existing {
            Some(subscription) if spec.is_deleted => {
                call_delete("DeleteAccessLogSubscription", || {
                    api.delete_access_log_subscription(&subscription.id)
                })
                .await?;
                info!(policy = %spec.policy, "deleted access log subscription");
                Ok(None)
            }
            None if spec.is_deleted => Ok(None),
            Some(mut subscription) => {
                if subscription.subscription.destination_arn != spec.destination_arn {
                    call("UpdateAccessLogSubscription", || {
                        api.update_access_log_subscription(&subscription.id, &spec.destination_arn)
                    })
                    .await?;
                    subscription.subscription.destination_arn = spec.destination_arn.clone();
                    info!(policy = %spec.policy, "updated access log destination");
                }
                Ok(Some(subscription))
            }
            None => {
                let input = AccessLogSubscriptionInput {
                    resource_arn: resource_arn.clone(),
                    destination_arn: spec.destination_arn.clone(),
                    tags: tags::access_log(self.ctx.config, &spec.policy),
                };
                let subscription = call("CreateAccessLogSubscription", || {
                    api.create_access_log_subscription(input.clone())
                })
                .await?;
                info!(
                    policy = %spec.policy,
                    id = %subscription.id,
                    "created access log subscription"
                );
                Ok(Some(subscription))
            }
        }
    }

    async fn source_arn(&self, source: &AccessLogSource) -> Result<Option<String>> {
        let api = self.ctx.api;
        Ok(match source {
            AccessLogSource::ServiceNetwork(name) => {
                call("FindServiceNetwork", || api.find_service_network(name))
                    .await?
                    .map(|n| n.arn)
            }
            AccessLogSource::Service(name) => call("FindService", || api.find_service(name))
                .await?
                .map(|s| s.arn),
        })
    }
}
