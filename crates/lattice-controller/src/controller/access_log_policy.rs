//! AccessLogPolicy reconciliation

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use lattice_common::crd::{AccessLogPolicy, PolicyStatus, CONDITION_ACCEPTED};
use lattice_common::events::{actions, reasons, ObjectEvent};
use lattice_common::kube_utils::{is_being_deleted, NamespacedName};
use lattice_common::{annotations, Error, Result};
use lattice_model::AccessLogSubscriptionBuilder;
use tracing::{info, instrument};

use super::RESYNC_INTERVAL;
use crate::context::Context;
use crate::kube_client::ObjectKind;
use crate::status::{self, condition, set_condition};

/// Reconcile an AccessLogPolicy
#[instrument(skip(policy, ctx), fields(policy = %NamespacedName::of(policy.as_ref())))]
pub async fn reconcile(policy: Arc<AccessLogPolicy>, ctx: Arc<Context>) -> Result<Action> {
    let id = NamespacedName::of(policy.as_ref());
    let owned = policy.finalizers().iter().any(|f| f == annotations::FINALIZER);

    if is_being_deleted(policy.as_ref()) {
        if !owned {
            return Ok(Action::await_change());
        }
        match AccessLogSubscriptionBuilder::new(ctx.build_context())
            .build(&policy)
            .await
        {
            Ok(stack) => {
                ctx.deployer.deploy(&stack).await?;
            }
            Err(e) if e.is_validation() => {
                info!(error = %e, "invalid policy never subscribed, releasing it");
            }
            Err(e) => return Err(e),
        }
        ctx.publish(
            &policy.object_ref(&()),
            ObjectEvent::normal(
                reasons::CLEANUP_SUCCEEDED,
                actions::DELETE,
                "removed access log subscription",
            ),
        )
        .await;
        ctx.release_finalizer(ObjectKind::AccessLogPolicy, &id, policy.finalizers())
            .await?;
        return Ok(Action::await_change());
    }

    ctx.ensure_finalizer(ObjectKind::AccessLogPolicy, &id, policy.finalizers())
        .await?;

    let result = match AccessLogSubscriptionBuilder::new(ctx.build_context())
        .build(&policy)
        .await
    {
        Ok(stack) => ctx.deployer.deploy(&stack).await,
        Err(e) => Err(e),
    };

    let accepted = match &result {
        Ok(outcome) => condition(
            CONDITION_ACCEPTED,
            true,
            status::reasons::ACCEPTED,
            outcome
                .access_log_subscription_arn
                .clone()
                .unwrap_or_default(),
            policy.meta().generation,
        ),
        Err(e) => condition(
            CONDITION_ACCEPTED,
            false,
            rejection_reason(e),
            e.to_string(),
            policy.meta().generation,
        ),
    };
    let mut conditions = policy
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    set_condition(&mut conditions, accepted);
    let desired = PolicyStatus { conditions };
    if policy.status.as_ref() != Some(&desired) {
        ctx.kube
            .patch_access_log_policy_status(&id, &desired)
            .await?;
    }

    match result {
        Ok(outcome) => {
            info!(
                subscription = ?outcome.access_log_subscription_arn,
                "access log policy reconciled"
            );
            Ok(Action::requeue(RESYNC_INTERVAL))
        }
        Err(e) => {
            ctx.publish(
                &policy.object_ref(&()),
                ObjectEvent::warning(reasons::DEPLOY_FAILED, actions::RECONCILE, e.to_string()),
            )
            .await;
            Err(e)
        }
    }
}

fn rejection_reason(error: &Error) -> &'static str {
    if error.is_validation() {
        status::reasons::INVALID
    } else if error.is_not_found() || error.requeue_after().is_some() {
        status::reasons::TARGET_NOT_FOUND
    } else {
        status::reasons::DEPLOY_FAILED
    }
}
