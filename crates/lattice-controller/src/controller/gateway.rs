//! Gateway reconciliation: one service network per controlled gateway

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use lattice_common::crd::{Gateway, GatewayStatus, CONDITION_ACCEPTED};
use lattice_common::events::{actions, reasons, ObjectEvent};
use lattice_common::kube_utils::{is_being_deleted, NamespacedName};
use lattice_common::{annotations, Result};
use lattice_model::gateway::is_controlled;
use lattice_model::ServiceNetworkBuilder;
use tracing::{debug, info, instrument};

use super::RESYNC_INTERVAL;
use crate::context::Context;
use crate::kube_client::ObjectKind;
use crate::status::{self, condition, set_condition, CONDITION_PROGRAMMED};

/// Reconcile a Gateway
#[instrument(skip(gateway, ctx), fields(gateway = %NamespacedName::of(gateway.as_ref())))]
pub async fn reconcile(gateway: Arc<Gateway>, ctx: Arc<Context>) -> Result<Action> {
    let id = NamespacedName::of(gateway.as_ref());
    let owned = gateway.finalizers().iter().any(|f| f == annotations::FINALIZER);

    if !is_controlled(ctx.reader.as_ref(), &ctx.config, &gateway).await? && !owned {
        debug!("gateway belongs to another controller");
        return Ok(Action::await_change());
    }

    if is_being_deleted(gateway.as_ref()) {
        if !owned {
            return Ok(Action::await_change());
        }
        let stack = ServiceNetworkBuilder::new(ctx.build_context())
            .build(&gateway)
            .await?;
        ctx.deployer.deploy(&stack).await?;
        ctx.publish(
            &gateway.object_ref(&()),
            ObjectEvent::normal(
                reasons::CLEANUP_SUCCEEDED,
                actions::DELETE,
                "removed service network",
            ),
        )
        .await;
        ctx.release_finalizer(ObjectKind::Gateway, &id, gateway.finalizers())
            .await?;
        info!("gateway cleaned up");
        return Ok(Action::await_change());
    }

    ctx.ensure_finalizer(ObjectKind::Gateway, &id, gateway.finalizers())
        .await?;

    let stack = ServiceNetworkBuilder::new(ctx.build_context())
        .build(&gateway)
        .await?;
    let outcome = ctx.deployer.deploy(&stack).await?;

    let generation = gateway.meta().generation;
    let mut conditions = gateway
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    set_condition(
        &mut conditions,
        condition(
            CONDITION_ACCEPTED,
            true,
            status::reasons::ACCEPTED,
            "",
            generation,
        ),
    );
    set_condition(
        &mut conditions,
        condition(
            CONDITION_PROGRAMMED,
            outcome.service_network_arn.is_some(),
            status::reasons::PROGRAMMED,
            outcome.service_network_arn.clone().unwrap_or_default(),
            generation,
        ),
    );
    let desired = GatewayStatus { conditions };
    if gateway.status.as_ref() != Some(&desired) {
        ctx.kube.patch_gateway_status(&id, &desired).await?;
    }

    info!(network = ?outcome.service_network_arn, "gateway reconciled");
    Ok(Action::requeue(RESYNC_INTERVAL))
}
