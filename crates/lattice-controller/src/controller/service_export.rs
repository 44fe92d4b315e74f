//! ServiceExport reconciliation: publish a Service's target groups to the mesh

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use lattice_common::crd::{ServiceExport, ServiceExportStatus};
use lattice_common::events::{actions, reasons, ObjectEvent};
use lattice_common::kube_utils::{is_being_deleted, NamespacedName};
use lattice_common::{annotations, Result};
use lattice_model::resources::TargetGroupSpec;
use lattice_model::ServiceExportModelBuilder;
use tracing::{info, instrument};

use super::RESYNC_INTERVAL;
use crate::context::Context;
use crate::kube_client::ObjectKind;
use crate::status::{self, condition, set_condition, CONDITION_EXPORTED};

/// Reconcile a ServiceExport
#[instrument(skip(export, ctx), fields(export = %NamespacedName::of(export.as_ref())))]
pub async fn reconcile(export: Arc<ServiceExport>, ctx: Arc<Context>) -> Result<Action> {
    let id = NamespacedName::of(export.as_ref());
    let owned = export.finalizers().iter().any(|f| f == annotations::FINALIZER);

    if is_being_deleted(export.as_ref()) {
        if !owned {
            return Ok(Action::await_change());
        }
        let stack = ServiceExportModelBuilder::new(ctx.build_context())
            .build(&export)
            .await?;
        ctx.deployer.deploy(&stack).await?;
        ctx.publish(
            &export.object_ref(&()),
            ObjectEvent::normal(
                reasons::CLEANUP_SUCCEEDED,
                actions::DELETE,
                "withdrew exported target groups",
            ),
        )
        .await;
        ctx.release_finalizer(ObjectKind::ServiceExport, &id, export.finalizers())
            .await?;
        info!("export cleaned up");
        return Ok(Action::await_change());
    }

    ctx.ensure_finalizer(ObjectKind::ServiceExport, &id, export.finalizers())
        .await?;

    let stack = match ServiceExportModelBuilder::new(ctx.build_context())
        .build(&export)
        .await
    {
        Ok(stack) => stack,
        Err(e) => {
            ctx.publish(
                &export.object_ref(&()),
                ObjectEvent::warning(reasons::BUILD_FAILED, actions::RECONCILE, e.to_string()),
            )
            .await;
            return Err(e);
        }
    };
    ctx.deployer.deploy(&stack).await?;

    let exported = stack.list::<TargetGroupSpec>().len();
    let (ok, message) = if exported > 0 {
        (true, format!("{exported} target group(s) published"))
    } else {
        (false, "export is not federated to the mesh".to_string())
    };
    let mut conditions = export
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    set_condition(
        &mut conditions,
        condition(
            CONDITION_EXPORTED,
            ok,
            if ok {
                status::reasons::PROGRAMMED
            } else {
                status::reasons::INVALID
            },
            message,
            export.meta().generation,
        ),
    );
    let desired = ServiceExportStatus { conditions };
    if export.status.as_ref() != Some(&desired) {
        ctx.kube.patch_export_status(&id, &desired).await?;
    }

    info!(target_groups = exported, "export reconciled");
    Ok(Action::requeue(RESYNC_INTERVAL))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use lattice_common::crd::ServiceExportSpec;
    use lattice_common::events::NoopEventPublisher;
    use lattice_deploy::{Deployer, InMemoryLatticeApi};
    use lattice_model::fixture;

    use crate::kube_client::MockControllerKubeClient;

    fn harness(kube: MockControllerKubeClient) -> (Arc<Context>, Arc<InMemoryLatticeApi>) {
        let (reader, _) = fixture::standard_graph();
        let config = fixture::config();
        let api = Arc::new(InMemoryLatticeApi::new(&config.account_id, &config.region));
        let ctx = Arc::new(Context::new(
            Arc::new(reader),
            Arc::new(kube),
            Deployer::new(api.clone(), config.clone()),
            Arc::new(NoopEventPublisher),
            config,
        ));
        (ctx, api)
    }

    fn export(federated: bool) -> ServiceExport {
        let mut metadata_annotations = std::collections::BTreeMap::new();
        if federated {
            metadata_annotations.insert(
                annotations::EXPORT_FEDERATION.to_string(),
                annotations::FEDERATION_LATTICE.to_string(),
            );
        }
        ServiceExport {
            metadata: ObjectMeta {
                name: Some("tg1".to_string()),
                namespace: Some("ns1".to_string()),
                annotations: Some(metadata_annotations),
                finalizers: Some(vec![annotations::FINALIZER.to_string()]),
                ..Default::default()
            },
            spec: ServiceExportSpec {},
            status: None,
        }
    }

    #[tokio::test]
    async fn story_federated_export_publishes_then_withdraws() {
        let mut kube = MockControllerKubeClient::new();
        kube.expect_patch_export_status()
            .withf(|_, status| status.conditions[0].status == "True")
            .times(1)
            .returning(|_, _| Ok(()));
        kube.expect_patch_finalizers()
            .withf(|kind, _, finalizers| {
                *kind == ObjectKind::ServiceExport && finalizers.is_empty()
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let (ctx, api) = harness(kube);

        reconcile(Arc::new(export(true)), ctx.clone())
            .await
            .expect("export should reconcile");
        assert_eq!(api.target_groups().len(), 1);

        let mut deleted = export(true);
        deleted.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        reconcile(Arc::new(deleted), ctx)
            .await
            .expect("deletion should reconcile");
        assert!(api.target_groups().is_empty());
    }

    #[tokio::test]
    async fn story_unfederated_export_reports_not_exported() {
        let mut kube = MockControllerKubeClient::new();
        kube.expect_patch_export_status()
            .withf(|_, status| status.conditions[0].status == "False")
            .times(1)
            .returning(|_, _| Ok(()));
        let (ctx, api) = harness(kube);

        reconcile(Arc::new(export(false)), ctx)
            .await
            .expect("export should reconcile");

        assert!(api.target_groups().is_empty());
    }
}
