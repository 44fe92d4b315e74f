//! HTTPRoute, GRPCRoute and TLSRoute reconciliation
//!
//! All three kinds funnel into [`reconcile_route`] through the [`Route`]
//! abstraction. A route only becomes ours once one of its parents is a
//! gateway of this controller's class; from then on it carries the finalizer
//! until its mesh service is gone.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::Resource;
use lattice_common::annotations::{ASSIGNED_DOMAIN_NAME, FINALIZER};
use lattice_common::events::{actions, reasons, ObjectEvent};
use lattice_common::kube_utils::NamespacedName;
use lattice_common::{Error, Result};
use lattice_model::gateway::first_controlled_gateway;
use lattice_model::{Route, RouteModelBuilder};
use tracing::{debug, info, instrument, warn};

use super::RESYNC_INTERVAL;
use crate::context::Context;
use crate::kube_client::ObjectKind;
use crate::status::route_status;

/// Reconcile a route of any supported kind
#[instrument(
    skip(obj, ctx),
    fields(kind = %K::kind(&()), route = %NamespacedName::of(obj.as_ref()))
)]
pub async fn reconcile<K>(obj: Arc<K>, ctx: Arc<Context>) -> Result<Action>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
    Route: From<K>,
{
    reconcile_route(Route::from(obj.as_ref().clone()), &ctx).await
}

/// Reconcile one route
pub async fn reconcile_route(route: Route, ctx: &Context) -> Result<Action> {
    let owned = route.finalizers().iter().any(|f| f == FINALIZER);

    if route.is_deleted() {
        if !owned {
            return Ok(Action::await_change());
        }
        return cleanup(route, ctx).await;
    }

    let attached = first_controlled_gateway(ctx.reader.as_ref(), &ctx.config, &route)
        .await?
        .is_some();
    if !attached {
        if owned {
            info!("route no longer references a controlled gateway, removing its service");
            return cleanup(route.detached(), ctx).await;
        }
        debug!("route does not reference a controlled gateway");
        return Ok(Action::await_change());
    }

    let kind = ObjectKind::Route(route.kind());
    let id = route.id();
    let object = route.object_ref();
    ctx.ensure_finalizer(kind, &id, route.finalizers()).await?;

    let mut route = route;
    let previous = route.status().cloned().unwrap_or_default();
    let mut report = route_status(ctx.reader.as_ref(), &ctx.config, &route).await?;
    *route.status_mut() = report.status.clone();

    let built = RouteModelBuilder::new(ctx.build_context()).build(&route).await;
    if let Err(e) = &built {
        if e.is_validation() {
            report.reject(&ctx.config.controller_name, &e.to_string(), route.generation());
        }
    }

    if previous != report.status {
        ctx.kube
            .patch_route_status(route.kind(), &id, &report.status)
            .await?;
        debug!(parents = report.status.parents.len(), "patched route status");
    }
    for backend in &report.unresolved_backends {
        ctx.publish(
            &object,
            ObjectEvent::warning(
                reasons::BACKEND_NOT_FOUND,
                actions::RECONCILE,
                format!("backend {backend} does not resolve, routing no traffic to it"),
            ),
        )
        .await;
    }

    let stack = match built {
        Ok(stack) => stack,
        Err(e) => {
            ctx.publish(
                &object,
                ObjectEvent::warning(reasons::BUILD_FAILED, actions::RECONCILE, e.to_string()),
            )
            .await;
            return Err(e);
        }
    };

    let outcome = match ctx.deployer.deploy(&stack).await {
        Ok(outcome) => outcome,
        Err(e) => {
            if e.requeue_after().is_none() {
                ctx.publish(
                    &object,
                    ObjectEvent::warning(reasons::DEPLOY_FAILED, actions::RECONCILE, e.to_string()),
                )
                .await;
            }
            return Err(e);
        }
    };

    if let Some(dns) = outcome.service_dns.as_deref() {
        if route.annotation(ASSIGNED_DOMAIN_NAME) != Some(dns) {
            ctx.kube.annotate(kind, &id, ASSIGNED_DOMAIN_NAME, dns).await?;
            ctx.publish(
                &object,
                ObjectEvent::normal(
                    reasons::DEPLOY_SUCCEEDED,
                    actions::RECONCILE,
                    format!("service reachable at {dns}"),
                ),
            )
            .await;
        }
    }

    info!(service = ?outcome.service_arn, "route reconciled");
    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Tear down the route's service and target groups, then release the route
async fn cleanup(route: Route, ctx: &Context) -> Result<Action> {
    let kind = ObjectKind::Route(route.kind());
    let id = route.id();

    match RouteModelBuilder::new(ctx.build_context()).build(&route).await {
        Ok(stack) => {
            ctx.deployer.deploy(&stack).await?;
            ctx.publish(
                &route.object_ref(),
                ObjectEvent::normal(
                    reasons::CLEANUP_SUCCEEDED,
                    actions::DELETE,
                    "removed mesh service",
                ),
            )
            .await;
        }
        // An unbuildable route never reached the mesh in its current form
        Err(e @ Error::Validation { .. }) => {
            warn!(error = %e, "route cannot be built for teardown, releasing it");
        }
        Err(e) => return Err(e),
    }

    ctx.release_finalizer(kind, &id, route.finalizers()).await?;
    info!("route cleaned up");
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_common::crd::{HTTPRoute, HeaderMatch, HttpRouteMatch, TlsRouteSpec};
    use lattice_common::events::RecordingEventPublisher;
    use lattice_deploy::{Deployer, InMemoryLatticeApi};
    use lattice_model::fixture::{self, FixtureReader};
    use lattice_model::{BuildContext, RouteKind, ServiceNetworkBuilder};

    use crate::kube_client::MockControllerKubeClient;
    use crate::status::reasons as status_reasons;

    struct Harness {
        ctx: Arc<Context>,
        api: Arc<InMemoryLatticeApi>,
        events: Arc<RecordingEventPublisher>,
    }

    impl Harness {
        fn new(reader: FixtureReader, kube: MockControllerKubeClient) -> Self {
            let config = fixture::config();
            let api = Arc::new(InMemoryLatticeApi::new(&config.account_id, &config.region));
            let events = Arc::new(RecordingEventPublisher::new());
            let ctx = Arc::new(Context::new(
                Arc::new(reader),
                Arc::new(kube),
                Deployer::new(api.clone(), config.clone()),
                events.clone(),
                config,
            ));
            Self { ctx, api, events }
        }

        async fn with_network(self, reader: &FixtureReader) -> Self {
            let gateway = reader
                .gateways
                .values()
                .next()
                .cloned()
                .expect("fixture should hold a gateway");
            let stack = ServiceNetworkBuilder::new(BuildContext::new(reader, &self.ctx.config))
                .build(&gateway)
                .await
                .expect("gateway should build");
            self.ctx
                .deployer
                .deploy(&stack)
                .await
                .expect("gateway should deploy");
            self
        }
    }

    fn permissive_kube() -> MockControllerKubeClient {
        let mut kube = MockControllerKubeClient::new();
        kube.expect_patch_finalizers().returning(|_, _, _| Ok(()));
        kube.expect_patch_route_status().returning(|_, _, _| Ok(()));
        kube.expect_annotate().returning(|_, _, _, _| Ok(()));
        kube
    }

    fn owned(mut route: HTTPRoute) -> HTTPRoute {
        route.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        route
    }

    fn svc1() -> HTTPRoute {
        fixture::http_route("ns1", "svc1", "gw1", vec![fixture::backend("tg1", 80, 10)])
    }

    #[tokio::test]
    async fn story_new_route_is_finalized_accepted_and_deployed() {
        let (reader, _) = fixture::standard_graph();
        let mut kube = MockControllerKubeClient::new();
        kube.expect_patch_finalizers()
            .withf(|kind, id, finalizers| {
                *kind == ObjectKind::Route(RouteKind::Http)
                    && id.to_string() == "ns1/svc1"
                    && finalizers == &vec![FINALIZER.to_string()]
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        kube.expect_patch_route_status()
            .withf(|_, _, status| status.parents.len() == 1)
            .times(1)
            .returning(|_, _, _| Ok(()));
        kube.expect_annotate()
            .withf(|_, _, key, value| {
                key == ASSIGNED_DOMAIN_NAME && value.ends_with(".vpc-lattice-svcs.us-west-2.on.aws")
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let harness = Harness::new(reader.clone(), kube).with_network(&reader).await;
        let action = reconcile(Arc::new(svc1()), harness.ctx.clone())
            .await
            .expect("route should reconcile");

        assert_eq!(action, Action::requeue(RESYNC_INTERVAL));
        assert_eq!(harness.api.services().len(), 1);
        assert_eq!(harness.api.listeners().len(), 1);
        assert_eq!(harness.api.rules().len(), 1);
    }

    #[tokio::test]
    async fn story_route_before_its_network_requeues() {
        let (reader, _) = fixture::standard_graph();
        let harness = Harness::new(reader, permissive_kube());

        let err = reconcile(Arc::new(owned(svc1())), harness.ctx.clone())
            .await
            .expect_err("missing service network should fail");

        assert!(err.requeue_after().is_some());
        assert!(harness.api.service_network_associations().is_empty());
    }

    #[tokio::test]
    async fn story_deleted_route_is_torn_down_then_released() {
        let (reader, _) = fixture::standard_graph();
        let mut kube = MockControllerKubeClient::new();
        kube.expect_patch_route_status().returning(|_, _, _| Ok(()));
        kube.expect_annotate().returning(|_, _, _, _| Ok(()));
        kube.expect_patch_finalizers()
            .withf(|_, _, finalizers| finalizers.is_empty())
            .times(1)
            .returning(|_, _, _| Ok(()));

        let harness = Harness::new(reader.clone(), kube).with_network(&reader).await;
        reconcile(Arc::new(owned(svc1())), harness.ctx.clone())
            .await
            .expect("route should reconcile");
        assert_eq!(harness.api.services().len(), 1);

        let deleted = fixture::deleted(owned(svc1()));
        let action = reconcile_route(deleted, &harness.ctx)
            .await
            .expect("deletion should reconcile");

        assert_eq!(action, Action::await_change());
        assert!(harness.api.services().is_empty());
        assert!(harness.api.target_groups().is_empty());
        assert_eq!(harness.api.service_networks().len(), 1);
    }

    #[tokio::test]
    async fn story_route_moved_off_controlled_gateways_is_cleaned_up() {
        let (reader, _) = fixture::standard_graph();
        let mut kube = MockControllerKubeClient::new();
        kube.expect_patch_route_status().returning(|_, _, _| Ok(()));
        kube.expect_annotate().returning(|_, _, _, _| Ok(()));
        kube.expect_patch_finalizers()
            .withf(|_, _, finalizers| finalizers.is_empty())
            .times(1)
            .returning(|_, _, _| Ok(()));

        let harness = Harness::new(reader.clone(), kube).with_network(&reader).await;
        reconcile(Arc::new(owned(svc1())), harness.ctx.clone())
            .await
            .expect("route should reconcile");

        let moved = owned(fixture::http_route(
            "ns1",
            "svc1",
            "someone-elses-gateway",
            vec![fixture::backend("tg1", 80, 10)],
        ));
        reconcile(Arc::new(moved), harness.ctx.clone())
            .await
            .expect("detach should reconcile");

        assert!(harness.api.services().is_empty());
        assert!(harness.api.target_groups().is_empty());
    }

    #[tokio::test]
    async fn story_route_on_foreign_gateway_is_left_alone() {
        let reader = FixtureReader::new();
        let harness = Harness::new(reader, MockControllerKubeClient::new());

        let action = reconcile(Arc::new(svc1()), harness.ctx.clone())
            .await
            .expect("foreign route should be ignored");

        assert_eq!(action, Action::await_change());
        assert_eq!(harness.api.mutations(), 0);
    }

    #[tokio::test]
    async fn story_unresolved_backend_still_deploys_the_rest() {
        let (reader, _) = fixture::standard_graph();
        let mut kube = MockControllerKubeClient::new();
        kube.expect_patch_finalizers().returning(|_, _, _| Ok(()));
        kube.expect_annotate().returning(|_, _, _, _| Ok(()));
        kube.expect_patch_route_status()
            .withf(|_, _, status| {
                status.parents[0]
                    .conditions
                    .iter()
                    .any(|c| c.type_ == "ResolvedRefs" && c.status == "False")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let harness = Harness::new(reader.clone(), kube).with_network(&reader).await;
        let route = fixture::http_route(
            "ns1",
            "svc1",
            "gw1",
            vec![fixture::backend("tg1", 80, 10), fixture::backend("gone", 80, 10)],
        );
        reconcile(Arc::new(route), harness.ctx.clone())
            .await
            .expect("route should reconcile");

        assert_eq!(harness.api.target_groups().len(), 1);
        assert_eq!(harness.api.rules().len(), 1);
        assert_eq!(
            harness.events.reasons(),
            vec![reasons::BACKEND_NOT_FOUND, reasons::DEPLOY_SUCCEEDED]
        );
    }

    #[tokio::test]
    async fn story_invalid_route_fails_without_retry() {
        let (reader, _) = fixture::standard_graph();
        let reader = reader.with_gateway(fixture::gateway(
            "ns1",
            "tls-gw",
            vec![fixture::listener("tls", 443, "TLS")],
        ));
        let harness = Harness::new(reader, permissive_kube());

        let mut route = fixture::tls_route(
            "ns1",
            "db",
            TlsRouteSpec {
                parent_refs: vec![fixture::parent("tls-gw")],
                ..Default::default()
            },
        );
        route.metadata.finalizers = Some(vec![FINALIZER.to_string()]);

        let err = reconcile(Arc::new(route), harness.ctx.clone())
            .await
            .expect_err("TLSRoute without hostnames should fail");

        assert!(!err.is_retryable());
        assert!(harness.api.services().is_empty());
        assert_eq!(harness.events.reasons(), vec![reasons::BUILD_FAILED]);
    }

    #[tokio::test]
    async fn story_unsupported_match_rejects_the_route_in_its_status() {
        let (reader, _) = fixture::standard_graph();
        let mut kube = MockControllerKubeClient::new();
        kube.expect_patch_finalizers().returning(|_, _, _| Ok(()));
        kube.expect_patch_route_status()
            .withf(|_, _, status| {
                status.parents.len() == 1
                    && status.parents[0].conditions.iter().any(|c| {
                        c.type_ == "Accepted"
                            && c.status == "False"
                            && c.reason == status_reasons::UNSUPPORTED_VALUE
                            && c.message.contains("header matches")
                    })
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let harness = Harness::new(reader.clone(), kube).with_network(&reader).await;
        let mut route = svc1();
        route.spec.rules[0].matches = vec![HttpRouteMatch {
            headers: (0..6)
                .map(|i| HeaderMatch {
                    type_: None,
                    name: format!("x-header-{i}"),
                    value: "v".to_string(),
                })
                .collect(),
            ..Default::default()
        }];

        let err = reconcile(Arc::new(route), harness.ctx.clone())
            .await
            .expect_err("six header matches should fail");

        assert!(err.is_validation());
        assert!(harness.api.services().is_empty());
        assert_eq!(harness.events.reasons(), vec![reasons::BUILD_FAILED]);
    }
}
