//! Controller runner - builds controller futures for each watched kind
//!
//! Each `build_*` function returns a Vec of boxed futures that can be composed
//! by the caller. Route controllers are re-triggered by the gateways they
//! attach to and by endpoint changes of the services they forward to.

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;

use lattice_common::crd::{
    AccessLogPolicy, GRPCRoute, Gateway, HTTPRoute, ServiceExport, TLSRoute,
};
use lattice_common::kube_utils::NamespacedName;
use lattice_model::reader::SERVICE_NAME_LABEL;
use lattice_model::Route;

use crate::context::Context;
use crate::controller::{self, error_policy};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build route controller futures (HTTPRoute, GRPCRoute, TLSRoute)
pub fn build_route_controllers(client: Client, ctx: Arc<Context>) -> Vec<ControllerFuture> {
    tracing::info!("- HTTPRoute controller");
    tracing::info!("- GRPCRoute controller");
    tracing::info!("- TLSRoute controller");

    vec![
        route_controller::<HTTPRoute>(client.clone(), ctx.clone(), "HTTPRoute"),
        route_controller::<GRPCRoute>(client.clone(), ctx.clone(), "GRPCRoute"),
        route_controller::<TLSRoute>(client, ctx, "TLSRoute"),
    ]
}

fn route_controller<K>(client: Client, ctx: Arc<Context>, name: &'static str) -> ControllerFuture
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    Route: From<K>,
{
    let routes: Api<K> = Api::all(client.clone());
    let controller = Controller::new(routes, watcher_config());

    let by_gateway = controller.store();
    let by_service = controller.store();

    Box::pin(
        controller
            .watches(
                Api::<Gateway>::all(client.clone()),
                watcher_config(),
                move |gateway| {
                    let routes: Vec<Route> = by_gateway
                        .state()
                        .iter()
                        .map(|r| Route::from(r.as_ref().clone()))
                        .collect();
                    let affected = routes_for_gateway(&routes, &NamespacedName::of(&gateway));
                    tracing::debug!(
                        gateway = %NamespacedName::of(&gateway),
                        affected_count = affected.len(),
                        "Triggering re-reconciliation of attached routes"
                    );
                    affected.iter().map(object_ref::<K>).collect::<Vec<_>>()
                },
            )
            .watches(
                Api::<EndpointSlice>::all(client),
                watcher_config(),
                move |slice| {
                    let Some(service) = slice.labels().get(SERVICE_NAME_LABEL) else {
                        return vec![];
                    };
                    let namespace = slice.namespace().unwrap_or_default();
                    let routes: Vec<Route> = by_service
                        .state()
                        .iter()
                        .map(|r| Route::from(r.as_ref().clone()))
                        .collect();
                    routes_for_service(&routes, &namespace, service)
                        .iter()
                        .map(object_ref::<K>)
                        .collect()
                },
            )
            .shutdown_on_signal()
            .run(controller::route::reconcile::<K>, error_policy::<K>, ctx)
            .for_each(log_reconcile_result(name)),
    )
}

/// Build the Gateway controller future
pub fn build_gateway_controllers(client: Client, ctx: Arc<Context>) -> Vec<ControllerFuture> {
    tracing::info!("- Gateway controller");

    vec![Box::pin(
        Controller::new(Api::<Gateway>::all(client), watcher_config())
            .shutdown_on_signal()
            .run(controller::gateway::reconcile, error_policy::<Gateway>, ctx)
            .for_each(log_reconcile_result("Gateway")),
    )]
}

/// Build policy and multicluster controller futures (AccessLogPolicy, ServiceExport)
pub fn build_mesh_controllers(client: Client, ctx: Arc<Context>) -> Vec<ControllerFuture> {
    tracing::info!("- AccessLogPolicy controller");
    tracing::info!("- ServiceExport controller");

    let exports = Controller::new(Api::<ServiceExport>::all(client.clone()), watcher_config())
        .watches(
            Api::<EndpointSlice>::all(client.clone()),
            watcher_config(),
            |slice| {
                let namespace = slice.namespace().unwrap_or_default();
                slice
                    .labels()
                    .get(SERVICE_NAME_LABEL)
                    .map(|service| ObjectRef::<ServiceExport>::new(service).within(&namespace))
            },
        )
        .shutdown_on_signal()
        .run(
            controller::service_export::reconcile,
            error_policy::<ServiceExport>,
            ctx.clone(),
        )
        .for_each(log_reconcile_result("ServiceExport"));

    let access_logs = Controller::new(Api::<AccessLogPolicy>::all(client), watcher_config())
        .shutdown_on_signal()
        .run(
            controller::access_log_policy::reconcile,
            error_policy::<AccessLogPolicy>,
            ctx,
        )
        .for_each(log_reconcile_result("AccessLogPolicy"));

    vec![Box::pin(exports), Box::pin(access_logs)]
}

/// Build every controller this binary runs
pub fn build_controllers(client: Client, ctx: Arc<Context>) -> Vec<ControllerFuture> {
    let mut futures = build_gateway_controllers(client.clone(), ctx.clone());
    futures.extend(build_route_controllers(client.clone(), ctx.clone()));
    futures.extend(build_mesh_controllers(client, ctx));
    futures
}

fn object_ref<K>(id: &NamespacedName) -> ObjectRef<K>
where
    K: Resource<DynamicType = ()>,
{
    ObjectRef::new(&id.name).within(&id.namespace)
}

/// Routes whose parent refs name the gateway
fn routes_for_gateway(routes: &[Route], gateway: &NamespacedName) -> Vec<NamespacedName> {
    routes
        .iter()
        .filter(|route| route.references_gateway(gateway))
        .map(Route::id)
        .collect()
}

/// Routes forwarding to the Service `namespace/service`
fn routes_for_service(routes: &[Route], namespace: &str, service: &str) -> Vec<NamespacedName> {
    routes
        .iter()
        .filter(|route| {
            let route_namespace = route.namespace();
            route.backend_refs().iter().any(|backend| {
                backend.kind() == "Service"
                    && backend.name == service
                    && backend.resolve_namespace(&route_namespace) == namespace
            })
        })
        .map(Route::id)
        .collect()
}

/// Log reconciliation results
fn log_reconcile_result<T: Debug, E: Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_model::fixture;

    fn routes() -> Vec<Route> {
        vec![
            fixture::http_route("ns1", "svc1", "gw1", vec![fixture::backend("tg1", 8080, 1)])
                .into(),
            fixture::http_route("ns2", "svc2", "other", vec![fixture::backend("tg1", 8080, 1)])
                .into(),
        ]
    }

    #[test]
    fn gateway_change_triggers_only_attached_routes() {
        let affected = routes_for_gateway(&routes(), &NamespacedName::new("ns1", "gw1"));
        assert_eq!(affected, vec![NamespacedName::new("ns1", "svc1")]);
    }

    #[test]
    fn gateway_in_another_namespace_triggers_nothing() {
        assert!(routes_for_gateway(&routes(), &NamespacedName::new("ns2", "gw1")).is_empty());
    }

    #[test]
    fn endpoint_change_triggers_routes_in_the_service_namespace() {
        let affected = routes_for_service(&routes(), "ns2", "tg1");
        assert_eq!(affected, vec![NamespacedName::new("ns2", "svc2")]);
    }
}
