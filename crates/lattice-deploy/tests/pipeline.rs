//! Build-then-deploy stories against the in-memory mesh backend

use std::sync::Arc;

use kube::api::ObjectMeta;
use lattice_common::annotations::{self, TAG_MANAGED_BY, TAG_SOURCE_TYPE};
use lattice_common::crd::{Gateway, ServiceExport, ServiceExportSpec};
use lattice_common::{ControllerConfig, Result};
use lattice_deploy::api::{ActionRecord, ServiceInput, Tags, WeightedTargetRecord};
use lattice_deploy::{DeployOutcome, Deployer, InMemoryLatticeApi, LatticeApi};
use lattice_model::fixture::{self, FixtureReader};
use lattice_model::{
    BuildContext, Route, RouteModelBuilder, ServiceExportModelBuilder, ServiceNetworkBuilder,
};

struct Harness {
    api: Arc<InMemoryLatticeApi>,
    deployer: Deployer,
    config: ControllerConfig,
}

impl Harness {
    fn new() -> Self {
        let config = fixture::config();
        let api = Arc::new(InMemoryLatticeApi::new(&config.account_id, &config.region));
        let deployer = Deployer::new(api.clone(), config.clone());
        Self {
            api,
            deployer,
            config,
        }
    }

    async fn deploy_gateway(&self, reader: &FixtureReader) -> DeployOutcome {
        let gateway: Gateway = reader
            .gateways
            .values()
            .next()
            .cloned()
            .expect("fixture should hold a gateway");
        let stack = ServiceNetworkBuilder::new(BuildContext::new(reader, &self.config))
            .build(&gateway)
            .await
            .expect("gateway should build");
        self.deployer
            .deploy(&stack)
            .await
            .expect("gateway should deploy")
    }

    async fn deploy_export(
        &self,
        reader: &FixtureReader,
        export: &ServiceExport,
    ) -> Result<DeployOutcome> {
        let stack = ServiceExportModelBuilder::new(BuildContext::new(reader, &self.config))
            .build(export)
            .await?;
        self.deployer.deploy(&stack).await
    }

    async fn deploy_route(&self, reader: &FixtureReader, route: &Route) -> Result<DeployOutcome> {
        let stack = RouteModelBuilder::new(BuildContext::new(reader, &self.config))
            .build(route)
            .await?;
        self.deployer.deploy(&stack).await
    }
}

fn annotated_route(annotations: &[(&str, &str)]) -> Route {
    let mut route =
        fixture::http_route("ns1", "svc1", "gw1", vec![fixture::backend("tg1", 80, 10)]);
    route.metadata.annotations = Some(
        annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    );
    fixture::accept_parents(route.into())
}

#[tokio::test]
async fn story_route_deploys_end_to_end_and_redeploys_as_a_no_op() {
    let harness = Harness::new();
    let (reader, route) = fixture::standard_graph();

    let network = harness.deploy_gateway(&reader).await;
    assert!(network.service_network_arn.is_some());

    let outcome = harness
        .deploy_route(&reader, &route)
        .await
        .expect("route should deploy");

    let services = harness.api.services();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].service.name, "svc1-ns1");
    assert_eq!(outcome.service_dns.as_deref(), Some(services[0].dns_name.as_str()));

    let associations = harness.api.service_network_associations();
    assert_eq!(associations.len(), 1);
    assert_eq!(
        associations[0].service_network_id,
        harness.api.service_networks()[0].id
    );

    let target_groups = harness.api.target_groups();
    assert_eq!(target_groups.len(), 1);
    let targets = harness.api.targets(&target_groups[0].id);
    assert_eq!(targets.len(), 2);
    assert!(targets.iter().all(|t| t.port == 8080));

    let listeners = harness.api.listeners();
    assert_eq!(listeners.len(), 1);
    assert_eq!(listeners[0].listener.port, 80);

    let rules = harness.api.rules();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].rule.priority, 1);
    assert_eq!(
        rules[0].rule.action,
        ActionRecord::Forward(vec![WeightedTargetRecord {
            target_group_id: target_groups[0].id.clone(),
            weight: 10,
        }])
    );

    let mutations = harness.api.mutations();
    harness
        .deploy_route(&reader, &route)
        .await
        .expect("redeploy should succeed");
    assert_eq!(harness.api.mutations(), mutations);
}

#[tokio::test]
async fn story_route_before_gateway_requeues_then_converges() {
    let harness = Harness::new();
    let (reader, route) = fixture::standard_graph();

    let err = harness
        .deploy_route(&reader, &route)
        .await
        .expect_err("missing service network should fail");
    assert!(err.requeue_after().is_some());

    harness.deploy_gateway(&reader).await;
    harness
        .deploy_route(&reader, &route)
        .await
        .expect("route should deploy once the network exists");
    assert_eq!(harness.api.services().len(), 1);
    assert_eq!(harness.api.service_network_associations().len(), 1);
}

#[tokio::test]
async fn story_deleted_route_tears_everything_down() {
    let harness = Harness::new();
    let (reader, route) = fixture::standard_graph();
    harness.deploy_gateway(&reader).await;
    harness
        .deploy_route(&reader, &route)
        .await
        .expect("route should deploy");

    let deleted = fixture::deleted(route);
    let outcome = harness
        .deploy_route(&reader, &deleted)
        .await
        .expect("deletion should deploy");

    assert!(outcome.service_arn.is_none());
    assert!(harness.api.services().is_empty());
    assert!(harness.api.listeners().is_empty());
    assert!(harness.api.rules().is_empty());
    assert!(harness.api.service_network_associations().is_empty());
    assert!(harness.api.target_groups().is_empty());
    assert!(harness.deployer.registry().is_empty());
    assert_eq!(harness.api.service_networks().len(), 1);
}

#[tokio::test]
async fn story_endpoint_changes_sync_targets() {
    let harness = Harness::new();
    let (mut reader, route) = fixture::standard_graph();
    harness.deploy_gateway(&reader).await;
    harness
        .deploy_route(&reader, &route)
        .await
        .expect("route should deploy");

    reader.endpoint_slices.insert(
        ("ns1".to_string(), "tg1".to_string()),
        vec![fixture::endpoint_slice(
            "ns1",
            "tg1",
            &[(Some(""), 8080)],
            &[fixture::ready("10.0.0.2"), fixture::ready("10.0.0.3")],
        )],
    );
    harness
        .deploy_route(&reader, &route)
        .await
        .expect("route should redeploy");

    let tg = &harness.api.target_groups()[0];
    let ips: Vec<String> = harness.api.targets(&tg.id).into_iter().map(|t| t.ip).collect();
    assert_eq!(ips, vec!["10.0.0.2".to_string(), "10.0.0.3".to_string()]);
}

#[tokio::test]
async fn story_backend_change_releases_old_target_group() {
    let harness = Harness::new();
    let (reader, route) = fixture::standard_graph();
    harness.deploy_gateway(&reader).await;
    harness
        .deploy_route(&reader, &route)
        .await
        .expect("route should deploy");
    let old = harness.api.target_groups()[0].clone();

    let moved = fixture::accept_parents(
        fixture::http_route("ns1", "svc1", "gw1", vec![fixture::backend("tg2", 80, 10)]).into(),
    );
    let reader = reader
        .with_service(
            fixture::service("ns1", "tg2", &[(None, 80)]),
            vec![fixture::endpoint_slice(
                "ns1",
                "tg2",
                &[(Some(""), 9090)],
                &[fixture::ready("10.0.1.1")],
            )],
        )
        .with_route(moved.clone());
    harness
        .deploy_route(&reader, &moved)
        .await
        .expect("route should redeploy");

    let target_groups = harness.api.target_groups();
    assert_eq!(target_groups.len(), 1);
    assert_ne!(target_groups[0].target_group.name, old.target_group.name);
    assert_eq!(harness.api.rules().len(), 1);
}

#[tokio::test]
async fn story_foreign_service_is_only_taken_over_when_allowed() {
    let harness = Harness::new();
    let (reader, route) = fixture::standard_graph();
    harness.deploy_gateway(&reader).await;

    let foreign_owner = "999988887777/other-cluster/vpc-9";
    harness
        .api
        .create_service(ServiceInput {
            name: "svc1-ns1".to_string(),
            custom_domain_name: None,
            certificate_arn: None,
            auth_policy: None,
            tags: Tags::from([(TAG_MANAGED_BY.to_string(), foreign_owner.to_string())]),
        })
        .await
        .expect("foreign service should be created");

    let err = harness
        .deploy_route(&reader, &route)
        .await
        .expect_err("foreign service should not be adopted");
    assert!(!err.is_retryable());

    let route = annotated_route(&[(annotations::ALLOW_TAKEOVER_FROM, foreign_owner)]);
    let reader = reader.with_route(route.clone());
    harness
        .deploy_route(&reader, &route)
        .await
        .expect("takeover should succeed");

    let services = harness.api.services();
    assert_eq!(services.len(), 1);
    assert_eq!(
        services[0].service.tags.get(TAG_MANAGED_BY),
        Some(&harness.config.managed_by())
    );
}

#[tokio::test]
async fn story_federated_export_publishes_target_group() {
    let harness = Harness::new();
    let (reader, _) = fixture::standard_graph();
    let export = ServiceExport {
        metadata: ObjectMeta {
            name: Some("tg1".to_string()),
            namespace: Some("ns1".to_string()),
            annotations: Some(
                [(
                    annotations::EXPORT_FEDERATION.to_string(),
                    annotations::FEDERATION_LATTICE.to_string(),
                )]
                .into(),
            ),
            ..Default::default()
        },
        spec: ServiceExportSpec {},
        status: None,
    };

    let stack = ServiceExportModelBuilder::new(BuildContext::new(&reader, &harness.config))
        .build(&export)
        .await
        .expect("export should build");
    harness.deployer.deploy(&stack).await.expect("export should deploy");

    let target_groups = harness.api.target_groups();
    assert_eq!(target_groups.len(), 1);
    assert_eq!(
        target_groups[0].target_group.tags.get(TAG_SOURCE_TYPE).map(String::as_str),
        Some("ServiceExport")
    );
    assert_eq!(harness.api.targets(&target_groups[0].id).len(), 2);

    let mutations = harness.api.mutations();
    harness.deployer.deploy(&stack).await.expect("redeploy should succeed");
    assert_eq!(harness.api.mutations(), mutations);
}

/// Gateway, a federated export of `ns1/tg1` and route `svc1` forwarding to
/// the matching local ServiceImport
fn shared_export_graph() -> (FixtureReader, Route, ServiceExport) {
    let (reader, _) = fixture::standard_graph();
    let export = fixture::service_export("ns1", "tg1");
    let route = fixture::accept_parents(
        fixture::http_route("ns1", "svc1", "gw1", vec![fixture::import_backend("tg1", 80, 10)])
            .into(),
    );
    let reader = reader
        .with_service_export(export.clone())
        .with_service_import(fixture::service_import("ns1", "tg1"))
        .with_route(route.clone());
    (reader, route, export)
}

#[tokio::test]
async fn story_deleted_route_keeps_the_group_its_export_still_wants() {
    let harness = Harness::new();
    let (reader, route, export) = shared_export_graph();
    harness.deploy_gateway(&reader).await;
    harness
        .deploy_export(&reader, &export)
        .await
        .expect("export should deploy");
    harness
        .deploy_route(&reader, &route)
        .await
        .expect("route should deploy");

    let target_groups = harness.api.target_groups();
    assert_eq!(target_groups.len(), 1);
    let shared = target_groups[0].clone();
    let state = harness.deployer.registry().get(&shared.target_group.name);
    assert!(state.by_backend_ref && state.by_service_export);

    harness
        .deploy_route(&reader, &fixture::deleted(route))
        .await
        .expect("route deletion should deploy");
    assert!(harness.api.services().is_empty());
    assert_eq!(harness.api.target_groups(), vec![shared.clone()]);
    assert_eq!(harness.api.targets(&shared.id).len(), 2);

    let deleted = fixture::deleted_export(export);
    let reader = reader.with_service_export(deleted.clone());
    harness
        .deploy_export(&reader, &deleted)
        .await
        .expect("export deletion should deploy");
    assert!(harness.api.target_groups().is_empty());
    assert!(harness.deployer.registry().is_empty());
}

#[tokio::test]
async fn story_deleted_export_waits_for_the_route_sharing_its_group() {
    let harness = Harness::new();
    let (reader, route, export) = shared_export_graph();
    harness.deploy_gateway(&reader).await;
    harness
        .deploy_export(&reader, &export)
        .await
        .expect("export should deploy");
    harness
        .deploy_route(&reader, &route)
        .await
        .expect("route should deploy");

    let deleted = fixture::deleted_export(export);
    let reader = reader.with_service_export(deleted.clone());
    let err = harness
        .deploy_export(&reader, &deleted)
        .await
        .expect_err("export should wait for the route");
    assert!(err.requeue_after().is_some());
    assert_eq!(harness.api.target_groups().len(), 1);
    assert_eq!(harness.api.rules().len(), 1);

    harness
        .deploy_route(&reader, &fixture::deleted(route))
        .await
        .expect("route deletion should deploy");
    assert!(harness.api.target_groups().is_empty());

    harness
        .deploy_export(&reader, &deleted)
        .await
        .expect("export deletion should now complete");
    assert!(harness.deployer.registry().is_empty());
}
