//! Read-only view of the cluster used by the builders
//!
//! The builders never talk to the API server directly; every lookup goes
//! through [`ClusterReader`] so the pipeline can be exercised with mocks.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::{Api, ListParams};
use kube::{Client, Resource};
use lattice_common::crd::{
    AccessLogPolicy, GRPCRoute, Gateway, GatewayClass, HTTPRoute, IAMAuthPolicy, ServiceExport,
    ServiceImport, TLSRoute, TargetGroupPolicy, VpcAssociationPolicy,
};
use lattice_common::kube_utils::is_not_found;
use lattice_common::{Error, Result};
use serde::de::DeserializeOwned;

#[cfg(test)]
use mockall::automock;

use crate::policy::{AnyPolicy, PolicyKind};
use crate::route::{Route, RouteKind};

/// Label EndpointSlices carry to name their Service
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Trait abstracting cluster reads for the model builders
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterReader: Send + Sync {
    /// Get a Gateway
    async fn get_gateway(&self, namespace: &str, name: &str) -> Result<Option<Gateway>>;

    /// Get a GatewayClass
    async fn get_gateway_class(&self, name: &str) -> Result<Option<GatewayClass>>;

    /// Get a Namespace (for allowed-routes label selectors)
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;

    /// Get a route of the given kind
    async fn get_route(&self, kind: RouteKind, namespace: &str, name: &str)
        -> Result<Option<Route>>;

    /// Get a Service
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    /// Get a ServiceImport
    async fn get_service_import(&self, namespace: &str, name: &str)
        -> Result<Option<ServiceImport>>;

    /// Get a ServiceExport
    async fn get_service_export(&self, namespace: &str, name: &str)
        -> Result<Option<ServiceExport>>;

    /// List the EndpointSlices of a Service
    async fn list_endpoint_slices(&self, namespace: &str, service: &str)
        -> Result<Vec<EndpointSlice>>;

    /// List policies of one kind in a namespace.
    ///
    /// Returns [`Error::CrdNotInstalled`] when the policy CRD is absent.
    async fn list_policies(&self, kind: PolicyKind, namespace: &str) -> Result<Vec<AnyPolicy>>;
}

/// [`ClusterReader`] backed by the Kubernetes API
pub struct KubeClusterReader {
    client: Client,
}

impl KubeClusterReader {
    /// Create a reader using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get_namespaced<K>(&self, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_namespaced<K>(&self, namespace: &str, kind: PolicyKind) -> Result<Vec<K>>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.list(&ListParams::default()).await {
            Ok(list) => Ok(list.items),
            Err(e) if is_not_found(&e) => Err(Error::crd_not_installed(kind.as_str())),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ClusterReader for KubeClusterReader {
    async fn get_gateway(&self, namespace: &str, name: &str) -> Result<Option<Gateway>> {
        self.get_namespaced(namespace, name).await
    }

    async fn get_gateway_class(&self, name: &str) -> Result<Option<GatewayClass>> {
        let api: Api<GatewayClass> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn get_route(
        &self,
        kind: RouteKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Route>> {
        Ok(match kind {
            RouteKind::Http => self
                .get_namespaced::<HTTPRoute>(namespace, name)
                .await?
                .map(Route::from),
            RouteKind::Grpc => self
                .get_namespaced::<GRPCRoute>(namespace, name)
                .await?
                .map(Route::from),
            RouteKind::Tls => self
                .get_namespaced::<TLSRoute>(namespace, name)
                .await?
                .map(Route::from),
        })
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        self.get_namespaced(namespace, name).await
    }

    async fn get_service_import(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceImport>> {
        self.get_namespaced(namespace, name).await
    }

    async fn get_service_export(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceExport>> {
        self.get_namespaced(namespace, name).await
    }

    async fn list_endpoint_slices(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Vec<EndpointSlice>> {
        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&format!("{SERVICE_NAME_LABEL}={service}"));
        Ok(api.list(&params).await?.items)
    }

    async fn list_policies(&self, kind: PolicyKind, namespace: &str) -> Result<Vec<AnyPolicy>> {
        Ok(match kind {
            PolicyKind::TargetGroup => self
                .list_namespaced::<TargetGroupPolicy>(namespace, kind)
                .await?
                .into_iter()
                .map(AnyPolicy::TargetGroup)
                .collect(),
            PolicyKind::VpcAssociation => self
                .list_namespaced::<VpcAssociationPolicy>(namespace, kind)
                .await?
                .into_iter()
                .map(AnyPolicy::VpcAssociation)
                .collect(),
            PolicyKind::AccessLog => self
                .list_namespaced::<AccessLogPolicy>(namespace, kind)
                .await?
                .into_iter()
                .map(AnyPolicy::AccessLog)
                .collect(),
            PolicyKind::IamAuth => self
                .list_namespaced::<IAMAuthPolicy>(namespace, kind)
                .await?
                .into_iter()
                .map(AnyPolicy::IamAuth)
                .collect(),
        })
    }
}
