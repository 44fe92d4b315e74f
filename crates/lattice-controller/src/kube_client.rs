//! Writes the controllers issue against the Kubernetes API
//!
//! Reads go through [`lattice_model::ClusterReader`]; everything that mutates
//! a watched object (finalizers, annotations, status) goes through
//! [`ControllerKubeClient`] so reconcilers can be tested against mocks.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource};
use lattice_common::crd::{
    AccessLogPolicy, GRPCRoute, Gateway, GatewayStatus, HTTPRoute, PolicyStatus, RouteStatus,
    ServiceExport, ServiceExportStatus, TLSRoute,
};
use lattice_common::kube_utils::NamespacedName;
use lattice_common::{Result, FIELD_MANAGER};
use lattice_model::RouteKind;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

#[cfg(test)]
use mockall::automock;

/// Kinds of object the controllers own a finalizer on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    /// A Gateway API route
    Route(RouteKind),
    /// Gateway
    Gateway,
    /// ServiceExport
    ServiceExport,
    /// AccessLogPolicy
    AccessLogPolicy,
}

/// Trait abstracting Kubernetes writes for the gateway controllers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControllerKubeClient: Send + Sync {
    /// Replace the finalizer list of an object
    async fn patch_finalizers(
        &self,
        kind: ObjectKind,
        id: &NamespacedName,
        finalizers: Vec<String>,
    ) -> Result<()>;

    /// Set one annotation on an object
    async fn annotate(
        &self,
        kind: ObjectKind,
        id: &NamespacedName,
        key: &str,
        value: &str,
    ) -> Result<()>;

    /// Patch the status of a route
    async fn patch_route_status(
        &self,
        kind: RouteKind,
        id: &NamespacedName,
        status: &RouteStatus,
    ) -> Result<()>;

    /// Patch the status of a Gateway
    async fn patch_gateway_status(&self, id: &NamespacedName, status: &GatewayStatus)
        -> Result<()>;

    /// Patch the status of a ServiceExport
    async fn patch_export_status(
        &self,
        id: &NamespacedName,
        status: &ServiceExportStatus,
    ) -> Result<()>;

    /// Patch the status of an AccessLogPolicy
    async fn patch_access_log_policy_status(
        &self,
        id: &NamespacedName,
        status: &PolicyStatus,
    ) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct KubeControllerClient {
    client: Client,
}

impl KubeControllerClient {
    /// Create a client wrapper
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, id: &NamespacedName) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), &id.namespace)
    }

    async fn merge<K>(&self, id: &NamespacedName, patch: &Value) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        self.api::<K>(id)
            .patch(&id.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn merge_status<K>(&self, id: &NamespacedName, patch: &Value) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        self.api::<K>(id)
            .patch_status(&id.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn merge_metadata(
        &self,
        kind: ObjectKind,
        id: &NamespacedName,
        patch: Value,
    ) -> Result<()> {
        match kind {
            ObjectKind::Route(RouteKind::Http) => self.merge::<HTTPRoute>(id, &patch).await,
            ObjectKind::Route(RouteKind::Grpc) => self.merge::<GRPCRoute>(id, &patch).await,
            ObjectKind::Route(RouteKind::Tls) => self.merge::<TLSRoute>(id, &patch).await,
            ObjectKind::Gateway => self.merge::<Gateway>(id, &patch).await,
            ObjectKind::ServiceExport => self.merge::<ServiceExport>(id, &patch).await,
            ObjectKind::AccessLogPolicy => self.merge::<AccessLogPolicy>(id, &patch).await,
        }
    }
}

#[async_trait]
impl ControllerKubeClient for KubeControllerClient {
    async fn patch_finalizers(
        &self,
        kind: ObjectKind,
        id: &NamespacedName,
        finalizers: Vec<String>,
    ) -> Result<()> {
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        self.merge_metadata(kind, id, patch).await
    }

    async fn annotate(
        &self,
        kind: ObjectKind,
        id: &NamespacedName,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let patch = json!({ "metadata": { "annotations": { (key): value } } });
        self.merge_metadata(kind, id, patch).await
    }

    async fn patch_route_status(
        &self,
        kind: RouteKind,
        id: &NamespacedName,
        status: &RouteStatus,
    ) -> Result<()> {
        let patch = json!({ "status": status });
        match kind {
            RouteKind::Http => self.merge_status::<HTTPRoute>(id, &patch).await,
            RouteKind::Grpc => self.merge_status::<GRPCRoute>(id, &patch).await,
            RouteKind::Tls => self.merge_status::<TLSRoute>(id, &patch).await,
        }
    }

    async fn patch_gateway_status(
        &self,
        id: &NamespacedName,
        status: &GatewayStatus,
    ) -> Result<()> {
        self.merge_status::<Gateway>(id, &json!({ "status": status }))
            .await
    }

    async fn patch_export_status(
        &self,
        id: &NamespacedName,
        status: &ServiceExportStatus,
    ) -> Result<()> {
        self.merge_status::<ServiceExport>(id, &json!({ "status": status }))
            .await
    }

    async fn patch_access_log_policy_status(
        &self,
        id: &NamespacedName,
        status: &PolicyStatus,
    ) -> Result<()> {
        self.merge_status::<AccessLogPolicy>(id, &json!({ "status": status }))
            .await
    }
}
