//! Controller context shared by every reconcile call

use std::sync::Arc;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use lattice_common::events::{EventPublisher, KubeEventPublisher, ObjectEvent};
use lattice_common::kube_utils::NamespacedName;
use lattice_common::{annotations, ControllerConfig, Result, FIELD_MANAGER};
use lattice_deploy::{Deployer, LatticeApi};
use lattice_model::{BuildContext, ClusterReader, KubeClusterReader};
use tracing::debug;

use crate::kube_client::{ControllerKubeClient, KubeControllerClient, ObjectKind};

/// Dependencies of the gateway controllers
///
/// Built once at startup and shared across all reconciliations. The
/// deployer carries the target group registry, so every controller must
/// share the same instance.
pub struct Context {
    /// Cluster reads for the model builders
    pub reader: Arc<dyn ClusterReader>,
    /// Kubernetes writes (finalizers, annotations, status)
    pub kube: Arc<dyn ControllerKubeClient>,
    /// Mesh synthesis
    pub deployer: Deployer,
    /// Kubernetes Event publishing
    pub events: Arc<dyn EventPublisher>,
    /// Process-wide settings
    pub config: ControllerConfig,
}

impl Context {
    /// Create a context from its parts
    pub fn new(
        reader: Arc<dyn ClusterReader>,
        kube: Arc<dyn ControllerKubeClient>,
        deployer: Deployer,
        events: Arc<dyn EventPublisher>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            reader,
            kube,
            deployer,
            events,
            config,
        }
    }

    /// Create a context backed by the cluster and the given mesh API
    pub fn from_client(client: Client, config: ControllerConfig, api: Arc<dyn LatticeApi>) -> Self {
        let events = Arc::new(KubeEventPublisher::new(client.clone(), FIELD_MANAGER));
        Self {
            reader: Arc::new(KubeClusterReader::new(client.clone())),
            kube: Arc::new(KubeControllerClient::new(client)),
            deployer: Deployer::new(api, config.clone()),
            events,
            config,
        }
    }

    /// Build context borrowing this context's reader and configuration
    pub fn build_context(&self) -> BuildContext<'_> {
        BuildContext::new(self.reader.as_ref(), &self.config)
    }

    /// Add the controller finalizer unless already present
    pub async fn ensure_finalizer(
        &self,
        kind: ObjectKind,
        id: &NamespacedName,
        finalizers: &[String],
    ) -> Result<()> {
        if finalizers.iter().any(|f| f == annotations::FINALIZER) {
            return Ok(());
        }
        let mut updated = finalizers.to_vec();
        updated.push(annotations::FINALIZER.to_string());
        self.kube.patch_finalizers(kind, id, updated).await?;
        debug!(object = %id, "added finalizer");
        Ok(())
    }

    /// Remove the controller finalizer if present
    pub async fn release_finalizer(
        &self,
        kind: ObjectKind,
        id: &NamespacedName,
        finalizers: &[String],
    ) -> Result<()> {
        if !finalizers.iter().any(|f| f == annotations::FINALIZER) {
            return Ok(());
        }
        let remaining = finalizers
            .iter()
            .filter(|f| *f != annotations::FINALIZER)
            .cloned()
            .collect();
        self.kube.patch_finalizers(kind, id, remaining).await?;
        debug!(object = %id, "removed finalizer");
        Ok(())
    }

    /// Publish an event; failures never surface
    pub async fn publish(&self, object: &ObjectReference, event: ObjectEvent) {
        self.events.publish(object, event).await;
    }
}
