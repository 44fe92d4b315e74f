//! Kubernetes Events for routes, gateways and policies.
//!
//! Controllers report deploy outcomes and unresolved backends as Events on
//! the object they reconcile, visible via `kubectl describe`. Publishing is
//! fire-and-forget: a failed Event is logged and never fails reconciliation.

use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// One Event about a reconciled object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectEvent {
    /// Normal or Warning
    pub type_: EventType,
    /// Machine-readable reason, one of [`reasons`]
    pub reason: &'static str,
    /// What the controller was doing, one of [`actions`]
    pub action: &'static str,
    /// Human-readable detail
    pub note: String,
}

impl ObjectEvent {
    /// A Normal event
    pub fn normal(reason: &'static str, action: &'static str, note: impl Into<String>) -> Self {
        Self {
            type_: EventType::Normal,
            reason,
            action,
            note: note.into(),
        }
    }

    /// A Warning event
    pub fn warning(reason: &'static str, action: &'static str, note: impl Into<String>) -> Self {
        Self {
            type_: EventType::Warning,
            ..Self::normal(reason, action, note)
        }
    }
}

impl From<ObjectEvent> for Event {
    fn from(event: ObjectEvent) -> Self {
        Event {
            type_: event.type_,
            reason: event.reason.to_string(),
            note: Some(event.note),
            action: event.action.to_string(),
            secondary: None,
        }
    }
}

/// Publishes Events on Kubernetes objects
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish `event` on `object`
    async fn publish(&self, object: &ObjectReference, event: ObjectEvent);
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, object: &ObjectReference, event: ObjectEvent) {
        let reason = event.reason;
        if let Err(e) = self.recorder.publish(&event.into(), object).await {
            warn!(
                reason,
                object = ?object.name,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _object: &ObjectReference, _event: ObjectEvent) {}
}

/// Publisher that keeps every event in memory, for tests and dry runs
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<(ObjectReference, ObjectEvent)>>,
}

impl RecordingEventPublisher {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event recorded so far, oldest first
    pub fn events(&self) -> Vec<ObjectEvent> {
        match self.events.lock() {
            Ok(events) => events.iter().map(|(_, e)| e.clone()).collect(),
            Err(poisoned) => poisoned.get_ref().iter().map(|(_, e)| e.clone()).collect(),
        }
    }

    /// Reasons of every event recorded so far
    pub fn reasons(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(&self, object: &ObjectReference, event: ObjectEvent) {
        let mut events = match self.events.lock() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.push((object.clone(), event));
    }
}

/// Event reasons
pub mod reasons {
    /// Stack built and deployed to the mesh
    pub const DEPLOY_SUCCEEDED: &str = "DeploySucceeded";
    /// Stack deployment failed
    pub const DEPLOY_FAILED: &str = "DeployFailed";
    /// Model build rejected the object
    pub const BUILD_FAILED: &str = "BuildFailed";
    /// Mesh resources were removed after the object was deleted
    pub const CLEANUP_SUCCEEDED: &str = "CleanupSucceeded";
    /// A backend reference could not be resolved
    pub const BACKEND_NOT_FOUND: &str = "BackendNotFound";
}

/// Event actions
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Deleting mesh resources
    pub const DELETE: &str = "Delete";
}
