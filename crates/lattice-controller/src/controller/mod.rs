//! Reconcilers, one per watched kind
//!
//! Every reconciler follows the same shape: add the finalizer, build the
//! object's stack, deploy it, write status back. A deleted object is built
//! with its resources marked deleted, deployed, and only then released.

pub mod access_log_policy;
pub mod gateway;
pub mod route;
pub mod service_export;

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::Resource;
use lattice_common::kube_utils::NamespacedName;
use lattice_common::Error;
use tracing::error;

use crate::context::Context;

/// Periodic resync of live objects so drift in the mesh is repaired
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Requeue delay for retryable failures
pub const RETRY_DELAY: Duration = Duration::from_secs(30);

/// Error policy shared by every controller
///
/// - `Requeue` errors come back after the delay they carry
/// - Other retryable errors come back after [`RETRY_DELAY`]
/// - Permanent errors (validation, foreign ownership) wait for a spec change
pub fn error_policy<K>(obj: Arc<K>, error: &Error, _ctx: Arc<Context>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    error!(
        ?error,
        kind = %K::kind(&()),
        object = %NamespacedName::of(obj.as_ref()),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    match error.requeue_after() {
        Some(after) => Action::requeue(after),
        None if error.is_retryable() => Action::requeue(RETRY_DELAY),
        None => Action::await_change(),
    }
}
