//! Gateway API controller for Amazon VPC Lattice
//!
//! Watches Gateways, routes, ServiceExports and AccessLogPolicies, builds a
//! model stack for each and deploys it to the mesh.

#![deny(missing_docs)]

/// Shared reconciliation context
pub mod context;
/// Reconcilers, one per watched kind
pub mod controller;
/// Kubernetes writes issued by reconcilers
pub mod kube_client;
/// Controller futures wiring watches to reconcilers
pub mod runner;
/// Gateway API status conditions
pub mod status;

pub use context::Context;
pub use kube_client::{ControllerKubeClient, KubeControllerClient, ObjectKind};
