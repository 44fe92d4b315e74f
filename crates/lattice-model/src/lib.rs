//! Model-build pipeline: Gateway API objects in, typed mesh resource stacks out

#![deny(missing_docs)]

pub mod builder;
pub mod gateway;
pub mod policy;
pub mod reader;
pub mod resources;
pub mod route;
pub mod stack;

#[cfg(any(test, feature = "testing"))]
pub mod fixture;

pub use builder::{
    AccessLogSubscriptionBuilder, BuildContext, RouteModelBuilder, ServiceExportModelBuilder,
    ServiceNetworkBuilder,
};
pub use reader::{ClusterReader, KubeClusterReader};
pub use route::{Route, RouteKind};
pub use stack::{AnyResource, Resource, ResourceId, ResourceKind, Stack, StackId};
