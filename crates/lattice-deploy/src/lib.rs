//! Deploy boundary: synthesizes model stacks into VPC Lattice resources
//!
//! The [`Deployer`] drives one stack at a time through the [`LatticeApi`]
//! seam. Synthesis is find-or-create by deterministic names and tags, so a
//! redeploy of an unchanged stack is a no-op and a crashed pass can simply
//! be repeated.

#![deny(missing_docs)]

pub mod api;
pub mod deployer;
pub mod memory;
pub mod priority;
pub mod registry;
pub mod tags;

mod synth;

pub use api::{ApiError, ApiResult, LatticeApi};
pub use deployer::{DeployOutcome, Deployer};
pub use memory::InMemoryLatticeApi;
pub use registry::{ReferencedBy, TargetGroupRegistry};
