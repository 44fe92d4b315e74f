//! Common types for the Lattice gateway controller: CRDs, errors, configuration
//! and utilities

#![deny(missing_docs)]

pub mod annotations;
pub mod config;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use config::ControllerConfig;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every server-side patch issued by the controller
pub const FIELD_MANAGER: &str = "lattice-gateway-controller";
