//! Controller configuration
//!
//! Every process-wide setting lives in [`ControllerConfig`] and is passed
//! explicitly into each builder and synthesizer invocation. There is no
//! mutable package state: a reconciliation sees exactly the configuration it
//! was handed.

use clap::{Args, ValueEnum};

use crate::annotations::DEFAULT_CONTROLLER_NAME;
use crate::Error;

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// JSON lines (production)
    #[default]
    Json,
    /// Human-readable text
    Text,
}

/// Settings shared by all controllers and model builders
#[derive(Clone, Debug, Args)]
pub struct ControllerConfig {
    /// controllerName this instance claims in GatewayClass resources
    #[arg(long, env = "CONTROLLER_NAME", default_value = DEFAULT_CONTROLLER_NAME)]
    pub controller_name: String,

    /// Name of the Kubernetes cluster (used in tags and target group identity)
    #[arg(long, env = "CLUSTER_NAME")]
    pub cluster_name: String,

    /// VPC the cluster runs in
    #[arg(long, env = "CLUSTER_VPC_ID")]
    pub vpc_id: String,

    /// AWS account that owns the mesh resources
    #[arg(long, env = "AWS_ACCOUNT_ID", default_value = "")]
    pub account_id: String,

    /// AWS region
    #[arg(long, env = "REGION", default_value = "us-west-2")]
    pub region: String,

    /// Service network every route is associated with in override mode
    #[arg(long, env = "DEFAULT_SERVICE_NETWORK")]
    pub default_service_network: Option<String>,

    /// Associate every route with the default service network, ignoring gateways
    #[arg(long, env = "ENABLE_SERVICE_NETWORK_OVERRIDE", default_value_t = false)]
    pub enable_service_network_override: bool,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

impl ControllerConfig {
    /// Create a configuration for the given cluster and VPC with defaults elsewhere
    pub fn new(cluster_name: impl Into<String>, vpc_id: impl Into<String>) -> Self {
        Self {
            controller_name: DEFAULT_CONTROLLER_NAME.to_string(),
            cluster_name: cluster_name.into(),
            vpc_id: vpc_id.into(),
            account_id: String::new(),
            region: "us-west-2".to_string(),
            default_service_network: None,
            enable_service_network_override: false,
            log_format: LogFormat::Json,
        }
    }

    /// Validate the configuration before starting controllers
    pub fn validate(&self) -> Result<(), Error> {
        if self.cluster_name.trim().is_empty() {
            return Err(Error::validation_for_field(
                "config",
                "cluster_name",
                "cluster name must not be empty",
            ));
        }
        if self.vpc_id.trim().is_empty() {
            return Err(Error::validation_for_field(
                "config",
                "vpc_id",
                "VPC ID must not be empty",
            ));
        }
        if self.enable_service_network_override && self.override_service_network().is_none() {
            return Err(Error::validation_for_field(
                "config",
                "default_service_network",
                "service network override requires a default service network",
            ));
        }
        Ok(())
    }

    /// The service network forced onto every route, when override mode is on
    pub fn override_service_network(&self) -> Option<&str> {
        if !self.enable_service_network_override {
            return None;
        }
        self.default_service_network
            .as_deref()
            .filter(|name| !name.is_empty())
    }

    /// Value of the `ManagedBy` tag stamped on every mesh resource we create
    pub fn managed_by(&self) -> String {
        format!("{}/{}/{}", self.account_id, self.cluster_name, self.vpc_id)
    }
}
