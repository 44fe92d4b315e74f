//! Lattice gateway controller - Gateway API for Amazon VPC Lattice

use std::sync::Arc;

use clap::{Args, CommandFactory, Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};

use lattice_common::config::ControllerConfig;
use lattice_common::crd::owned_crds;
use lattice_common::telemetry::{init_telemetry, TelemetryConfig};
use lattice_common::FIELD_MANAGER;
use lattice_controller::runner::build_controllers;
use lattice_controller::Context;
use lattice_deploy::{InMemoryLatticeApi, LatticeApi};

/// Lattice gateway controller - reconciles Gateway API resources into VPC Lattice
#[derive(Parser, Debug)]
#[command(name = "lattice-gateway-controller", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controllers
    ///
    /// Watches Gateways, HTTPRoutes, GRPCRoutes, TLSRoutes, ServiceExports
    /// and AccessLogPolicies and keeps the mesh in sync with them.
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Deploy to an in-process mesh instead of the cloud API
    #[arg(long, env = "DRY_RUN", default_value_t = false)]
    dry_run: bool,

    #[command(flatten)]
    config: ControllerConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        for crd in owned_crds() {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    match cli.command {
        Some(Commands::Run(args)) => run(args).await,
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let RunArgs { dry_run, config } = args;

    init_telemetry(TelemetryConfig {
        service_name: FIELD_MANAGER.to_string(),
        format: config.log_format,
    })?;
    config.validate()?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kube client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let api: Arc<dyn LatticeApi> = if dry_run {
        tracing::warn!("dry run: deploying to an in-process mesh");
        Arc::new(InMemoryLatticeApi::new(&config.account_id, &config.region))
    } else {
        anyhow::bail!("no cloud mesh client is linked into this build; pass --dry-run");
    };

    tracing::info!(
        controller = %config.controller_name,
        cluster = %config.cluster_name,
        vpc = %config.vpc_id,
        region = %config.region,
        "Starting controllers"
    );
    let ctx = Arc::new(Context::from_client(client.clone(), config, api));
    let controllers = build_controllers(client, ctx);

    futures::future::join_all(controllers).await;
    tracing::info!("Controllers stopped");
    Ok(())
}

/// Ensure every CRD this controller owns is installed
///
/// Installed with server-side apply so the CRD versions always match the
/// controller version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in owned_crds() {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!("Installing {} CRD...", name);
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", name, e))?;
    }

    tracing::info!("All CRDs installed/updated");
    Ok(())
}
