//! minifleet controller binary

use clap::{Parser, Subcommand};
use minifleet::common::{format_bytes, ControllerConfig, LogFormat};
use minifleet::{placement, Controller, Manifest};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minifleet")]
#[command(version = minifleet::VERSION)]
#[command(about = "Placement and failover controller for small mixed-role clusters")]
struct Cli {
    /// Config file (TOML); MINIFLEET__* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller
    Serve {
        /// Cluster manifest
        #[arg(long)]
        manifest: Option<PathBuf>,

        /// Bind address for the admin API
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Run replicas in-process instead of calling node agents
        #[arg(long)]
        simulate: bool,
    },
    /// Print the placement a manifest produces with every node ready
    Plan {
        #[arg(long)]
        manifest: PathBuf,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Check a manifest without running anything
    Validate {
        #[arg(long)]
        manifest: PathBuf,
    },
}

fn init_tracing(config: &ControllerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

fn print_plan(manifest_path: &Path, json: bool) -> anyhow::Result<()> {
    let manifest = Manifest::load(manifest_path)?;
    let nodes = manifest
        .nodes
        .iter()
        .map(|decl| decl.to_node())
        .collect::<minifleet::Result<Vec<_>>>()?;
    let plan = placement::plan(&manifest.volumes, &manifest.services, &nodes)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!("Volumes:");
    for volume in &manifest.volumes {
        println!(
            "  {:<20} {} x {:<10} -> {}",
            volume.id,
            volume.desired_replica_count,
            format_bytes(volume.size_bytes),
            plan.volumes.nodes_for(&volume.id).join(", ")
        );
    }
    println!("Services:");
    for service in &manifest.services {
        println!(
            "  {:<20} {} x :{:<9} -> {}",
            service.id,
            service.desired_replica_count,
            service.port,
            plan.services.nodes_for(&service.id).join(", ")
        );
    }
    for warning in &plan.warnings {
        println!("warning: {}", warning);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = ControllerConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            manifest,
            bind,
            simulate,
        } => {
            // CLI flags win over file and environment
            if let Some(manifest) = manifest {
                config.manifest_path = manifest;
            }
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            init_tracing(&config);
            Controller::new(config).simulate(simulate).serve().await?;
        }
        Commands::Plan { manifest, json } => {
            init_tracing(&config);
            print_plan(&manifest, json)?;
        }
        Commands::Validate { manifest } => {
            let manifest = Manifest::load(&manifest)?;
            println!(
                "ok: {} nodes, {} volumes, {} services",
                manifest.nodes.len(),
                manifest.volumes.len(),
                manifest.services.len()
            );
        }
    }

    Ok(())
}
