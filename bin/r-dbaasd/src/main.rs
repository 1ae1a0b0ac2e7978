//! ---
//! dbaas_section: "06-daemon"
//! dbaas_subsection: "binary"
//! dbaas_type: "source"
//! dbaas_scope: "code"
//! dbaas_description: "Binary entrypoint for the R-DBaaS simulation daemon."
//! dbaas_version: "v0.0.0-prealpha"
//! dbaas_owner: "tbd"
//! ---
mod fleet;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use r_dbaas_common::config::LoadedAppConfig;
use r_dbaas_common::{init_tracing, AppConfig, VersionInfo};
use r_dbaas_metrics::{new_registry, spawn_http_server, DaemonMetrics};
use tokio::signal;
use tracing::{info, warn};

use crate::fleet::Fleet;

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    about = "R-DBaaS control plane and guest agent simulator",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print extended version information and exit"
    )]
    version: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Provision the configured fleet in-process and keep it running")]
    Simulate {
        #[arg(
            long,
            value_name = "SECS",
            help = "Stop after this many seconds instead of waiting for ctrl-c"
        )]
        duration: Option<u64>,
    },
    #[command(about = "Validate configuration and print a fleet summary")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let version = VersionInfo::current();
    if cli.version {
        println!("{}", version.extended());
        return Ok(());
    }
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/example.toml"));

    let LoadedAppConfig { config, source } = AppConfig::load_with_source(&candidates)?;
    init_tracing("r-dbaasd", &config.logging)?;
    info!(config_path = %source.display(), version = %version.cli_string(), "configuration loaded");

    match cli.command.unwrap_or(Commands::Simulate { duration: None }) {
        Commands::Simulate { duration } => {
            simulate(config, duration.map(Duration::from_secs), version).await?
        }
        Commands::CheckConfig => render_summary(&config, &source),
    }
    Ok(())
}

async fn simulate(
    config: AppConfig,
    duration: Option<Duration>,
    version: VersionInfo,
) -> Result<()> {
    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(registry.clone())?;
    daemon_metrics.inc_start();
    daemon_metrics.set_build_info(&version.semver, &version.git_sha, &version.protocol.to_string());

    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(registry.clone(), config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let fleet = Fleet::start(&config, registry)?;
    let running = fleet.prepare_all().await;
    info!(running, total = fleet.instance_count(), "fleet prepared");

    let reports = match fleet.bootstrap_clusters(&config).await {
        Ok(reports) => reports,
        Err(err) => {
            warn!(error = %err, "cluster bootstrap aborted");
            Vec::new()
        }
    };
    let ready = reports.iter().filter(|report| report.is_ready()).count();
    daemon_metrics.set_ready_clusters(ready);
    info!(ready, total = reports.len(), "clusters bootstrapped");

    match duration {
        Some(duration) => {
            info!(?duration, "simulation running");
            tokio::select! {
                _ = tokio::time::sleep(duration) => info!("simulation duration elapsed"),
                result = signal::ctrl_c() => {
                    result?;
                    info!("ctrl-c received; shutting down");
                }
            }
        }
        None => {
            info!("simulation running; waiting for termination signal");
            signal::ctrl_c().await?;
            info!("ctrl-c received; shutting down");
        }
    }

    fleet.shutdown().await;
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

fn render_summary(config: &AppConfig, source: &std::path::Path) {
    println!("Configuration: {} (valid)", source.display());
    println!(
        "Proxy version cap: {}\nAgent protocol: {}",
        config.proxy.version_cap, config.agent.protocol_version
    );
    println!("Instances: {}", config.fleet.len());
    for (instance_id, instance) in &config.fleet {
        let version = instance
            .protocol_version
            .unwrap_or(config.agent.protocol_version);
        println!(
            "  {} [{}] protocol {} mount {}",
            instance_id,
            instance.datastore,
            version,
            instance.mount_point.display()
        );
    }
    for (cluster_id, members) in config.clusters() {
        println!("Cluster {}: {}", cluster_id, members.join(", "));
    }
}
