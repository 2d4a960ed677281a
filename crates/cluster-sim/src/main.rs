//! Cluster simulator
//!
//! Bootstraps a fixed set of nodes, deploys the initial workload, and lets
//! the orchestrator heal failures for a fixed run duration while printing
//! periodic reports to stdout.

use anyhow::Result;
use clap::Parser;
use cluster_lib::{
    health::HealthRegistry,
    observability::{ClusterMetrics, StructuredLogger},
    Cluster, Orchestrator,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{interval_at, sleep, Instant};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

use config::{LogFormat, SimulationConfig};

const SIM_VERSION: &str = env!("CARGO_PKG_VERSION");
const CLUSTER_NAME: &str = "cluster-sim";

#[derive(Parser)]
#[command(name = "cluster-sim")]
#[command(author, version, about = "Self-healing container cluster simulator", long_about = None)]
struct Args {
    /// TOML configuration file; `CLUSTER_*` environment variables override it
    #[arg(long, short, env = "CLUSTER_CONFIG")]
    config: Option<PathBuf>,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = SimulationConfig::load(args.config.as_deref())?;
    init_tracing(config.log_format);

    info!("Starting cluster-sim");

    let cluster = Arc::new(Cluster::new(
        config.container_sim(),
        config.placement(),
        config.rng_factory(),
    )?);
    for _ in 0..config.node_count {
        cluster.add_node(config.node_capacity)?;
    }

    let logger = StructuredLogger::new(CLUSTER_NAME);
    logger.log_startup(SIM_VERSION, config.node_count, config.total_capacity());

    let health = HealthRegistry::new();
    let orchestrator = Orchestrator::builder()
        .cluster(Arc::clone(&cluster))
        .monitor_config(config.monitor())
        .config(config.orchestrator())
        .policy(Box::new(config.policy()?))
        .health(health.clone())
        .logger(logger.clone())
        .build()?;

    for i in 0..config.initial_containers {
        let service = &config.services[i % config.services.len()];
        orchestrator.deploy(service)?;
    }
    info!(
        containers = config.initial_containers,
        seed = ?config.seed,
        "Initial workload deployed"
    );

    orchestrator.start().await?;
    run_reports(&orchestrator, &config, &logger).await;
    logger.log_health(&health.health().await);

    let joined = orchestrator.shutdown(config.shutdown_timeout()).await;
    if !joined {
        warn!("Some tasks were still running at exit");
    }
    let readiness = health.readiness().await;
    info!(ready = readiness.ready, reason = ?readiness.reason, "Final readiness");

    let report = orchestrator.report();
    println!("{report}");
    logger.log_report(
        report.failures,
        report.avg_repair,
        report.used_slots,
        report.capacity,
    );
    info!(summary = %serde_json::to_string(&report)?, "Final report");

    if config.dump_metrics {
        print!("{}", ClusterMetrics::new().encode_text()?);
    }

    Ok(())
}

/// Print a report every interval until the run duration elapses or Ctrl-C
async fn run_reports(
    orchestrator: &Arc<Orchestrator>,
    config: &SimulationConfig,
    logger: &StructuredLogger,
) {
    let period = config.report_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    let deadline = sleep(config.run_duration());
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                println!("{}", orchestrator.report());
                logger.log_health(&orchestrator.health().health().await);
            }
            _ = &mut deadline => {
                info!(run_duration_secs = config.run_duration_secs, "Run duration elapsed");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received");
                break;
            }
        }
    }
}
