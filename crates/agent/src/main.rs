//! Workload Observer - node-resident cluster workload monitor
//!
//! Runs on every node, maps deployed workloads to their processes, samples
//! their resource usage and reports health against configured thresholds.

use anyhow::{Context, Result};
use observer_lib::{
    create_provider,
    health::{components, HealthRegistry},
    observability::{ObserverMetrics, StructuredLogger},
    topology::DirectoryService,
    ConnectionManager, DirectoryHealthReporter, Monitor, StaticDirectory, TopologyResolver,
};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const OBSERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting workload-observer");

    let config = config::AgentConfig::load()?;
    config.validate()?;
    info!(node_name = %config.node_name, "Observer configured");

    let health_registry = HealthRegistry::new();
    health_registry.register(components::RESOLVER).await;
    health_registry.register(components::PROVIDER).await;
    health_registry.register(components::REPORTER).await;

    let metrics = ObserverMetrics::new();
    let logger = StructuredLogger::new(&config.node_name);

    let provider = create_provider(&config.provider_config());
    logger.log_startup(OBSERVER_VERSION, provider.platform());

    let directory = match &config.topology_file {
        Some(path) => StaticDirectory::load(path)
            .await
            .with_context(|| format!("loading topology from {}", path.display()))?,
        None => {
            warn!("No topology file configured, no workloads will be resolved");
            StaticDirectory::default()
        }
    };
    let client: Arc<dyn DirectoryService> = Arc::new(directory);
    let connections = Arc::new(ConnectionManager::with_client(client));

    let resolver = TopologyResolver::new(
        connections.clone(),
        provider.clone(),
        config.resolver_config(),
    )
    .with_metrics(metrics.clone());
    info!(concurrency = resolver.concurrency(), "Resolver configured");

    let reporter = Arc::new(DirectoryHealthReporter::new(connections));
    let monitor = Monitor::new(resolver, provider, reporter, config.monitor_config())?
        .with_metrics(metrics.clone());

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel();
        }
    });

    let mut ticker = tokio::time::interval(config.run_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut fatal = None;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let outcome = monitor.run_cycle(&shutdown).await;
        health_registry.record_cycle(&outcome).await;
        match outcome {
            Ok(summary) => {
                health_registry.set_ready(true).await;
                debug!(entities = summary.entities, reports = summary.reports, "Cycle finished");
            }
            Err(e) if e.is_cancelled() => break,
            Err(e) if e.is_fatal() => {
                error!(error = %e, "Fatal monitoring failure");
                fatal = Some(e);
                break;
            }
            Err(e) => warn!(error = %e, "Monitoring cycle failed, retrying next interval"),
        }
    }

    let cleared = monitor.clear_reports().await;
    info!(cleared, "Cleared active health reports");
    api_handle.abort();

    match fatal {
        Some(e) => {
            logger.log_shutdown("fatal error");
            Err(e).context("observer must restart")
        }
        None => {
            logger.log_shutdown("SIGINT received");
            Ok(())
        }
    }
}
