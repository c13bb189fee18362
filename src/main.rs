//! reqtrace - instrumented demo server for the transaction engine

use clap::Parser;
use reqtrace::config::Config;
use reqtrace::lifecycle::{LifecycleAdapter, LifecycleManager};
use reqtrace::metrics::server::MetricsServer;
use reqtrace::server::Server;
use reqtrace::telemetry;
use reqtrace::tracer::{AgentTracer, LogReporter, NoopReporter, Reporter};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// reqtrace - request transaction tracing demo server
#[derive(Parser, Debug)]
#[command(name = "reqtrace")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file; defaults apply when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level filter, overrides logging.level (RUST_LOG still wins)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Use the mapped-flow hook shape instead of the scoped one
    #[arg(long)]
    mapped_flow: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    telemetry::init_subscriber(&config.logging)?;

    info!("Starting reqtrace v{}", reqtrace::VERSION);
    if let Some(path) = &args.config {
        info!(path = %path.display(), "loaded configuration");
    }

    let reporter: Arc<dyn Reporter> = match config.reporter.kind.as_str() {
        "none" => Arc::new(NoopReporter),
        _ => Arc::new(LogReporter),
    };
    let tracer = AgentTracer::from_config(&config, reporter);
    let lifecycle = LifecycleManager::from_config(&config, Arc::new(tracer));

    let mut metrics_server = if config.metrics.enabled {
        let mut server = MetricsServer::new(&config.metrics.address);
        server.start().await?;
        Some(server)
    } else {
        None
    };

    let adapter = if args.mapped_flow {
        LifecycleAdapter::MappedFlow
    } else {
        LifecycleAdapter::ScopedLifecycle
    };

    let server = Server::bind(&config.server.address, lifecycle)
        .await?
        .with_adapter(adapter);

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c, shutting down");
            }
        })
        .await;

    if let Some(server) = metrics_server.as_mut() {
        server.shutdown().await;
    }

    Ok(())
}
