//! Vigil - monitoring core entry point
//!
//! Runs the monitoring core as a standalone process until interrupted, or
//! runs a single health cycle and prints the report.

use anyhow::Context;
use clap::{Arg, Command};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vigil_core::config::SinkKind;
use vigil_core::health::{LocalStorageCheck, NetworkCheck, PgPinger, PingCheck};
use vigil_core::lifecycle::TcpProbe;
use vigil_core::{
    Collaborators, Dispatch, Environment, HealthAggregator, HealthCheck, JsonlSink, Lifecycle,
    LogDispatch, MemorySink, PgSink, Sink, VigilConfig, WebhookDispatch, VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = Command::new("vigil")
        .version(VERSION)
        .about("Vigil - health aggregation, redacted logging and security alerting")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (layered config/ files when omitted)"),
        )
        .arg(
            Arg::new("environment")
                .short('e')
                .long("environment")
                .value_name("ENV")
                .help("Deployment environment (development, testing, staging, production)"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)")
                .default_value("info"),
        )
        .arg(
            Arg::new("check-once")
                .long("check-once")
                .help("Run one health cycle, print the report and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = matches
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or("info");
    init_logging(log_level);

    info!(version = VERSION, "Starting Vigil");

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => {
            info!(config_path = %path, "Loading configuration");
            VigilConfig::from_file(path)
        }
        None => VigilConfig::load(),
    }
    .context("failed to load configuration")?;

    if let Some(environment) = matches.get_one::<String>("environment") {
        config.environment = environment.parse::<Environment>()?;
    }
    config.validate().context("invalid configuration")?;

    if config.metrics.enabled {
        install_prometheus(&config)?;
    }

    let (sink, mut checks) = build_sink(&config).await?;
    checks.push(Arc::new(LocalStorageCheck::from_config(&config.health)));
    checks.push(Arc::new(NetworkCheck::new(
        Arc::new(TcpProbe::from_config(&config.network)),
        config.health.default_timeout(),
    )));

    if matches.get_flag("check-once") {
        let report = HealthAggregator::new(checks, sink).run_all().await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let dispatch: Arc<dyn Dispatch> = if config.alerting.webhook_urls.is_empty() {
        Arc::new(LogDispatch)
    } else {
        Arc::new(WebhookDispatch::from_config(&config.alerting)?)
    };

    let collaborators = Collaborators::new(sink)
        .with_dispatch(dispatch)
        .with_checks(checks)
        .with_network(Arc::new(TcpProbe::from_config(&config.network)));

    let lifecycle = Lifecycle::new(config, collaborators);
    lifecycle.initialize().await?;

    if let Some(report) = lifecycle.current_health() {
        info!(overall = %report.overall(), "{}", report.summary());
    }

    setup_shutdown_signal().await;
    info!("Shutdown signal received, stopping Vigil...");

    lifecycle.teardown().await;
    info!("Vigil stopped");
    Ok(())
}

/// Initialize logging with the specified level
fn init_logging(log_level: &str) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => {
            eprintln!("Invalid log level: {}. Using 'info'", log_level);
            tracing::Level::INFO
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("vigil={},vigil_core={}", level, level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn install_prometheus(config: &VigilConfig) -> anyhow::Result<()> {
    let address: std::net::SocketAddr = format!(
        "{}:{}",
        config.metrics.prometheus_bind_address, config.metrics.prometheus_port
    )
    .parse()
    .context("invalid prometheus bind address")?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .context("failed to install prometheus exporter")?;

    info!(%address, "Prometheus exporter listening");
    Ok(())
}

/// Build the configured sink, plus any checks that share its connection
async fn build_sink(
    config: &VigilConfig,
) -> anyhow::Result<(Arc<dyn Sink>, Vec<Arc<dyn HealthCheck>>)> {
    let mut checks: Vec<Arc<dyn HealthCheck>> = Vec::new();
    let sink: Arc<dyn Sink> = match config.sink.kind {
        SinkKind::Memory => {
            warn!("Using the memory sink, records are lost on exit");
            Arc::new(MemorySink::new())
        }
        SinkKind::Jsonl => Arc::new(JsonlSink::new(&config.sink.path).await?),
        SinkKind::Postgres => {
            let url = config
                .sink
                .database_url
                .as_deref()
                .context("sink.database_url is required for the postgres sink")?;
            let sink = PgSink::connect(url, config.sink.pool_size).await?;
            checks.push(Arc::new(PingCheck::datastore(
                Arc::new(PgPinger::new(sink.pool().clone())),
                &config.health,
            )));
            Arc::new(sink)
        }
    };

    Ok((sink, checks))
}

/// Set up graceful shutdown signal handling
async fn setup_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
