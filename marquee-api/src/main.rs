//! Movie recommendation API server.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use marquee_api::{ApiConfig, HttpServer, SupabaseRecommender, loki_sink};
use marquee_common::init_tracing_with_layer;
use marquee_metrics::{MetricsRegistry, RemoteWriteExporter};

/// How long shutdown waits for the exporter and server.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Movie recommendation API.
#[derive(Parser, Debug)]
#[command(name = "marquee")]
#[command(about = "Serve movie recommendations and push metrics via remote write")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<String>,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error; overrides config).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration, then let the environment override it
    let mut config = if let Some(config_path) = &args.config {
        ApiConfig::load_from_file(config_path)?
    } else {
        ApiConfig::default()
    };
    config.apply_process_env()?;

    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    // Initialize logging, with Loki attached when configured
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loki = loki_sink(&config.loki);
    let (loki_layer, loki_shipper) = match loki {
        Some((layer, shipper)) => (Some(layer), Some(shipper)),
        None => (None, None),
    };
    init_tracing_with_layer(&config.logging, loki_layer)?;

    let loki_task = match loki_shipper {
        Some(shipper) => {
            info!(environment = %config.loki.environment, "Loki logging configured");
            Some(tokio::spawn(shipper.run(shutdown_rx.clone())))
        }
        None => {
            info!("Loki logging not configured, skipping");
            None
        }
    };

    info!("Starting Movie Recommendation API");

    let listen_addr = config
        .server
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    let registry = Arc::new(MetricsRegistry::default());
    let recommender = Arc::new(SupabaseRecommender::new(&config.supabase, &registry)?);

    // Start metrics export
    let exporter = RemoteWriteExporter::new(config.metrics.clone(), registry.clone())?;
    exporter.start();

    // Start HTTP server
    let http_server = HttpServer::new(recommender, registry.clone(), listen_addr);
    let http_shutdown = shutdown_rx.clone();
    let mut http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run(http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Wait for shutdown signal, or for the server to die on its own
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate_signal() => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = &mut http_task => {
            error!("HTTP server exited unexpectedly, shutting down...");
        }
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    exporter.stop(SHUTDOWN_TIMEOUT).await;

    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        if !http_task.is_finished() {
            let _ = http_task.await;
        }
        if let Some(task) = loki_task {
            let _ = task.await;
        }
    })
    .await;

    // Print final stats
    let stats = exporter.stats();
    info!(
        state = %exporter.state(),
        pushes_succeeded = stats.pushes_succeeded,
        pushes_failed = stats.pushes_failed,
        series_count = registry.series_count(),
        "Final statistics"
    );

    info!("API stopped");
    Ok(())
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}
