//! runlog audit log shipper.
//!
//! Reads newline-delimited lifecycle events from stdin and ships them to
//! the configured warehouse. Stops on EOF or a shutdown signal, draining
//! whatever is still queued.

use std::sync::Arc;

use anyhow::{Context, Result};
use runlog::{ingest, Config};
use runlog_shipper::{warehouse::WarehouseSink, Shipper};
use tokio::io::BufReader;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.log_filter)?;

    info!(
        scope = %config.scope,
        endpoint = %config.warehouse_endpoint,
        workers = config.num_workers,
        batch_size = config.batch_size,
        "configuration loaded"
    );

    let sink = WarehouseSink::new(config.to_warehouse_config())
        .context("failed to create warehouse sink")?;
    let shipper = Shipper::new(config.scope.clone(), config.to_shipper_config(), Arc::new(sink))
        .context("failed to create shipper")?;
    shipper.start().await.context("failed to start shipper")?;

    info!(shipper_id = %shipper.id(), "runlog is reading events from stdin");

    let reader = BufReader::new(tokio::io::stdin());
    tokio::select! {
        result = ingest::pump(reader, &shipper) => match result {
            Ok(summary) => info!(
                lines = summary.lines,
                accepted = summary.accepted,
                malformed = summary.malformed,
                rejected = summary.rejected,
                "end of input"
            ),
            Err(e) => error!(error = %e, "ingestion failed"),
        },
        () = shutdown_signal() => {
            info!("shutdown signal received, starting graceful shutdown");
        },
    }

    if let Err(e) = shipper.stop().await {
        warn!(error = %e, "shipper did not stop cleanly");
    }

    let depths = shipper.queue_depths().await;
    info!(
        total_lost = depths.total_lost,
        buffered = depths.total_buffered(),
        records_written = depths.stats.records_written,
        snapshot = %serde_json::to_string(&depths).unwrap_or_default(),
        "runlog shutdown complete"
    );
    Ok(())
}

/// Initializes tracing, preferring `RUST_LOG` over the configured filter.
fn init_tracing(default_filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Waits for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C"),
        () = terminate => info!("received SIGTERM"),
    }
}
