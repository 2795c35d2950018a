//! OKX market data collector
//!
//! Streams trades and order book snapshots from OKX into TimescaleDB,
//! reconnecting on network failure until SIGINT/SIGTERM.

use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use market_ingest::{
    health, Config, IngestMetrics, PgWriter, SchemaManager, Supervisor, SupervisorConfig,
    WsConnector,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(log_filter(std::env::var("RUST_LOG").ok()))
        .init();

    info!("Starting OKX market data collector");

    // Configuration and storage problems are fatal before any ingestion
    let config = Config::load()?;
    info!(
        instruments = ?config.instruments,
        flush_threshold = config.flush_threshold,
        private_channels = config.credentials.is_some(),
        "Configuration loaded"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(config.database.connect_options())
        .await?;
    info!(
        host = %config.database.host,
        database = %config.database.name,
        "Connected to database"
    );

    SchemaManager::new(&pool).ensure().await?;

    let metrics = Arc::new(IngestMetrics::new()?);

    let health_metrics = metrics.clone();
    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = health::serve(health_port, health_metrics).await {
            warn!(error = %e, "Health server error");
        }
    });

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let writer = Arc::new(PgWriter::new(pool.clone()));
    let connector = WsConnector::new(&config.ws_endpoint);
    let mut supervisor = Supervisor::new(
        connector,
        writer,
        SupervisorConfig::from(&config),
        metrics,
    );
    supervisor.run(shutdown).await?;

    pool.close().await;
    info!("Collector stopped");

    Ok(())
}

/// `RUST_LOG` directives when set and valid, `info` otherwise
fn log_filter(directives: Option<String>) -> EnvFilter {
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received ctrl-c"),
        _ = terminate => info!("Received SIGTERM"),
    }

    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::level_filters::LevelFilter;

    #[test]
    fn test_log_filter_defaults_to_info() {
        assert_eq!(log_filter(None).max_level_hint(), Some(LevelFilter::INFO));
        assert_eq!(log_filter(Some("  ".into())).max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn test_log_filter_honours_rust_log() {
        assert_eq!(log_filter(Some("debug".into())).max_level_hint(), Some(LevelFilter::DEBUG));
        assert_eq!(
            log_filter(Some("market_ingest=trace".into())).max_level_hint(),
            Some(LevelFilter::TRACE)
        );
    }
}
