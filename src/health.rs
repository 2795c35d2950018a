//! HTTP server for health checks and metrics

use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::metrics::IngestMetrics;

pub fn router(metrics: Arc<IngestMetrics>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .with_state(metrics)
}

/// Serve health and metrics endpoints until the process exits
pub async fn serve(port: u16, metrics: Arc<IngestMetrics>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(metrics)).await?;

    Ok(())
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "component": "market-ingest",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn render_metrics(State(metrics): State<Arc<IngestMetrics>>) -> (StatusCode, String) {
    match metrics.encode() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_payload() {
        let Json(body) = health_check().await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["component"], "market-ingest");
    }

    #[tokio::test]
    async fn test_metrics_render() {
        let metrics = Arc::new(IngestMetrics::new().unwrap());
        metrics.reconnects.inc();

        let (status, body) = render_metrics(State(metrics)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("market_ingest_reconnects_total 1"));
    }
}
