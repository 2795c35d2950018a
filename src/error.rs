//! Error types for the ingestion pipeline

use thiserror::Error;

/// Market data ingestion errors
#[derive(Error, Debug)]
pub enum MarketDataError {
    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    #[error("WebSocket message error: {0}")]
    WebSocketMessage(String),

    #[error("Failed to parse message: {0}")]
    ParseError(String),

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Metrics error: {0}")]
    MetricsError(String),

    #[error("Channel {0} closed")]
    ChannelClosed(String),

    #[error("Connection timeout")]
    ConnectionTimeout,
}

impl MarketDataError {
    /// Errors the supervisor recovers from by rebuilding the connection
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            MarketDataError::WebSocketConnection(_)
                | MarketDataError::WebSocketMessage(_)
                | MarketDataError::ChannelClosed(_)
                | MarketDataError::ConnectionTimeout
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for MarketDataError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        MarketDataError::WebSocketConnection(err.to_string())
    }
}

impl From<serde_json::Error> for MarketDataError {
    fn from(err: serde_json::Error) -> Self {
        MarketDataError::ParseError(err.to_string())
    }
}

impl From<sqlx::Error> for MarketDataError {
    fn from(err: sqlx::Error) -> Self {
        MarketDataError::PersistenceError(err.to_string())
    }
}

impl From<prometheus::Error> for MarketDataError {
    fn from(err: prometheus::Error) -> Self {
        MarketDataError::MetricsError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MarketDataError>;
