//! WebSocket client for the OKX feed
//!
//! Handles connection, frame transmission and message reception.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{info, trace, warn};

use super::{Connector, Transport};
use crate::error::{MarketDataError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client for a single connection
pub struct WebSocketClient {
    stream: Option<WsStream>,
    endpoint: String,
}

impl WebSocketClient {
    /// Create a new WebSocket client
    pub fn new(endpoint: &str) -> Self {
        Self {
            stream: None,
            endpoint: endpoint.to_string(),
        }
    }

    /// Connect to the WebSocket endpoint
    pub async fn connect(&mut self) -> Result<()> {
        info!(url = %self.endpoint, "Connecting to OKX WebSocket");

        let (ws_stream, response) = connect_async(&self.endpoint).await.map_err(|e| {
            MarketDataError::WebSocketConnection(format!("Failed to connect: {}", e))
        })?;

        info!(status = ?response.status(), "WebSocket connected");
        self.stream = Some(ws_stream);

        Ok(())
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Forget the stream after a fatal read and hand back the error
    fn teardown(&mut self, error: MarketDataError) -> MarketDataError {
        warn!(url = %self.endpoint, error = %error, "WebSocket stream lost");
        self.stream = None;
        error
    }

    fn stream_mut(&mut self) -> Result<&mut WsStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| MarketDataError::WebSocketConnection("Not connected".to_string()))
    }
}

#[async_trait]
impl Transport for WebSocketClient {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream_mut()?
            .send(Message::Text(text))
            .await
            .map_err(|e| MarketDataError::WebSocketMessage(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        let next = self.stream_mut()?.next().await;
        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => return Err(self.teardown(MarketDataError::WebSocketMessage(e.to_string()))),
            None => {
                return Err(self.teardown(MarketDataError::WebSocketConnection(
                    "stream ended".to_string(),
                )))
            }
        };

        match message {
            Message::Text(text) => Ok(Some(text)),
            Message::Binary(data) => String::from_utf8(data).map(Some).map_err(|e| {
                MarketDataError::WebSocketMessage(format!("non UTF-8 binary frame: {}", e))
            }),
            // OKX keepalive is the `ping`/`pong` text pair; protocol pings
            // still need an answer
            Message::Ping(payload) => {
                trace!("Answering protocol ping");
                self.stream_mut()?.send(Message::Pong(payload)).await?;
                Ok(None)
            }
            Message::Pong(_) | Message::Frame(_) => Ok(None),
            Message::Close(frame) => {
                let reason = frame
                    .map(|f| format!("{} {}", f.code, f.reason))
                    .unwrap_or_else(|| "no close frame".to_string());
                Err(self.teardown(MarketDataError::WebSocketConnection(format!(
                    "closed by peer: {}",
                    reason
                ))))
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }
}

/// Connects `WebSocketClient`s to a fixed endpoint
#[derive(Debug, Clone)]
pub struct WsConnector {
    endpoint: String,
}

impl WsConnector {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    type Transport = WebSocketClient;

    async fn connect(&self) -> Result<WebSocketClient> {
        let mut client = WebSocketClient::new(&self.endpoint);
        client.connect().await?;
        Ok(client)
    }
}
