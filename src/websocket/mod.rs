//! WebSocket module for OKX connection management

mod channel;
mod client;
mod demux;
mod supervisor;

pub use channel::{ChannelExit, ChannelState, CloseReason, FrameOutcome, SubscribeRequest, SubscriptionChannel};
pub use client::{WebSocketClient, WsConnector};
pub use demux::Demultiplexer;
pub use supervisor::{Supervisor, SupervisorConfig};

use async_trait::async_trait;

use crate::error::Result;

/// A bidirectional text-frame connection
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next text frame; `Ok(None)` for protocol-level frames (ping/pong)
    async fn recv(&mut self) -> Result<Option<String>>;

    async fn close(&mut self);
}

/// Opens fresh transports for the supervisor
#[async_trait]
pub trait Connector: Send + Sync {
    type Transport: Transport;

    async fn connect(&self) -> Result<Self::Transport>;
}
