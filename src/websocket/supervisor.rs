//! Connection supervisor
//!
//! Runs the trades and order book channels over one connection and owns
//! the retry policy: when any member of the group fails, the whole group is
//! wound down and rebuilt on a fresh connection after a fixed backoff.
//! Winding down never interrupts a frame: channels drain what the
//! demultiplexer already queued before the session ends.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{
    ChannelExit, CloseReason, Connector, Demultiplexer, SubscriptionChannel, Transport,
};
use crate::buffer::IngestionBuffer;
use crate::config::Config;
use crate::error::{MarketDataError, Result};
use crate::metrics::IngestMetrics;
use crate::storage::MarketSink;

/// Requests in flight from channels to the connection
const OUTBOUND_CAPACITY: usize = 16;
/// Parsed frames queued per channel
const INBOUND_CAPACITY: usize = 256;

/// Supervisor settings
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub instruments: Vec<String>,
    pub trade_channel: String,
    pub book_channel: String,
    pub book_depth: usize,
    pub flush_threshold: usize,
    pub reconnect_backoff: Duration,
    pub keepalive: Duration,
    /// Upper bound for the flush of pending trades at shutdown
    pub shutdown_flush_timeout: Duration,
}

impl From<&Config> for SupervisorConfig {
    fn from(config: &Config) -> Self {
        Self {
            instruments: config.instruments.clone(),
            trade_channel: config.trade_channel.clone(),
            book_channel: config.book_channel.clone(),
            book_depth: config.book_depth,
            flush_threshold: config.flush_threshold,
            reconnect_backoff: config.reconnect_backoff(),
            keepalive: config.keepalive(),
            shutdown_flush_timeout: Duration::from_secs(10),
        }
    }
}

enum SessionEnd {
    Shutdown,
    Failed(MarketDataError),
}

impl From<ChannelExit> for SessionEnd {
    fn from(exit: ChannelExit) -> Self {
        match exit.reason {
            CloseReason::Normal => SessionEnd::Shutdown,
            CloseReason::Error(reason) => SessionEnd::Failed(MarketDataError::ChannelClosed(
                format!("{}: {}", exit.topic, reason),
            )),
        }
    }
}

/// Reconnect controller for the channel group
pub struct Supervisor<C, S> {
    connector: C,
    sink: Arc<S>,
    buffer: IngestionBuffer<S>,
    config: SupervisorConfig,
    metrics: Arc<IngestMetrics>,
    sessions: u64,
}

impl<C, S> Supervisor<C, S>
where
    C: Connector,
    S: MarketSink,
{
    pub fn new(connector: C, sink: Arc<S>, config: SupervisorConfig, metrics: Arc<IngestMetrics>) -> Self {
        let buffer = IngestionBuffer::new(sink.clone(), config.flush_threshold);
        Self {
            connector,
            sink,
            buffer,
            config,
            metrics,
            sessions: 0,
        }
    }

    /// Trades pending in the ingestion buffer
    pub fn buffer(&self) -> &IngestionBuffer<S> {
        &self.buffer
    }

    /// Connection sessions started so far
    pub fn sessions(&self) -> u64 {
        self.sessions
    }

    /// Run until `shutdown` is cancelled, reconnecting after every failure
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        info!(
            instruments = ?self.config.instruments,
            backoff_secs = self.config.reconnect_backoff.as_secs(),
            "Starting supervisor"
        );

        loop {
            match self.run_session(&shutdown).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Failed(e) => {
                    self.metrics.reconnects.inc();
                    error!(
                        error = %e,
                        transport = e.is_transport(),
                        session = self.sessions,
                        pending = self.buffer.len(),
                        "Session failed"
                    );
                    warn!(
                        delay_secs = self.config.reconnect_backoff.as_secs(),
                        "Reconnecting after backoff..."
                    );

                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(self.config.reconnect_backoff) => {}
                    }
                }
            }
        }

        self.flush_pending().await;
        info!(sessions = self.sessions, "Supervisor stopped");
        Ok(())
    }

    /// One connection lifetime: connect, subscribe every channel, stream
    async fn run_session(&mut self, shutdown: &CancellationToken) -> SessionEnd {
        self.sessions += 1;

        let connected = tokio::select! {
            _ = shutdown.cancelled() => return SessionEnd::Shutdown,
            connected = self.connector.connect() => connected,
        };
        let mut transport = match connected {
            Ok(transport) => transport,
            Err(e) => return SessionEnd::Failed(e),
        };
        info!(session = self.sessions, "Connected, starting channel group");

        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (trade_tx, trade_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (book_tx, book_rx) = mpsc::channel(INBOUND_CAPACITY);
        let trade_out = out_tx.clone();
        let book_out = out_tx;

        // Cancelled by shutdown or by the first member that fails
        let session = shutdown.child_token();

        let (demux_result, trades_exit, books_exit) = {
            let mut demux = Demultiplexer::new(
                &mut transport,
                out_rx,
                self.config.book_depth,
                self.config.keepalive,
                &self.metrics,
            );
            demux.route(&self.config.trade_channel, trade_tx);
            demux.route(&self.config.book_channel, book_tx);

            let mut trades = SubscriptionChannel::trades(
                &self.config.trade_channel,
                &self.config.instruments,
                &mut self.buffer,
                &self.metrics,
            );
            let mut books = SubscriptionChannel::books(
                &self.config.book_channel,
                &self.config.instruments,
                self.sink.as_ref(),
                &self.metrics,
            );

            // Members are never dropped mid-frame: a failed transport closes
            // the channel queues, and the channels drain them before exiting
            tokio::join!(
                async {
                    let result = demux.run(&session).await;
                    if result.is_err() {
                        session.cancel();
                    }
                    result
                },
                async {
                    let exit = trades.run(trade_rx, trade_out, session.clone()).await;
                    if exit.reason != CloseReason::Normal {
                        session.cancel();
                    }
                    exit
                },
                async {
                    let exit = books.run(book_rx, book_out, session.clone()).await;
                    if exit.reason != CloseReason::Normal {
                        session.cancel();
                    }
                    exit
                },
            )
        };

        let end = if shutdown.is_cancelled() {
            SessionEnd::Shutdown
        } else if let Err(e) = demux_result {
            SessionEnd::Failed(e)
        } else {
            [trades_exit, books_exit]
                .into_iter()
                .map(SessionEnd::from)
                .find(|end| matches!(end, SessionEnd::Failed(_)))
                .unwrap_or_else(|| {
                    SessionEnd::Failed(MarketDataError::ChannelClosed("all channels".to_string()))
                })
        };

        transport.close().await;
        end
    }

    async fn flush_pending(&mut self) {
        let pending = self.buffer.len();
        if pending == 0 {
            return;
        }

        info!(pending = pending, "Flushing pending trades before exit");
        match timeout(self.config.shutdown_flush_timeout, self.buffer.flush()).await {
            Ok(outcome) => self.metrics.record_flush(&outcome),
            Err(_) => {
                self.metrics.trades_dropped.inc_by(pending as u64);
                warn!(pending = pending, "Final flush timed out, pending trades lost");
            }
        }
    }
}
