//! Connection demultiplexer
//!
//! Sole reader of the shared transport. Parses each inbound frame and hands
//! it to the subscription channel named in its `arg.channel`, forwards the
//! channels' outbound requests, and keeps the connection alive with the OKX
//! `ping` text frame.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::Transport;
use crate::error::{MarketDataError, Result};
use crate::metrics::IngestMetrics;
use crate::parser::{ControlEvent, ParsedMessage};

/// Keepalive text understood by OKX; answered with `pong`
const PING: &str = "ping";

enum Event {
    Stop,
    Outbound(Option<String>),
    Inbound(std::result::Result<Result<Option<String>>, tokio::time::error::Elapsed>),
}

/// Routes frames of one connection to per-channel queues
pub struct Demultiplexer<'a, T> {
    transport: &'a mut T,
    outbound: mpsc::Receiver<String>,
    routes: HashMap<String, mpsc::Sender<ParsedMessage>>,
    book_depth: usize,
    keepalive: Duration,
    metrics: &'a IngestMetrics,
}

impl<'a, T: Transport> Demultiplexer<'a, T> {
    pub fn new(
        transport: &'a mut T,
        outbound: mpsc::Receiver<String>,
        book_depth: usize,
        keepalive: Duration,
        metrics: &'a IngestMetrics,
    ) -> Self {
        Self {
            transport,
            outbound,
            routes: HashMap::new(),
            book_depth,
            keepalive,
            metrics,
        }
    }

    /// Deliver frames of `channel` to `sender`
    pub fn route(&mut self, channel: &str, sender: mpsc::Sender<ParsedMessage>) {
        self.routes.insert(channel.to_string(), sender);
    }

    /// Pump frames until the transport fails or `stop` is cancelled
    ///
    /// Consumes the demultiplexer so the per-channel senders close when it
    /// returns; channels then drain what is queued and exit. Returns `Ok(())`
    /// on `stop` or once every outbound sender is gone.
    pub async fn run(mut self, stop: &CancellationToken) -> Result<()> {
        let mut awaiting_pong = false;

        loop {
            let event = tokio::select! {
                _ = stop.cancelled() => Event::Stop,
                out = self.outbound.recv() => Event::Outbound(out),
                frame = timeout(self.keepalive, self.transport.recv()) => Event::Inbound(frame),
            };

            match event {
                Event::Stop => return Ok(()),
                Event::Outbound(Some(text)) => {
                    debug!(frame = %text, "Sending request");
                    self.transport.send_text(text).await?;
                }
                Event::Outbound(None) => return Ok(()),
                Event::Inbound(Ok(Ok(Some(text)))) => {
                    awaiting_pong = false;
                    self.dispatch(&text).await?;
                }
                Event::Inbound(Ok(Ok(None))) => awaiting_pong = false,
                Event::Inbound(Ok(Err(e))) => return Err(e),
                Event::Inbound(Err(_)) => {
                    if awaiting_pong {
                        warn!(
                            idle_secs = self.keepalive.as_secs() * 2,
                            "Keepalive unanswered, dropping connection"
                        );
                        return Err(MarketDataError::ConnectionTimeout);
                    }
                    trace!("Idle connection, sending keepalive");
                    self.transport.send_text(PING.to_string()).await?;
                    awaiting_pong = true;
                }
            }
        }
    }

    async fn dispatch(&mut self, text: &str) -> Result<()> {
        let message = match ParsedMessage::parse(text, self.book_depth) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, len = text.len(), "Unparseable frame");
                return Ok(());
            }
        };

        if let ParsedMessage::Control(event) = &message {
            self.metrics
                .control_events
                .with_label_values(&[event.event.as_str()])
                .inc();
        }

        let channel = match message.channel() {
            Some(channel) => channel.to_string(),
            None => return self.dispatch_unrouted(message).await,
        };

        let Some(sender) = self.routes.get(&channel) else {
            debug!(channel = %channel, "Frame for unsubscribed channel");
            return Ok(());
        };

        if let Err(mpsc::error::SendError(message)) = sender.send(message).await {
            self.count_undelivered(&channel, &message);
            return Err(MarketDataError::ChannelClosed(channel));
        }
        Ok(())
    }

    /// Errors without `arg` (rejected subscribe requests) go to every channel
    async fn dispatch_unrouted(&mut self, message: ParsedMessage) -> Result<()> {
        match message {
            ParsedMessage::Control(event) if event.is_error() => {
                log_connection_event(&event);
                for (channel, sender) in &self.routes {
                    if sender.send(ParsedMessage::Control(event.clone())).await.is_err() {
                        debug!(channel = %channel, "Channel gone, error event not delivered");
                    }
                }
            }
            ParsedMessage::Control(event) => log_connection_event(&event),
            ParsedMessage::Heartbeat => trace!("Received pong"),
            ParsedMessage::Unknown(raw) => trace!(msg = %raw, "Unknown message type"),
            ParsedMessage::Trades(_) | ParsedMessage::Books(_) => {}
        }
        Ok(())
    }

    fn count_undelivered(&self, channel: &str, message: &ParsedMessage) {
        if let ParsedMessage::Trades(frame) = message {
            self.metrics.trades_dropped.inc_by(frame.records.len() as u64);
        }
        warn!(channel = %channel, "Channel gone, frame dropped");
    }
}

fn log_connection_event(event: &ControlEvent) {
    match event.event.as_str() {
        "error" => warn!(
            code = ?event.code,
            msg = ?event.msg,
            "Feed reported an error"
        ),
        "notice" => warn!(
            code = ?event.code,
            msg = ?event.msg,
            "Feed notice, connection may be closed"
        ),
        other => info!(event = %other, msg = ?event.msg, "Event"),
    }
}
