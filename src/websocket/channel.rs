//! Subscription channel
//!
//! Owns one topic on the shared connection. Lifecycle:
//! `Disconnected -> Subscribing -> Streaming -> Closed`. A channel never
//! retries on its own; once closed, the supervisor rebuilds the whole group.

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::IngestionBuffer;
use crate::error::{MarketDataError, Result};
use crate::metrics::IngestMetrics;
use crate::parser::{BookFrame, ControlEvent, ParsedMessage, TradeFrame};
use crate::storage::MarketSink;

/// Why a channel stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    Error(String),
}

/// Channel lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Subscribing,
    Streaming,
    Closed(CloseReason),
}

/// Result of handling one inbound frame
#[derive(Debug)]
pub enum FrameOutcome {
    /// Data frame routed; `rejected` records were malformed and skipped
    Routed { accepted: usize, rejected: usize },
    /// Nothing to route
    Skipped(&'static str),
    /// The channel cannot continue
    Fatal(MarketDataError),
}

/// Final state reported to the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExit {
    pub topic: String,
    pub reason: CloseReason,
}

/// `{"op":"subscribe","args":[{"channel":..,"instId":..},..]}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscribeRequest {
    pub op: &'static str,
    pub args: Vec<SubscribeArg>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscribeArg {
    pub channel: String,
    #[serde(rename = "instId")]
    pub inst_id: String,
}

impl SubscribeRequest {
    pub fn new(topic: &str, instruments: &[String]) -> Self {
        Self {
            op: "subscribe",
            args: instruments
                .iter()
                .map(|inst| SubscribeArg {
                    channel: topic.to_string(),
                    inst_id: inst.clone(),
                })
                .collect(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| MarketDataError::SerializationError(e.to_string()))
    }
}

/// Where a channel delivers its records
enum Route<'a, S> {
    /// Trades are batched through the buffer
    Trades(&'a mut IngestionBuffer<S>),
    /// Snapshots are written immediately
    Books(&'a S),
}

/// One topic subscribed for all instruments
pub struct SubscriptionChannel<'a, S> {
    topic: String,
    instruments: &'a [String],
    route: Route<'a, S>,
    metrics: &'a IngestMetrics,
    state: ChannelState,
}

impl<'a, S: MarketSink> SubscriptionChannel<'a, S> {
    /// Trades channel feeding the ingestion buffer
    pub fn trades(
        topic: &str,
        instruments: &'a [String],
        buffer: &'a mut IngestionBuffer<S>,
        metrics: &'a IngestMetrics,
    ) -> Self {
        Self::with_route(topic, instruments, Route::Trades(buffer), metrics)
    }

    /// Order book channel writing each snapshot directly
    pub fn books(
        topic: &str,
        instruments: &'a [String],
        sink: &'a S,
        metrics: &'a IngestMetrics,
    ) -> Self {
        Self::with_route(topic, instruments, Route::Books(sink), metrics)
    }

    fn with_route(
        topic: &str,
        instruments: &'a [String],
        route: Route<'a, S>,
        metrics: &'a IngestMetrics,
    ) -> Self {
        Self {
            topic: topic.to_string(),
            instruments,
            route,
            metrics,
            state: ChannelState::Disconnected,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    pub fn subscribe_request(&self) -> SubscribeRequest {
        SubscribeRequest::new(&self.topic, self.instruments)
    }

    /// Subscribe and process frames until the transport or `stop` ends it
    ///
    /// Frames already queued are always handled before returning: on `stop`
    /// the queue is closed and drained, and a dropped transport only ends
    /// the channel once its queue is empty. A frame being handled, including
    /// a buffer flush, is never interrupted.
    pub async fn run(
        &mut self,
        mut inbound: mpsc::Receiver<ParsedMessage>,
        outbound: mpsc::Sender<String>,
        stop: CancellationToken,
    ) -> ChannelExit {
        let request = match self.subscribe_request().to_json() {
            Ok(request) => request,
            Err(e) => return self.close(CloseReason::Error(e.to_string())),
        };
        if outbound.send(request).await.is_err() {
            self.discard(&mut inbound);
            return self.close(CloseReason::Error("transport gone before subscribe".to_string()));
        }

        self.state = ChannelState::Subscribing;
        info!(
            channel = %self.topic,
            instruments = ?self.instruments,
            "Subscribe request sent"
        );

        let mut stopping = false;
        loop {
            let next = tokio::select! {
                _ = stop.cancelled(), if !stopping => None,
                message = inbound.recv() => Some(message),
            };

            let message = match next {
                None => {
                    debug!(channel = %self.topic, "Stop requested, draining queued frames");
                    inbound.close();
                    stopping = true;
                    continue;
                }
                Some(Some(message)) => message,
                Some(None) if stopping => return self.close(CloseReason::Normal),
                Some(None) => return self.close(CloseReason::Error("transport closed".to_string())),
            };

            if let FrameOutcome::Fatal(e) = self.handle(message).await {
                self.discard(&mut inbound);
                return self.close(CloseReason::Error(e.to_string()));
            }
        }
    }

    /// Drop whatever is still queued, counting lost trades
    fn discard(&self, inbound: &mut mpsc::Receiver<ParsedMessage>) {
        inbound.close();
        let mut frames = 0;
        let mut trades = 0;
        while let Ok(message) = inbound.try_recv() {
            frames += 1;
            if let ParsedMessage::Trades(frame) = message {
                trades += frame.records.len();
            }
        }

        if frames > 0 {
            self.metrics.trades_dropped.inc_by(trades as u64);
            warn!(
                channel = %self.topic,
                frames = frames,
                trades = trades,
                "Discarding queued frames"
            );
        }
    }

    /// Classify and route a single frame
    pub async fn handle(&mut self, message: ParsedMessage) -> FrameOutcome {
        match message {
            ParsedMessage::Control(event) => self.handle_control(event),
            ParsedMessage::Trades(frame) => {
                self.confirm();
                self.route_trades(frame).await
            }
            ParsedMessage::Books(frame) => {
                self.confirm();
                self.route_books(frame).await
            }
            ParsedMessage::Heartbeat | ParsedMessage::Unknown(_) => FrameOutcome::Skipped("not routable"),
        }
    }

    fn handle_control(&mut self, event: ControlEvent) -> FrameOutcome {
        if event.is_error() {
            warn!(
                channel = %self.topic,
                code = ?event.code,
                msg = ?event.msg,
                "Channel error event"
            );
            if self.state == ChannelState::Subscribing {
                return FrameOutcome::Fatal(MarketDataError::WebSocketMessage(format!(
                    "subscription to {} rejected: {}",
                    self.topic,
                    event.msg.unwrap_or_default()
                )));
            }
            return FrameOutcome::Skipped("error event");
        }

        info!(
            channel = %self.topic,
            event = %event.event,
            instrument = ?event.instrument_id,
            "Channel event"
        );
        self.confirm();
        FrameOutcome::Skipped("control event")
    }

    fn confirm(&mut self) {
        if self.state == ChannelState::Subscribing {
            info!(channel = %self.topic, "Subscription confirmed, streaming");
            self.state = ChannelState::Streaming;
        }
    }

    async fn route_trades(&mut self, frame: TradeFrame) -> FrameOutcome {
        let Route::Trades(buffer) = &mut self.route else {
            warn!(channel = %self.topic, "Trade frame on a book channel");
            return FrameOutcome::Skipped("unexpected trade frame");
        };

        for rejected in &frame.rejected {
            warn!(
                channel = %self.topic,
                record = rejected.index,
                reason = %rejected.reason,
                "Skipping malformed trade record"
            );
        }

        let accepted = frame.records.len();
        let rejected = frame.rejected.len();
        self.metrics.trades_received.inc_by(accepted as u64);
        self.metrics.trades_rejected.inc_by(rejected as u64);

        for event in frame.records {
            if let Some(outcome) = buffer.append(event).await {
                self.metrics.record_flush(&outcome);
            }
        }

        debug!(
            channel = %self.topic,
            accepted = accepted,
            pending = buffer.len(),
            "Trade frame buffered"
        );
        FrameOutcome::Routed { accepted, rejected }
    }

    async fn route_books(&mut self, frame: BookFrame) -> FrameOutcome {
        let Route::Books(sink) = &self.route else {
            warn!(channel = %self.topic, "Book frame on a trades channel");
            return FrameOutcome::Skipped("unexpected book frame");
        };

        for rejected in &frame.rejected {
            warn!(
                channel = %self.topic,
                instrument = ?frame.instrument_id,
                record = rejected.index,
                reason = %rejected.reason,
                "Skipping malformed book snapshot"
            );
        }

        let mut accepted = 0;
        for snapshot in &frame.records {
            match sink.write_snapshot(snapshot).await {
                Ok(inserted) => {
                    accepted += 1;
                    self.metrics.book_snapshots.with_label_values(&["committed"]).inc();
                    self.metrics.book_rows_persisted.inc_by(inserted);
                }
                Err(e) => {
                    self.metrics.book_snapshots.with_label_values(&["dropped"]).inc();
                    warn!(
                        channel = %self.topic,
                        instrument = %snapshot.instrument_id,
                        levels = snapshot.rows().len(),
                        error = %e,
                        "Order book snapshot rolled back"
                    );
                }
            }
        }

        FrameOutcome::Routed {
            accepted,
            rejected: frame.rejected.len() + frame.records.len() - accepted,
        }
    }

    fn close(&mut self, reason: CloseReason) -> ChannelExit {
        match &reason {
            CloseReason::Normal => info!(channel = %self.topic, "Channel closed"),
            CloseReason::Error(e) => warn!(channel = %self.topic, error = %e, "Channel closed with error"),
        }
        self.state = ChannelState::Closed(reason.clone());
        ChannelExit {
            topic: self.topic.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::MAX_BOOK_DEPTH;
    use crate::storage::{MemoryStore, MockMarketSink};
    use std::sync::Arc;

    fn instruments() -> Vec<String> {
        vec!["BTC-USDT".to_string(), "ETH-USDT".to_string()]
    }

    fn parse(raw: &str) -> ParsedMessage {
        ParsedMessage::parse(raw, MAX_BOOK_DEPTH).unwrap()
    }

    fn trade_frame(ids: &[&str]) -> ParsedMessage {
        let data: Vec<String> = ids
            .iter()
            .map(|id| {
                format!(
                    r#"{{"instId":"BTC-USDT","tradeId":"{}","px":"42000.1","sz":"0.5","side":"buy","ts":"1630048897897"}}"#,
                    id
                )
            })
            .collect();
        parse(&format!(
            r#"{{"arg":{{"channel":"trades","instId":"BTC-USDT"}},"data":[{}]}}"#,
            data.join(",")
        ))
    }

    const ACK: &str = r#"{"event":"subscribe","arg":{"channel":"trades","instId":"BTC-USDT"}}"#;

    #[test]
    fn test_subscribe_request_names_all_instruments() {
        let request = SubscribeRequest::new("books", &instruments());
        let value: serde_json::Value = serde_json::from_str(&request.to_json().unwrap()).unwrap();

        assert_eq!(value["op"], "subscribe");
        assert_eq!(value["args"][0]["channel"], "books");
        assert_eq!(value["args"][0]["instId"], "BTC-USDT");
        assert_eq!(value["args"][1]["instId"], "ETH-USDT");
    }

    #[tokio::test]
    async fn test_trades_lifecycle() {
        let store = Arc::new(MemoryStore::new());
        let metrics = IngestMetrics::new().unwrap();
        let instruments = instruments();
        let mut buffer = IngestionBuffer::new(store.clone(), 2);

        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        in_tx.send(parse(ACK)).await.unwrap();
        in_tx.send(trade_frame(&["1", "2", "3"])).await.unwrap();
        drop(in_tx);

        let mut channel = SubscriptionChannel::trades("trades", &instruments, &mut buffer, &metrics);
        assert_eq!(channel.state(), &ChannelState::Disconnected);

        let exit = channel.run(in_rx, out_tx, CancellationToken::new()).await;

        assert!(matches!(exit.reason, CloseReason::Error(_)));
        assert!(matches!(channel.state(), ChannelState::Closed(CloseReason::Error(_))));
        assert!(out_rx.try_recv().unwrap().contains(r#""op":"subscribe""#));
        assert_eq!(store.trade_count(), 2);
        assert_eq!(buffer.len(), 1);
        assert_eq!(metrics.trades_received.get(), 3);
    }

    #[tokio::test]
    async fn test_first_data_frame_confirms_subscription() {
        let store = Arc::new(MemoryStore::new());
        let metrics = IngestMetrics::new().unwrap();
        let instruments = instruments();
        let mut buffer = IngestionBuffer::new(store, 100);
        let mut channel = SubscriptionChannel::trades("trades", &instruments, &mut buffer, &metrics);
        channel.state = ChannelState::Subscribing;

        let outcome = channel.handle(trade_frame(&["1"])).await;

        assert!(matches!(
            outcome,
            FrameOutcome::Routed {
                accepted: 1,
                rejected: 0
            }
        ));
        assert_eq!(channel.state(), &ChannelState::Streaming);
    }

    #[tokio::test]
    async fn test_error_event_while_subscribing_is_fatal() {
        let sink = MockMarketSink::new();
        let metrics = IngestMetrics::new().unwrap();
        let instruments = instruments();
        let mut channel = SubscriptionChannel::books("books", &instruments, &sink, &metrics);
        channel.state = ChannelState::Subscribing;

        let error = parse(r#"{"event":"error","code":"60018","msg":"doesn't exist","arg":{"channel":"books","instId":"XYZ"}}"#);
        assert!(matches!(channel.handle(error.clone()).await, FrameOutcome::Fatal(_)));

        channel.state = ChannelState::Streaming;
        assert!(matches!(channel.handle(error).await, FrameOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn test_error_without_arg_rejects_pending_subscription() {
        let sink = MockMarketSink::new();
        let metrics = IngestMetrics::new().unwrap();
        let instruments = instruments();
        let mut channel = SubscriptionChannel::books("books", &instruments, &sink, &metrics);
        channel.state = ChannelState::Subscribing;

        let error = parse(r#"{"event":"error","code":"60012","msg":"Invalid request"}"#);
        assert!(matches!(channel.handle(error).await, FrameOutcome::Fatal(_)));
    }

    #[tokio::test]
    async fn test_stop_drains_queued_frames() {
        let store = Arc::new(MemoryStore::new());
        let metrics = IngestMetrics::new().unwrap();
        let instruments = instruments();
        let mut buffer = IngestionBuffer::new(store.clone(), 2);

        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, _out_rx) = mpsc::channel(8);
        in_tx.send(trade_frame(&["1", "2", "3"])).await.unwrap();
        let stop = CancellationToken::new();
        stop.cancel();

        let mut channel = SubscriptionChannel::trades("trades", &instruments, &mut buffer, &metrics);
        let exit = channel.run(in_rx, out_tx, stop).await;

        assert_eq!(exit.reason, CloseReason::Normal);
        assert_eq!(store.trade_count(), 2);
        assert_eq!(buffer.len(), 1);
        assert!(in_tx.is_closed());
    }

    #[tokio::test]
    async fn test_fatal_exit_counts_discarded_trades() {
        let store = Arc::new(MemoryStore::new());
        let metrics = IngestMetrics::new().unwrap();
        let instruments = instruments();
        let mut buffer = IngestionBuffer::new(store.clone(), 100);

        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, _out_rx) = mpsc::channel(8);
        in_tx
            .send(parse(r#"{"event":"error","code":"60012","msg":"Invalid request"}"#))
            .await
            .unwrap();
        in_tx.send(trade_frame(&["1", "2"])).await.unwrap();

        let mut channel = SubscriptionChannel::trades("trades", &instruments, &mut buffer, &metrics);
        let exit = channel.run(in_rx, out_tx, CancellationToken::new()).await;

        assert!(matches!(exit.reason, CloseReason::Error(_)));
        assert_eq!(metrics.trades_dropped.get(), 2);
        assert_eq!(metrics.trades_received.get(), 0);
        assert_eq!(store.trade_count(), 0);
    }

    #[tokio::test]
    async fn test_book_snapshot_capped_at_five_levels() {
        let store = MemoryStore::new();
        let metrics = IngestMetrics::new().unwrap();
        let instruments = instruments();
        let mut channel = SubscriptionChannel::books("books", &instruments, &store, &metrics);

        let bids: Vec<String> = (0..8).map(|i| format!(r#"["{}","1","0","1"]"#, 100 - i)).collect();
        let frame = parse(&format!(
            r#"{{"arg":{{"channel":"books","instId":"BTC-USDT"}},"data":[{{"asks":[],"bids":[{}],"ts":"1630048897897"}}]}}"#,
            bids.join(",")
        ));

        let outcome = channel.handle(frame).await;

        assert!(matches!(outcome, FrameOutcome::Routed { accepted: 1, .. }));
        let rows = store.book_rows("BTC-USDT");
        assert_eq!(rows.len(), 5);
        assert!(rows.iter().all(|r| r.bid.is_some() && r.ask.is_none()));
        assert_eq!(rows.iter().map(|r| r.level).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert_eq!(metrics.book_rows_persisted.get(), 5);
    }

    #[tokio::test]
    async fn test_failed_snapshot_does_not_close_channel() {
        let mut sink = MockMarketSink::new();
        sink.expect_write_snapshot()
            .times(1)
            .returning(|_| Err(MarketDataError::PersistenceError("deadlock detected".into())));
        let metrics = IngestMetrics::new().unwrap();
        let instruments = instruments();
        let mut channel = SubscriptionChannel::books("books", &instruments, &sink, &metrics);

        let frame = parse(r#"{"arg":{"channel":"books","instId":"BTC-USDT"},"data":[{"asks":[["101","1","0","1"]],"bids":[],"ts":"1630048897897"}]}"#);
        let outcome = channel.handle(frame).await;

        assert!(matches!(
            outcome,
            FrameOutcome::Routed {
                accepted: 0,
                rejected: 1
            }
        ));
        assert_eq!(metrics.book_snapshots.with_label_values(&["dropped"]).get(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_normally() {
        let sink = MockMarketSink::new();
        let metrics = IngestMetrics::new().unwrap();
        let instruments = instruments();
        let mut channel = SubscriptionChannel::books("books", &instruments, &sink, &metrics);

        let (_in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, _out_rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let exit = channel.run(in_rx, out_tx, shutdown).await;
        assert_eq!(exit.reason, CloseReason::Normal);
        assert_eq!(channel.state(), &ChannelState::Closed(CloseReason::Normal));
    }

    #[tokio::test]
    async fn test_mismatched_frame_is_skipped() {
        let sink = MockMarketSink::new();
        let metrics = IngestMetrics::new().unwrap();
        let instruments = instruments();
        let mut channel = SubscriptionChannel::books("books", &instruments, &sink, &metrics);

        assert!(matches!(
            channel.handle(trade_frame(&["1"])).await,
            FrameOutcome::Skipped(_)
        ));
    }
}
