//! Ingestion counters exported in Prometheus text format

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::buffer::FlushOutcome;
use crate::error::{MarketDataError, Result};

/// Pipeline counters, registered on a private registry
#[derive(Clone)]
pub struct IngestMetrics {
    registry: Registry,
    pub trades_received: IntCounter,
    pub trades_rejected: IntCounter,
    pub trades_persisted: IntCounter,
    pub trades_dropped: IntCounter,
    pub flushes: IntCounterVec,
    pub book_snapshots: IntCounterVec,
    pub book_rows_persisted: IntCounter,
    pub control_events: IntCounterVec,
    pub reconnects: IntCounter,
}

impl IngestMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("market_ingest".to_string()), None)?;

        let trades_received = IntCounter::new("trades_received_total", "Trades parsed from the feed")?;
        let trades_rejected = IntCounter::new("trades_rejected_total", "Trade records that failed to parse")?;
        let trades_persisted = IntCounter::new("trades_persisted_total", "Trade rows inserted")?;
        let trades_dropped = IntCounter::new("trades_dropped_total", "Trades lost with a failed batch")?;
        let flushes = IntCounterVec::new(
            Opts::new("flushes_total", "Trade batch flushes by outcome"),
            &["outcome"],
        )?;
        let book_snapshots = IntCounterVec::new(
            Opts::new("book_snapshots_total", "Order book snapshots by outcome"),
            &["outcome"],
        )?;
        let book_rows_persisted = IntCounter::new("book_rows_persisted_total", "Order book rows inserted")?;
        let control_events = IntCounterVec::new(
            Opts::new("control_events_total", "Control frames by event"),
            &["event"],
        )?;
        let reconnects = IntCounter::new("reconnects_total", "Connection group restarts")?;

        registry.register(Box::new(trades_received.clone()))?;
        registry.register(Box::new(trades_rejected.clone()))?;
        registry.register(Box::new(trades_persisted.clone()))?;
        registry.register(Box::new(trades_dropped.clone()))?;
        registry.register(Box::new(flushes.clone()))?;
        registry.register(Box::new(book_snapshots.clone()))?;
        registry.register(Box::new(book_rows_persisted.clone()))?;
        registry.register(Box::new(control_events.clone()))?;
        registry.register(Box::new(reconnects.clone()))?;

        Ok(Self {
            registry,
            trades_received,
            trades_rejected,
            trades_persisted,
            trades_dropped,
            flushes,
            book_snapshots,
            book_rows_persisted,
            control_events,
            reconnects,
        })
    }

    pub fn record_flush(&self, outcome: &FlushOutcome) {
        match outcome {
            FlushOutcome::Empty => {}
            FlushOutcome::Committed { inserted, .. } => {
                self.flushes.with_label_values(&["committed"]).inc();
                self.trades_persisted.inc_by(*inserted);
            }
            FlushOutcome::Dropped { submitted, .. } => {
                self.flushes.with_label_values(&["dropped"]).inc();
                self.trades_dropped.inc_by(*submitted as u64);
            }
        }
    }

    /// Render all counters in the text exposition format
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| MarketDataError::MetricsError(e.to_string()))
    }
}
