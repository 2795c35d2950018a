//! Ingestion buffer for trade events
//!
//! Accumulates trades and hands them to the sink once the flush threshold
//! is reached. The flush runs inline, so the caller does not read the next
//! frame until it completes.

use std::sync::Arc;
use tracing::{info, warn};

use crate::error::MarketDataError;
use crate::parser::TradeEvent;
use crate::storage::MarketSink;

/// Default number of trades per batch
pub const DEFAULT_FLUSH_THRESHOLD: usize = 100;

/// Result of a flush
#[derive(Debug)]
pub enum FlushOutcome {
    /// Nothing was pending
    Empty,
    /// Batch committed; `inserted` excludes rows already stored
    Committed { submitted: usize, inserted: u64 },
    /// Batch rolled back and discarded
    Dropped {
        submitted: usize,
        error: MarketDataError,
    },
}

/// Bounded accumulator of pending trades
pub struct IngestionBuffer<S> {
    pending: Vec<TradeEvent>,
    threshold: usize,
    sink: Arc<S>,
}

impl<S: MarketSink> IngestionBuffer<S> {
    pub fn new(sink: Arc<S>, threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            pending: Vec::with_capacity(threshold),
            threshold,
            sink,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Append a trade, flushing when the threshold is reached
    pub async fn append(&mut self, event: TradeEvent) -> Option<FlushOutcome> {
        self.pending.push(event);

        if self.pending.len() >= self.threshold {
            Some(self.flush().await)
        } else {
            None
        }
    }

    /// Write all pending trades as one batch
    ///
    /// The buffer is cleared whether or not the write succeeds. A failed
    /// batch is not retried; the sink has already rolled it back.
    pub async fn flush(&mut self) -> FlushOutcome {
        if self.pending.is_empty() {
            return FlushOutcome::Empty;
        }

        let batch = std::mem::replace(&mut self.pending, Vec::with_capacity(self.threshold));
        let submitted = batch.len();

        match self.sink.write_trades(&batch).await {
            Ok(inserted) => {
                info!(submitted = submitted, inserted = inserted, "Inserted trades");
                FlushOutcome::Committed {
                    submitted,
                    inserted,
                }
            }
            Err(error) => {
                warn!(
                    submitted = submitted,
                    first_instrument = %batch[0].instrument_id,
                    error = %error,
                    "Trade batch dropped"
                );
                FlushOutcome::Dropped { submitted, error }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::TradeSide;
    use crate::storage::MockMarketSink;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn trade(id: usize) -> TradeEvent {
        TradeEvent {
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_000 + id as i64).unwrap(),
            instrument_id: "BTC-USDT".to_string(),
            trade_id: id.to_string(),
            side: TradeSide::Sell,
            price: dec!(100),
            size: dec!(1),
        }
    }

    #[tokio::test]
    async fn test_threshold_triggers_one_flush() {
        let mut sink = MockMarketSink::new();
        sink.expect_write_trades()
            .withf(|batch| batch.len() == 100)
            .times(1)
            .returning(|batch| Ok(batch.len() as u64));

        let mut buffer = IngestionBuffer::new(Arc::new(sink), 100);
        let mut outcomes = Vec::new();
        for i in 0..100 {
            if let Some(outcome) = buffer.append(trade(i)).await {
                outcomes.push(outcome);
            }
        }

        assert_eq!(outcomes.len(), 1);
        assert!(matches!(
            outcomes[0],
            FlushOutcome::Committed {
                submitted: 100,
                inserted: 100
            }
        ));
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_below_threshold_does_not_flush() {
        let mut sink = MockMarketSink::new();
        sink.expect_write_trades().times(0);

        let mut buffer = IngestionBuffer::new(Arc::new(sink), 100);
        for i in 0..99 {
            assert!(buffer.append(trade(i)).await.is_none());
        }
        assert_eq!(buffer.len(), 99);
    }

    #[tokio::test]
    async fn test_failed_flush_clears_buffer() {
        let mut sink = MockMarketSink::new();
        sink.expect_write_trades()
            .times(1)
            .returning(|_| Err(MarketDataError::PersistenceError("connection reset".into())));

        let mut buffer = IngestionBuffer::new(Arc::new(sink), 3);
        buffer.append(trade(1)).await;
        buffer.append(trade(2)).await;
        let outcome = buffer.append(trade(3)).await;

        assert!(matches!(
            outcome,
            Some(FlushOutcome::Dropped { submitted: 3, .. })
        ));
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_flush_empty_skips_sink() {
        let mut sink = MockMarketSink::new();
        sink.expect_write_trades().times(0);

        let mut buffer = IngestionBuffer::new(Arc::new(sink), 10);
        assert!(matches!(buffer.flush().await, FlushOutcome::Empty));
    }

    #[tokio::test]
    async fn test_manual_flush_preserves_order() {
        let mut sink = MockMarketSink::new();
        sink.expect_write_trades()
            .withf(|batch| {
                batch.iter().map(|t| t.trade_id.as_str()).collect::<Vec<_>>() == ["7", "8", "9"]
            })
            .times(1)
            .returning(|_| Ok(3));

        let mut buffer = IngestionBuffer::new(Arc::new(sink), 10);
        for i in 7..10 {
            buffer.append(trade(i)).await;
        }
        tokio_test::assert_ok!(match buffer.flush().await {
            FlushOutcome::Committed { inserted, .. } => Ok(inserted),
            other => Err(other),
        });
    }
}
