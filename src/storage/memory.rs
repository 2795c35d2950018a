//! In-process store with the same write semantics as `PgWriter`
//!
//! Used to exercise the pipeline without a database. Writes are
//! conflict-ignoring and all-or-nothing, and a failure can be injected into
//! the next trade batch to observe rollback.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::MarketSink;
use crate::error::{MarketDataError, Result};
use crate::parser::{BookRow, OrderBookSnapshot, TradeEvent, TradeKey};

type BookKey = (DateTime<Utc>, String, u32);

#[derive(Debug, Default)]
struct Tables {
    trades: BTreeMap<TradeKey, TradeEvent>,
    orderbook: BTreeMap<BookKey, BookRow>,
    /// 1-based row of the next trade batch that fails
    fail_at: Option<usize>,
    batches: usize,
}

/// Shared in-memory tables
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next trade batch fail when it reaches `row` (1-based)
    pub fn fail_next_batch_at(&self, row: usize) {
        self.lock().fail_at = Some(row);
    }

    /// Stored trades for one instrument, in key order
    pub fn trades(&self, instrument_id: &str) -> Vec<TradeEvent> {
        self.lock()
            .trades
            .values()
            .filter(|t| t.instrument_id == instrument_id)
            .cloned()
            .collect()
    }

    pub fn trade_count(&self) -> usize {
        self.lock().trades.len()
    }

    /// Stored book rows for one instrument, in key order
    pub fn book_rows(&self, instrument_id: &str) -> Vec<BookRow> {
        self.lock()
            .orderbook
            .iter()
            .filter(|((_, id, _), _)| id == instrument_id)
            .map(|(_, row)| row.clone())
            .collect()
    }

    /// Trade batches that reached the store, committed or not
    pub fn batches(&self) -> usize {
        self.lock().batches
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        // A poisoned lock only means a test panicked mid-write
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MarketSink for MemoryStore {
    async fn write_trades(&self, batch: &[TradeEvent]) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut tables = self.lock();
        tables.batches += 1;
        let fail_at = tables.fail_at.take();

        let mut staged: BTreeMap<TradeKey, TradeEvent> = BTreeMap::new();
        for (i, trade) in batch.iter().enumerate() {
            if fail_at == Some(i + 1) {
                return Err(MarketDataError::PersistenceError(format!(
                    "injected failure at row {}",
                    i + 1
                )));
            }
            let key = trade.key();
            if !tables.trades.contains_key(&key) {
                staged.entry(key).or_insert_with(|| trade.clone());
            }
        }

        let inserted = staged.len() as u64;
        tables.trades.extend(staged);
        Ok(inserted)
    }

    async fn write_snapshot(&self, snapshot: &OrderBookSnapshot) -> Result<u64> {
        let mut tables = self.lock();
        let mut inserted = 0;

        for row in snapshot.rows() {
            let key = (snapshot.timestamp, snapshot.instrument_id.clone(), row.level);
            if let std::collections::btree_map::Entry::Vacant(entry) = tables.orderbook.entry(key) {
                entry.insert(row);
                inserted += 1;
            }
        }

        Ok(inserted)
    }
}
