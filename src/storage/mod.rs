//! Storage module
//!
//! Persists trades and order book snapshots into TimescaleDB.

mod memory;
mod schema;
mod writer;

pub use memory::MemoryStore;
pub use schema::SchemaManager;
pub use writer::PgWriter;

use async_trait::async_trait;

use crate::error::Result;
use crate::parser::{OrderBookSnapshot, TradeEvent};

/// Relation names
pub const TRADES_TABLE: &str = "trades";
pub const ORDERBOOK_TABLE: &str = "orderbook";
pub const OHLCV_TABLE: &str = "ohlcv";

/// Destination for parsed market data
///
/// Both writes are all-or-nothing and ignore rows whose identity key is
/// already stored. They return the number of rows actually inserted.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketSink: Send + Sync {
    /// Insert a batch of trades in one transaction
    async fn write_trades(&self, batch: &[TradeEvent]) -> Result<u64>;

    /// Insert the level rows of one snapshot in one transaction
    async fn write_snapshot(&self, snapshot: &OrderBookSnapshot) -> Result<u64>;
}
