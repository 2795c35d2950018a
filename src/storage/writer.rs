//! Transactional batch writer for PostgreSQL
//!
//! Every write runs in a single transaction with `ON CONFLICT DO NOTHING`,
//! so replaying a batch after a reconnect never duplicates rows. An error
//! anywhere in the transaction drops it, which rolls the whole batch back.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::debug;

use super::MarketSink;
use crate::error::Result;
use crate::parser::{OrderBookSnapshot, TradeEvent};

/// Rows per INSERT statement, kept well under the 65535 bind limit
const MAX_ROWS_PER_STATEMENT: usize = 5_000;

/// Writer backed by a shared connection pool
#[derive(Debug, Clone)]
pub struct PgWriter {
    pool: PgPool,
}

impl PgWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MarketSink for PgWriter {
    async fn write_trades(&self, batch: &[TradeEvent]) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for chunk in batch.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut query: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO trades (timestamp, instrument_id, trade_id, side, price, size) ",
            );
            query.push_values(chunk, |mut row, trade| {
                row.push_bind(trade.timestamp)
                    .push_bind(trade.instrument_id.clone())
                    .push_bind(trade.trade_id.clone())
                    .push_bind(trade.side.as_str())
                    .push_bind(trade.price)
                    .push_bind(trade.size);
            });
            query.push(" ON CONFLICT (timestamp, instrument_id, trade_id) DO NOTHING");

            inserted += query.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;

        debug!(
            submitted = batch.len(),
            inserted = inserted,
            "Trade batch committed"
        );
        Ok(inserted)
    }

    async fn write_snapshot(&self, snapshot: &OrderBookSnapshot) -> Result<u64> {
        let rows = snapshot.rows();
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for row in &rows {
            inserted += sqlx::query(
                r"
                INSERT INTO orderbook (timestamp, instrument_id, bid_price, bid_size, ask_price, ask_size, level)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (timestamp, instrument_id, level) DO NOTHING
                ",
            )
            .bind(snapshot.timestamp)
            .bind(&snapshot.instrument_id)
            .bind(row.bid.as_ref().map(|l| l.price))
            .bind(row.bid.as_ref().map(|l| l.size))
            .bind(row.ask.as_ref().map(|l| l.price))
            .bind(row.ask.as_ref().map(|l| l.size))
            .bind(row.level as i32)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;

        debug!(
            instrument = %snapshot.instrument_id,
            levels = rows.len(),
            inserted = inserted,
            "Order book snapshot committed"
        );
        Ok(inserted)
    }
}
