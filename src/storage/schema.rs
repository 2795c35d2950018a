//! Schema bootstrap
//!
//! Creates the persisted relations and their time partitioning. Safe to run
//! on every start: existing tables and hypertables are left as they are.

use sqlx::PgPool;
use tracing::{info, warn};

use super::{OHLCV_TABLE, ORDERBOOK_TABLE, TRADES_TABLE};
use crate::error::Result;

const CREATE_TRADES: &str = r"
    CREATE TABLE IF NOT EXISTS trades (
        timestamp TIMESTAMPTZ NOT NULL,
        instrument_id VARCHAR(50) NOT NULL,
        trade_id VARCHAR(50) NOT NULL,
        side VARCHAR(10) NOT NULL,
        price NUMERIC(20, 8) NOT NULL,
        size NUMERIC(20, 8) NOT NULL,
        PRIMARY KEY (timestamp, instrument_id, trade_id)
    )
";

const CREATE_ORDERBOOK: &str = r"
    CREATE TABLE IF NOT EXISTS orderbook (
        timestamp TIMESTAMPTZ NOT NULL,
        instrument_id VARCHAR(50) NOT NULL,
        bid_price NUMERIC(20, 8),
        bid_size NUMERIC(20, 8),
        ask_price NUMERIC(20, 8),
        ask_size NUMERIC(20, 8),
        level INTEGER NOT NULL,
        PRIMARY KEY (timestamp, instrument_id, level)
    )
";

const CREATE_OHLCV: &str = r"
    CREATE TABLE IF NOT EXISTS ohlcv (
        timestamp TIMESTAMPTZ NOT NULL,
        instrument_id VARCHAR(50) NOT NULL,
        open NUMERIC(20, 8),
        high NUMERIC(20, 8),
        low NUMERIC(20, 8),
        close NUMERIC(20, 8),
        volume NUMERIC(20, 8),
        PRIMARY KEY (timestamp, instrument_id)
    )
";

/// Ensures relations exist before ingestion starts
pub struct SchemaManager<'a> {
    pool: &'a PgPool,
}

impl<'a> SchemaManager<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and hypertables
    ///
    /// Table creation errors are returned. Partitioning is best effort:
    /// a missing timescaledb extension or an already configured hypertable
    /// is logged and ignored.
    pub async fn ensure(&self) -> Result<()> {
        for ddl in [CREATE_TRADES, CREATE_ORDERBOOK, CREATE_OHLCV] {
            sqlx::query(ddl).execute(self.pool).await?;
        }
        info!("Tables ensured");

        if let Err(e) = sqlx::query("CREATE EXTENSION IF NOT EXISTS timescaledb")
            .execute(self.pool)
            .await
        {
            warn!(error = %e, "Could not enable timescaledb extension");
        }

        for table in [TRADES_TABLE, ORDERBOOK_TABLE, OHLCV_TABLE] {
            match sqlx::query("SELECT create_hypertable($1::regclass, 'timestamp', if_not_exists => TRUE)")
                .bind(table)
                .execute(self.pool)
                .await
            {
                Ok(_) => info!(table = table, "Hypertable ensured"),
                Err(e) => warn!(table = table, error = %e, "Hypertable setup skipped"),
            }
        }

        Ok(())
    }
}
