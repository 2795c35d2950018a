//! OKX market data ingestion library
//!
//! Subscribes to the OKX trades and order book channels over one WebSocket
//! connection, batches trades, and persists everything into TimescaleDB
//! with idempotent, transactional writes.

pub mod buffer;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod parser;
pub mod signer;
pub mod storage;
pub mod websocket;

pub use buffer::{FlushOutcome, IngestionBuffer};
pub use config::Config;
pub use error::{MarketDataError, Result};
pub use metrics::IngestMetrics;
pub use parser::{OrderBookSnapshot, ParsedMessage, TradeEvent};
pub use signer::{sign, Credentials, LoginRequest};
pub use storage::{MarketSink, MemoryStore, PgWriter, SchemaManager};
pub use websocket::{Supervisor, SupervisorConfig, WsConnector};
