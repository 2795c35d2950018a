//! Parser module for OKX WebSocket messages
//!
//! Classifies inbound frames as trades, order book snapshots, control events
//! or heartbeats. Records inside a data frame are parsed one by one: a
//! malformed record is rejected on its own and never aborts the frame.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Maximum order book levels persisted per side
pub const MAX_BOOK_DEPTH: usize = 5;

/// Aggressor side of a trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }
}

impl FromStr for TradeSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(TradeSide::Buy),
            "sell" => Ok(TradeSide::Sell),
            other => Err(format!("unknown trade side {:?}", other)),
        }
    }
}

/// Normalized trade print
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TradeEvent {
    pub timestamp: DateTime<Utc>,
    pub instrument_id: String,
    pub trade_id: String,
    pub side: TradeSide,
    pub price: Decimal,
    pub size: Decimal,
}

/// Identity of a trade row in storage
pub type TradeKey = (DateTime<Utc>, String, String);

impl TradeEvent {
    pub fn key(&self) -> TradeKey {
        (
            self.timestamp,
            self.instrument_id.clone(),
            self.trade_id.clone(),
        )
    }
}

/// Price level (price, size pair)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BookSide {
    Bid,
    Ask,
}

/// One level of one side of a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBookLevel {
    pub timestamp: DateTime<Utc>,
    pub instrument_id: String,
    pub level: u32,
    pub side: BookSide,
    pub price: Decimal,
    pub size: Decimal,
}

/// Persisted shape of a level: bid and ask sharing one level index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookRow {
    pub level: u32,
    pub bid: Option<PriceLevel>,
    pub ask: Option<PriceLevel>,
}

/// Top-of-book snapshot for one instrument
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderBookSnapshot {
    pub timestamp: DateTime<Utc>,
    pub instrument_id: String,
    /// `snapshot` or `update` on incremental channels
    pub action: Option<String>,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl OrderBookSnapshot {
    /// Flatten into per-side levels, indexed from 0
    pub fn levels(&self) -> Vec<OrderBookLevel> {
        let side_levels = |side: BookSide, levels: &[PriceLevel]| {
            levels
                .iter()
                .take(MAX_BOOK_DEPTH)
                .enumerate()
                .map(|(i, l)| OrderBookLevel {
                    timestamp: self.timestamp,
                    instrument_id: self.instrument_id.clone(),
                    level: i as u32,
                    side,
                    price: l.price,
                    size: l.size,
                })
                .collect::<Vec<_>>()
        };

        let mut out = side_levels(BookSide::Bid, &self.bids);
        out.extend(side_levels(BookSide::Ask, &self.asks));
        out
    }

    /// Rows as stored, one per level index, never more than `MAX_BOOK_DEPTH`
    pub fn rows(&self) -> Vec<BookRow> {
        let depth = self.bids.len().max(self.asks.len()).min(MAX_BOOK_DEPTH);
        (0..depth)
            .map(|i| BookRow {
                level: i as u32,
                bid: self.bids.get(i).cloned(),
                ask: self.asks.get(i).cloned(),
            })
            .collect()
    }
}

/// A record of a data frame that could not be parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordError {
    pub index: usize,
    pub reason: String,
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record {}: {}", self.index, self.reason)
    }
}

/// Parsed trades frame
#[derive(Debug, Clone)]
pub struct TradeFrame {
    pub channel: String,
    pub records: Vec<TradeEvent>,
    pub rejected: Vec<RecordError>,
}

/// Parsed order book frame
#[derive(Debug, Clone)]
pub struct BookFrame {
    pub channel: String,
    pub instrument_id: Option<String>,
    pub records: Vec<OrderBookSnapshot>,
    pub rejected: Vec<RecordError>,
}

/// Control message (subscription ack, error, login, notice)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEvent {
    pub event: String,
    pub channel: Option<String>,
    pub instrument_id: Option<String>,
    pub code: Option<String>,
    pub msg: Option<String>,
}

impl ControlEvent {
    pub fn is_error(&self) -> bool {
        self.event == "error"
    }
}

/// Parsed WebSocket message
#[derive(Debug, Clone)]
pub enum ParsedMessage {
    Trades(TradeFrame),
    Books(BookFrame),
    Control(ControlEvent),
    Heartbeat,
    Unknown(String),
}

impl ParsedMessage {
    /// Parse a raw WebSocket text frame, keeping `depth` book levels per side
    pub fn parse(raw: &str, depth: usize) -> Result<Self, serde_json::Error> {
        if raw.trim() == "pong" {
            return Ok(ParsedMessage::Heartbeat);
        }

        let frame: RawFrame = serde_json::from_str(raw)?;

        if let Some(event) = frame.event {
            let (channel, instrument_id) = match frame.arg {
                Some(arg) => (Some(arg.channel), arg.inst_id),
                None => (None, None),
            };
            return Ok(ParsedMessage::Control(ControlEvent {
                event,
                channel,
                instrument_id,
                code: frame.code.map(value_to_string),
                msg: frame.msg,
            }));
        }

        let (arg, data) = match (frame.arg, frame.data) {
            (Some(arg), Some(data)) => (arg, data),
            _ => return Ok(ParsedMessage::Unknown(raw.to_string())),
        };

        if arg.channel.starts_with("trades") {
            let (records, rejected) = parse_records(data, |_, value| parse_trade(value));
            Ok(ParsedMessage::Trades(TradeFrame {
                channel: arg.channel,
                records,
                rejected,
            }))
        } else if arg.channel.starts_with("books") || arg.channel == "bbo-tbt" {
            let instrument_id = arg.inst_id;
            let action = frame.action;
            let (records, rejected) = parse_records(data, |_, value| {
                parse_book(value, instrument_id.as_deref(), action.as_deref(), depth)
            });
            Ok(ParsedMessage::Books(BookFrame {
                channel: arg.channel,
                instrument_id,
                records,
                rejected,
            }))
        } else {
            Ok(ParsedMessage::Unknown(raw.to_string()))
        }
    }

    /// Channel the message belongs to, if any
    pub fn channel(&self) -> Option<&str> {
        match self {
            ParsedMessage::Trades(frame) => Some(&frame.channel),
            ParsedMessage::Books(frame) => Some(&frame.channel),
            ParsedMessage::Control(event) => event.channel.as_deref(),
            ParsedMessage::Heartbeat | ParsedMessage::Unknown(_) => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    event: Option<String>,
    arg: Option<RawArg>,
    data: Option<Vec<Value>>,
    action: Option<String>,
    code: Option<Value>,
    msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawArg {
    channel: String,
    #[serde(rename = "instId")]
    inst_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTrade {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(rename = "tradeId")]
    trade_id: String,
    side: String,
    px: String,
    sz: String,
    ts: String,
}

#[derive(Debug, Deserialize)]
struct RawBook {
    ts: String,
    #[serde(default)]
    bids: Vec<Vec<String>>,
    #[serde(default)]
    asks: Vec<Vec<String>>,
}

fn parse_records<T, F>(data: Vec<Value>, mut parse: F) -> (Vec<T>, Vec<RecordError>)
where
    F: FnMut(usize, Value) -> Result<T, String>,
{
    let mut records = Vec::with_capacity(data.len());
    let mut rejected = Vec::new();

    for (index, value) in data.into_iter().enumerate() {
        match parse(index, value) {
            Ok(record) => records.push(record),
            Err(reason) => rejected.push(RecordError { index, reason }),
        }
    }

    (records, rejected)
}

fn parse_trade(value: Value) -> Result<TradeEvent, String> {
    let raw: RawTrade = serde_json::from_value(value).map_err(|e| e.to_string())?;

    if raw.inst_id.is_empty() {
        return Err("empty instrument id".to_string());
    }
    if raw.trade_id.is_empty() {
        return Err("empty trade id".to_string());
    }

    Ok(TradeEvent {
        timestamp: parse_timestamp(&raw.ts)?,
        side: raw.side.parse()?,
        price: parse_decimal("px", &raw.px)?,
        size: parse_decimal("sz", &raw.sz)?,
        instrument_id: raw.inst_id,
        trade_id: raw.trade_id,
    })
}

fn parse_book(
    value: Value,
    instrument_id: Option<&str>,
    action: Option<&str>,
    depth: usize,
) -> Result<OrderBookSnapshot, String> {
    let instrument_id = match instrument_id {
        Some(id) if !id.is_empty() => id,
        _ => return Err("book frame without instrument id".to_string()),
    };
    let raw: RawBook = serde_json::from_value(value).map_err(|e| e.to_string())?;
    let depth = depth.min(MAX_BOOK_DEPTH);

    Ok(OrderBookSnapshot {
        timestamp: parse_timestamp(&raw.ts)?,
        instrument_id: instrument_id.to_string(),
        action: action.map(str::to_string),
        bids: parse_levels("bids", &raw.bids, depth)?,
        asks: parse_levels("asks", &raw.asks, depth)?,
    })
}

fn parse_levels(side: &str, raw: &[Vec<String>], depth: usize) -> Result<Vec<PriceLevel>, String> {
    raw.iter()
        .take(depth)
        .enumerate()
        .map(|(i, entry)| {
            if entry.len() < 2 {
                return Err(format!("{}[{}]: expected [price, size, ..]", side, i));
            }
            Ok(PriceLevel {
                price: parse_decimal("price", &entry[0])?,
                size: parse_decimal("size", &entry[1])?,
            })
        })
        .collect()
}

fn parse_decimal(field: &str, raw: &str) -> Result<Decimal, String> {
    let value = Decimal::from_str(raw).map_err(|e| format!("invalid {} {:?}: {}", field, raw, e))?;
    if value.is_sign_negative() && !value.is_zero() {
        return Err(format!("negative {} {:?}", field, raw));
    }
    Ok(value)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    let millis: i64 = raw
        .parse()
        .map_err(|e| format!("invalid ts {:?}: {}", raw, e))?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| format!("ts {} out of range", millis))
}

fn value_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}
