//! Configuration module for the ingestion pipeline

use sqlx::postgres::PgConnectOptions;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::buffer::DEFAULT_FLUSH_THRESHOLD;
use crate::error::{MarketDataError, Result};
use crate::parser::MAX_BOOK_DEPTH;
use crate::signer::Credentials;

/// Storage connection settings
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    /// Connection options for the sqlx pool
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.user)
            .password(&self.password)
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Instruments to subscribe to (e.g., ["BTC-USDT", "ETH-USDT"])
    pub instruments: Vec<String>,

    /// Public WebSocket endpoint
    pub ws_endpoint: String,

    /// Channel topics
    pub trade_channel: String,
    pub book_channel: String,

    /// Order book levels persisted per side
    pub book_depth: usize,

    /// Trades buffered before a batch write
    pub flush_threshold: usize,

    /// Fixed delay between reconnect attempts
    pub reconnect_backoff_secs: u64,

    /// Idle time before a keepalive ping
    pub keepalive_secs: u64,

    /// Health check / metrics port
    pub health_port: u16,

    pub database: DatabaseConfig,

    /// Feed credentials, only needed for private channels
    pub credentials: Option<Credentials>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let instruments: Vec<String> = var("INSTRUMENTS", "BTC-USDT,ETH-USDT,SOL-USDT")
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        if instruments.is_empty() {
            return Err(MarketDataError::ConfigError(
                "INSTRUMENTS must name at least one instrument".to_string(),
            ));
        }

        let book_depth: usize = parse_var(&lookup, "BOOK_DEPTH", MAX_BOOK_DEPTH)?;
        if book_depth == 0 || book_depth > MAX_BOOK_DEPTH {
            return Err(MarketDataError::ConfigError(format!(
                "BOOK_DEPTH must be between 1 and {}, got {}",
                MAX_BOOK_DEPTH, book_depth
            )));
        }

        let flush_threshold: usize = parse_var(&lookup, "FLUSH_THRESHOLD", DEFAULT_FLUSH_THRESHOLD)?;
        if flush_threshold == 0 {
            return Err(MarketDataError::ConfigError(
                "FLUSH_THRESHOLD must be greater than zero".to_string(),
            ));
        }

        let trade_channel = var("TRADE_CHANNEL", "trades");
        let book_channel = var("BOOK_CHANNEL", "books");
        if trade_channel == book_channel {
            return Err(MarketDataError::ConfigError(format!(
                "TRADE_CHANNEL and BOOK_CHANNEL are both {:?}",
                trade_channel
            )));
        }

        let keepalive_secs: u64 = parse_var(&lookup, "KEEPALIVE_SECS", 25)?;
        if keepalive_secs == 0 {
            return Err(MarketDataError::ConfigError(
                "KEEPALIVE_SECS must be greater than zero".to_string(),
            ));
        }

        let password = lookup("DB_PASSWORD")
            .ok_or_else(|| MarketDataError::ConfigError("DB_PASSWORD is not set".to_string()))?;

        let database = DatabaseConfig {
            host: var("DB_HOST", "localhost"),
            port: parse_var(&lookup, "DB_PORT", 5432)?,
            name: var("DB_NAME", "okx_trading"),
            user: var("DB_USER", "postgres"),
            password,
            max_connections: parse_var(&lookup, "DB_MAX_CONNECTIONS", 2)?,
        };

        Ok(Self {
            instruments,
            ws_endpoint: var("WS_ENDPOINT", "wss://ws.okx.com:8443/ws/v5/public"),
            trade_channel,
            book_channel,
            book_depth,
            flush_threshold,
            reconnect_backoff_secs: parse_var(&lookup, "RECONNECT_BACKOFF_SECS", 5)?,
            keepalive_secs,
            health_port: parse_var(&lookup, "HEALTH_PORT", 9090)?,
            database,
            credentials: load_credentials(&lookup)?,
        })
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e| {
            MarketDataError::ConfigError(format!("invalid {} {:?}: {}", key, raw, e))
        }),
        None => Ok(default),
    }
}

/// The credential triple is all-or-nothing
fn load_credentials<F>(lookup: &F) -> Result<Option<Credentials>>
where
    F: Fn(&str) -> Option<String>,
{
    let key = lookup("OKX_API_KEY");
    let secret = lookup("OKX_SECRET_KEY");
    let passphrase = lookup("OKX_PASSPHRASE");

    match (key, secret, passphrase) {
        (Some(key), Some(secret), Some(passphrase)) => {
            Ok(Some(Credentials::new(&key, &secret, &passphrase)))
        }
        (None, None, None) => Ok(None),
        _ => Err(MarketDataError::ConfigError(
            "OKX_API_KEY, OKX_SECRET_KEY and OKX_PASSPHRASE must be set together".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup_from(&[("DB_PASSWORD", "pw")])).unwrap();

        assert_eq!(config.instruments, vec!["BTC-USDT", "ETH-USDT", "SOL-USDT"]);
        assert_eq!(config.flush_threshold, 100);
        assert_eq!(config.reconnect_backoff(), Duration::from_secs(5));
        assert_eq!(config.book_depth, 5);
        assert_eq!(config.trade_channel, "trades");
        assert_eq!(config.book_channel, "books");
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.keepalive(), Duration::from_secs(25));
        assert!(config.credentials.is_none());
    }

    #[test]
    fn test_instruments_are_normalized() {
        let config = Config::from_lookup(lookup_from(&[
            ("DB_PASSWORD", "pw"),
            ("INSTRUMENTS", " btc-usdt , eth-usdt,,"),
        ]))
        .unwrap();

        assert_eq!(config.instruments, vec!["BTC-USDT", "ETH-USDT"]);
    }

    #[test]
    fn test_missing_password_is_fatal() {
        let err = Config::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, MarketDataError::ConfigError(_)));
    }

    #[test]
    fn test_invalid_number_is_fatal() {
        let err = Config::from_lookup(lookup_from(&[
            ("DB_PASSWORD", "pw"),
            ("FLUSH_THRESHOLD", "lots"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("FLUSH_THRESHOLD"));
    }

    #[test]
    fn test_out_of_range_values() {
        for (key, value) in [
            ("FLUSH_THRESHOLD", "0"),
            ("BOOK_DEPTH", "8"),
            ("BOOK_DEPTH", "0"),
            ("KEEPALIVE_SECS", "0"),
        ] {
            let result = Config::from_lookup(lookup_from(&[("DB_PASSWORD", "pw"), (key, value)]));
            assert!(result.is_err(), "{}={} should be rejected", key, value);
        }
    }

    #[test]
    fn test_partial_credentials_rejected() {
        let err = Config::from_lookup(lookup_from(&[
            ("DB_PASSWORD", "pw"),
            ("OKX_API_KEY", "key"),
        ]))
        .unwrap_err();
        assert!(matches!(err, MarketDataError::ConfigError(_)));
    }

    #[test]
    fn test_full_credentials_loaded() {
        let config = Config::from_lookup(lookup_from(&[
            ("DB_PASSWORD", "pw"),
            ("OKX_API_KEY", "key"),
            ("OKX_SECRET_KEY", "secret"),
            ("OKX_PASSPHRASE", "phrase"),
        ]))
        .unwrap();

        let creds = config.credentials.unwrap();
        assert_eq!(creds.api_key, "key");
        assert_eq!(creds.passphrase, "phrase");
    }
}
