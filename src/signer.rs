//! Request signing for OKX private endpoints
//!
//! Produces the `sign` value OKX expects: base64 of HMAC-SHA256 over
//! `timestamp + method + request_path + body`, keyed with the API secret.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::fmt;

use crate::error::{MarketDataError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Request path signed by the WebSocket login operation
pub const WS_LOGIN_PATH: &str = "/users/self/verify";

/// Compute the OKX signature for a request
pub fn sign(secret: &str, timestamp: &str, method: &str, path: &str, body: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| MarketDataError::AuthError(format!("failed to init signer: {}", e)))?;
    mac.update(timestamp.as_bytes());
    mac.update(method.as_bytes());
    mac.update(path.as_bytes());
    mac.update(body.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// API credential triple for the feed
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub secret_key: String,
    pub passphrase: String,
}

impl Credentials {
    pub fn new(api_key: &str, secret_key: &str, passphrase: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            secret_key: secret_key.to_string(),
            passphrase: passphrase.to_string(),
        }
    }

    /// Sign a request with this credential's secret
    pub fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> Result<String> {
        sign(&self.secret_key, timestamp, method, path, body)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("secret_key", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

/// WebSocket login frame for private channels
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    op: &'static str,
    args: [LoginArg; 1],
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginArg {
    api_key: String,
    passphrase: String,
    timestamp: String,
    sign: String,
}

impl LoginRequest {
    /// Build a login frame; `timestamp` is unix seconds as OKX expects
    pub fn new(credentials: &Credentials, timestamp: i64) -> Result<Self> {
        let timestamp = timestamp.to_string();
        let sign = credentials.sign(&timestamp, "GET", WS_LOGIN_PATH, "")?;

        Ok(Self {
            op: "login",
            args: [LoginArg {
                api_key: credentials.api_key.clone(),
                passphrase: credentials.passphrase.clone(),
                timestamp,
                sign,
            }],
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| MarketDataError::SerializationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_signature() {
        let token = sign(
            "test_secret",
            "1234567890",
            "GET",
            "/api/v5/account/balance",
            "",
        )
        .unwrap();
        assert_eq!(token, "UBAEffms8J+ZzJAFkj5nkHfoCYCOPhwHwCq4Veu9y0M=");
    }

    #[test]
    fn test_signature_is_deterministic() {
        let a = sign("secret", "1700000000", "GET", "/path", "").unwrap();
        let b = sign("secret", "1700000000", "GET", "/path", "").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_every_input_changes_signature() {
        let base = sign("secret", "1700000000", "GET", "/path", "").unwrap();

        let variants = [
            sign("other", "1700000000", "GET", "/path", "").unwrap(),
            sign("secret", "1700000001", "GET", "/path", "").unwrap(),
            sign("secret", "1700000000", "POST", "/path", "").unwrap(),
            sign("secret", "1700000000", "GET", "/other", "").unwrap(),
            sign("secret", "1700000000", "GET", "/path", "{}").unwrap(),
        ];

        for variant in variants {
            assert_ne!(variant, base);
        }
    }

    #[test]
    fn test_login_request_shape() {
        let creds = Credentials::new("key", "test_secret", "phrase");
        let login = LoginRequest::new(&creds, 1538054050).unwrap();
        let value: serde_json::Value = serde_json::from_str(&login.to_json().unwrap()).unwrap();

        assert_eq!(value["op"], "login");
        let arg = &value["args"][0];
        assert_eq!(arg["apiKey"], "key");
        assert_eq!(arg["passphrase"], "phrase");
        assert_eq!(arg["timestamp"], "1538054050");
        assert_eq!(arg["sign"], "XqT33OhdtPHYWI5oXAXZ6alkg2rXMTCI5bhzb0/6DNk=");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials::new("key", "very-secret", "hunter2");
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("very-secret"));
        assert!(!debug.contains("hunter2"));
    }
}
