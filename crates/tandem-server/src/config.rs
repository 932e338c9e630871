//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tandem_shared::constants::{
    APP_NAME, DEFAULT_HISTORY_LIMIT, DEFAULT_HTTP_PORT, DEFAULT_RING_TIMEOUT_SECS,
    DEFAULT_SWEEP_INTERVAL_SECS,
};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Env: `HTTP_ADDR`, default `0.0.0.0:8080`.
    pub http_addr: SocketAddr,

    /// Env: `DATABASE_PATH`. Unset uses the platform data directory.
    pub database_path: Option<PathBuf>,

    /// Ed25519 public key of the session token issuer (hex, 64 chars).
    /// Env: `AUTH_PUBKEY`
    /// Default: all-zeros, which rejects every token (development only).
    pub auth_pubkey: [u8; 32],

    /// Admin API bearer token. Env: `ADMIN_TOKEN`; unset disables `/admin/*`.
    pub admin_token: Option<String>,

    /// How long a call may ring before it is marked missed.
    /// Env: `RING_TIMEOUT_SECS` (0 disables), default 30.
    pub ring_timeout: Option<Duration>,

    /// Env: `SWEEP_INTERVAL_SECS`, default 15.
    pub sweep_interval: Duration,

    /// Env: `HISTORY_LIMIT`, default 50.
    pub history_limit: u32,

    /// Env: `RATE_LIMIT_PER_MIN`, default 100.
    pub rate_limit_per_min: u32,

    /// Env: `INSTANCE_NAME`
    pub instance_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: None,
            auth_pubkey: [0u8; 32],
            admin_token: None,
            ring_timeout: Some(Duration::from_secs(DEFAULT_RING_TIMEOUT_SECS)),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            history_limit: DEFAULT_HISTORY_LIMIT,
            rate_limit_per_min: 100,
            instance_name: APP_NAME.to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = var("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(path) = var("DATABASE_PATH") {
            config.database_path = Some(PathBuf::from(path));
        }

        if let Some(hex_key) = var("AUTH_PUBKEY") {
            match parse_hex_pubkey(&hex_key) {
                Ok(key) => config.auth_pubkey = key,
                Err(e) => tracing::warn!(
                    error = %e,
                    "Invalid AUTH_PUBKEY, using default (dev-only)"
                ),
            }
        }

        if let Some(token) = var("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Some(secs) = parse_number::<u64>(&var, "RING_TIMEOUT_SECS") {
            config.ring_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(secs) = parse_number::<u64>(&var, "SWEEP_INTERVAL_SECS") {
            if secs > 0 {
                config.sweep_interval = Duration::from_secs(secs);
            }
        }

        if let Some(limit) = parse_number::<u32>(&var, "HISTORY_LIMIT") {
            config.history_limit = limit;
        }

        if let Some(rate) = parse_number::<u32>(&var, "RATE_LIMIT_PER_MIN") {
            config.rate_limit_per_min = rate;
        }

        if let Some(name) = var("INSTANCE_NAME") {
            config.instance_name = name;
        }

        config
    }
}

fn parse_number<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse::<T>() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid number, using default");
            None
        }
    }
}

/// Parse a 64-character hex string into a 32-byte array.
fn parse_hex_pubkey(hex_key: &str) -> Result<[u8; 32], String> {
    let hex_key = hex_key.trim();
    if hex_key.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", hex_key.len()));
    }
    let bytes = hex::decode(hex_key).map_err(|e| e.to_string())?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::from_lookup(lookup(&[]));
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.auth_pubkey, [0u8; 32]);
        assert_eq!(config.ring_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.history_limit, 50);
        assert!(config.admin_token.is_none());
        assert!(config.database_path.is_none());
    }

    #[test]
    fn test_overrides() {
        let key = "ab".repeat(32);
        let config = ServerConfig::from_lookup(lookup(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("AUTH_PUBKEY", key.as_str()),
            ("RING_TIMEOUT_SECS", "45"),
            ("HISTORY_LIMIT", "10"),
            ("ADMIN_TOKEN", "secret"),
            ("DATABASE_PATH", "/var/lib/tandem/calls.db"),
        ]));
        assert_eq!(config.http_addr.port(), 9000);
        assert_eq!(config.auth_pubkey, [0xab; 32]);
        assert_eq!(config.ring_timeout, Some(Duration::from_secs(45)));
        assert_eq!(config.history_limit, 10);
        assert_eq!(config.admin_token.as_deref(), Some("secret"));
        assert_eq!(
            config.database_path,
            Some(PathBuf::from("/var/lib/tandem/calls.db"))
        );
    }

    #[test]
    fn test_zero_ring_timeout_disables_missed() {
        let config = ServerConfig::from_lookup(lookup(&[("RING_TIMEOUT_SECS", "0")]));
        assert!(config.ring_timeout.is_none());
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("HTTP_ADDR", "nowhere"),
            ("AUTH_PUBKEY", "abcd"),
            ("HISTORY_LIMIT", "lots"),
        ]));
        assert_eq!(config.http_addr.port(), 8080);
        assert_eq!(config.auth_pubkey, [0u8; 32]);
        assert_eq!(config.history_limit, 50);
    }
}
