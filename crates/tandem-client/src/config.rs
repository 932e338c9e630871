//! Client configuration.

use std::time::Duration;

use tandem_shared::constants::DEFAULT_STUN_SERVERS;
use tandem_shared::{SessionToken, UserId};

use crate::error::{ClientError, Result};

/// Time allowed between a call connecting and its media connecting.
pub const DEFAULT_NEGOTIATION_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the signaling server, e.g. `http://127.0.0.1:8080`.
    pub server_url: String,

    /// Bearer session token issued by the auth service.
    pub token: String,

    pub ice_servers: Vec<String>,

    /// A connected call whose media is not up within this window is ended.
    pub negotiation_timeout: Duration,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            token: token.into(),
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            negotiation_timeout: Duration::from_secs(DEFAULT_NEGOTIATION_TIMEOUT_SECS),
        }
    }

    /// Env: `TANDEM_SERVER_URL`, `TANDEM_TOKEN`, `TANDEM_ICE_SERVERS`
    /// (comma separated), `TANDEM_NEGOTIATION_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::new(
            var("TANDEM_SERVER_URL").unwrap_or_else(|| "http://127.0.0.1:8080".to_string()),
            var("TANDEM_TOKEN").unwrap_or_default(),
        );

        if let Some(list) = var("TANDEM_ICE_SERVERS") {
            let servers: Vec<String> = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if !servers.is_empty() {
                config.ice_servers = servers;
            }
        }

        if let Some(raw) = var("TANDEM_NEGOTIATION_TIMEOUT_SECS") {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.negotiation_timeout = Duration::from_secs(secs),
                _ => tracing::warn!(value = %raw, "Invalid TANDEM_NEGOTIATION_TIMEOUT_SECS, using default"),
            }
        }

        config
    }

    pub fn api_base(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }

    /// The signaling socket URL, carrying the token as a query parameter.
    pub fn ws_url(&self) -> Result<String> {
        let base = self.api_base();
        let rest = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if base.starts_with("ws://") || base.starts_with("wss://") {
            base.to_string()
        } else {
            return Err(ClientError::InvalidUrl(self.server_url.clone()));
        };
        Ok(format!("{rest}/ws?token={}", self.token))
    }

    /// The identity the token was issued for. Not a verification.
    pub fn user_id(&self) -> Result<UserId> {
        Ok(SessionToken::decode(&self.token)?.user_id)
    }
}
