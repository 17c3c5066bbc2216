use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    /// Fallback webhook secret for workflows whose trigger sets none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
    pub rate_limit: RateLimitTier,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitTier {
    pub window_ms: u64,
    pub max_requests: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            webhook_secret: None,
            rate_limit: RateLimitTier {
                window_ms: 60_000,
                max_requests: 100,
            },
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(port) = env::var("PORT").ok().and_then(|v| v.parse().ok()) {
            config.port = port;
        }
        if let Ok(secret) = env::var("WEBHOOK_SECRET") {
            config.webhook_secret = Some(secret);
        }
        if let Some(window_ms) = env::var("RATE_LIMIT_WINDOW_MS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.rate_limit.window_ms = window_ms;
        }
        if let Some(max) = env::var("RATE_LIMIT_MAX")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.rate_limit.max_requests = max;
        }
        config
    }
}
