//! AI provider router
//!
//! Dispatches a generic AI request to one of several backends. Selection
//! follows a static task-type routing table, per-provider quota counters
//! gate admission, and provider-specific fallback chains absorb outages.
//! Each provider has a small adapter normalizing its native schema to the
//! common request/response shape, with token and cost accounting from a
//! static price table.

pub mod config;
pub mod models;
pub mod pricing;
pub mod providers;
pub mod router;

pub use config::{ProviderEndpoint, RetryConfig, RouterConfig};
pub use models::{AiRequest, AiResponse, TaskType, TokenUsage};
pub use providers::{GenerationOptions, Provider, ProviderReply};
pub use router::{AiRouter, ProviderHealth};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Response is not valid JSON: {0}")]
    Parse(String),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("All providers exhausted for task: {0}")]
    Exhausted(String),
}

impl RouterError {
    /// Errors worth retrying against the same provider.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RouterError::RateLimited { .. }
                | RouterError::ProviderUnavailable(_)
                | RouterError::Network(_)
        )
    }

    /// Whether the fallback chain may continue past this failure.
    /// Authentication and validation problems surface as-is.
    pub fn allows_fallback(&self) -> bool {
        self.is_retryable()
    }
}
