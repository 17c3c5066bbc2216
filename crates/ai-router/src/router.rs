use crate::config::RouterConfig;
use crate::models::{AiRequest, AiResponse};
use crate::pricing;
use crate::providers::{build_provider, GenerationOptions, Provider, ProviderReply};
use crate::RouterError;
use event_bus::{Event, EventKind, EventSink};
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use coordination_service::RateLimiter;

const MAX_CALL_TIMEOUT: Duration = Duration::from_secs(60);

const STRICT_JSON_INSTRUCTION: &str =
    "Respond with valid JSON only. No prose, no markdown, no code fences.";

/// Snapshot of one provider's configuration for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub name: String,
    pub enabled: bool,
    pub configured: bool,
    pub quota_limit: Option<u64>,
}

/// Routes normalized AI requests to provider backends.
pub struct AiRouter {
    config: RouterConfig,
    providers: HashMap<String, Arc<dyn Provider>>,
    quotas: Arc<RateLimiter>,
    sink: Arc<dyn EventSink>,
}

impl AiRouter {
    pub fn new(config: RouterConfig, quotas: Arc<RateLimiter>, sink: Arc<dyn EventSink>) -> Self {
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        for (name, endpoint) in &config.providers {
            if !endpoint.enabled {
                continue;
            }
            match build_provider(name, endpoint) {
                Some(provider) => {
                    providers.insert(name.clone(), provider);
                }
                None => warn!(provider = %name, "No adapter registered; skipping"),
            }
        }
        info!(count = providers.len(), "AI router initialized");
        Self {
            config,
            providers,
            quotas,
            sink,
        }
    }

    /// Register or replace a provider backend.
    pub fn add_provider(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn provider_health(&self) -> Vec<ProviderHealth> {
        let mut health: Vec<ProviderHealth> = self
            .config
            .providers
            .iter()
            .map(|(name, endpoint)| ProviderHealth {
                name: name.clone(),
                enabled: endpoint.enabled,
                configured: endpoint.api_key.is_some(),
                quota_limit: self.config.quotas.get(name).map(|q| q.max_requests),
            })
            .collect();
        health.sort_by(|a, b| a.name.cmp(&b.name));
        health
    }

    /// Dispatch one request: pick a provider by task type (or honor the
    /// explicit override), walk the fallback chain past quota-exhausted or
    /// unavailable providers, and normalize the winning reply.
    pub async fn dispatch(&self, request: AiRequest) -> Result<AiResponse, RouterError> {
        let explicit = request.explicit_provider.is_some();
        let chain = match &request.explicit_provider {
            Some(provider) => vec![provider.clone()],
            None => {
                let primary = self
                    .config
                    .preferred_provider(request.task_type)
                    .ok_or_else(|| {
                        RouterError::UnknownProvider(request.task_type.as_str().to_string())
                    })?;
                self.config.chain_for(primary)
            }
        };

        let mut last_error = RouterError::Exhausted(request.task_type.as_str().to_string());
        for name in &chain {
            let provider = match self.providers.get(name) {
                Some(provider) => provider.clone(),
                None => {
                    if explicit {
                        return Err(RouterError::UnknownProvider(name.clone()));
                    }
                    continue;
                }
            };

            if !explicit && !self.admit(name).await {
                debug!(provider = %name, "Quota exhausted; trying next in chain");
                last_error = RouterError::RateLimited {
                    provider: name.clone(),
                };
                continue;
            }

            match self.call_with_retry(provider.as_ref(), name, &request).await {
                Ok(response) => return Ok(response),
                Err(error) if error.allows_fallback() && !explicit => {
                    warn!(provider = %name, error = %error, "Provider failed; falling back");
                    last_error = error;
                }
                Err(error) => return Err(error),
            }
        }
        Err(last_error)
    }

    async fn admit(&self, provider: &str) -> bool {
        match self.config.quotas.get(provider) {
            Some(quota) => {
                self.quotas
                    .check("ai:quota", provider, quota.window_ms, quota.max_requests)
                    .await
                    .allowed
            }
            None => true,
        }
    }

    async fn call_with_retry(
        &self,
        provider: &dyn Provider,
        name: &str,
        request: &AiRequest,
    ) -> Result<AiResponse, RouterError> {
        let options = GenerationOptions {
            model: request
                .model
                .clone()
                .unwrap_or_else(|| provider.default_model().to_string()),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            timeout: request
                .timeout
                .map(|t| t.min(MAX_CALL_TIMEOUT))
                .unwrap_or(MAX_CALL_TIMEOUT),
        };
        let system = request.context.clone();

        let max_attempts = 1 + self.config.retry.max_retries;
        let mut backoff = Duration::from_millis(self.config.retry.initial_backoff_ms);
        let max_backoff = Duration::from_millis(self.config.retry.max_backoff_ms);
        let mut last_error = RouterError::ProviderUnavailable(name.to_string());

        for attempt in 1..=max_attempts {
            self.emit_ai_event(EventKind::AiRequest, request, name, &options.model, json!({}))
                .await;
            let started = Instant::now();
            match provider.generate(&request.prompt, system.as_deref(), &options).await {
                Ok(reply) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    let reply = self
                        .ensure_json(provider, name, request, system.as_deref(), &options, reply)
                        .await?;

                    let tokens_used = reply.usage.total_tokens;
                    let cost = pricing::cost_for(name, &reply.model, tokens_used);
                    let confidence = if attempt == 1 { 0.95 } else { 0.85 };
                    let response = AiResponse {
                        text: reply.text,
                        provider: name.to_string(),
                        model: reply.model,
                        tokens_used,
                        cost,
                        confidence,
                        latency_ms,
                    };
                    self.emit_ai_event(
                        EventKind::AiResponse,
                        request,
                        name,
                        &response.model,
                        json!({
                            "tokens_used": response.tokens_used,
                            "cost": response.cost,
                            "latency_ms": response.latency_ms,
                        }),
                    )
                    .await;
                    return Ok(response);
                }
                Err(error) if error.is_retryable() && attempt < max_attempts => {
                    warn!(
                        provider = %name,
                        attempt,
                        error = %error,
                        "Provider call failed; backing off"
                    );
                    tokio::time::sleep(jitter(backoff)).await;
                    backoff = (backoff * 2).min(max_backoff);
                    last_error = error;
                }
                Err(error) => return Err(error),
            }
        }
        Err(last_error)
    }

    /// When the caller expects JSON, validate parseability; retry once with
    /// a strengthened system instruction before surfacing a parse error.
    async fn ensure_json(
        &self,
        provider: &dyn Provider,
        name: &str,
        request: &AiRequest,
        system: Option<&str>,
        options: &GenerationOptions,
        reply: ProviderReply,
    ) -> Result<ProviderReply, RouterError> {
        if !request.parse_json || parses_as_json(&reply.text) {
            return Ok(reply);
        }

        debug!(provider = %name, "Reply is not valid JSON; retrying with strict instruction");
        let strict = match system {
            Some(system) => format!("{}\n\n{}", system, STRICT_JSON_INSTRUCTION),
            None => STRICT_JSON_INSTRUCTION.to_string(),
        };
        self.emit_ai_event(EventKind::AiRequest, request, name, &options.model, json!({}))
            .await;
        let mut retried = provider
            .generate(&request.prompt, Some(&strict), options)
            .await?;
        if !parses_as_json(&retried.text) {
            return Err(RouterError::Parse(format!(
                "{} did not return valid JSON after strict retry",
                name
            )));
        }
        retried.usage.prompt_tokens += reply.usage.prompt_tokens;
        retried.usage.completion_tokens += reply.usage.completion_tokens;
        retried.usage.total_tokens += reply.usage.total_tokens;
        Ok(retried)
    }

    async fn emit_ai_event(
        &self,
        kind: EventKind,
        request: &AiRequest,
        provider: &str,
        model: &str,
        extra: serde_json::Value,
    ) {
        let mut payload = json!({
            "provider": provider,
            "model": model,
            "task_type": request.task_type.as_str(),
        });
        if let Some(trace_id) = &request.trace_id {
            payload["trace_id"] = json!(trace_id);
        }
        if let serde_json::Value::Object(extra) = extra {
            for (key, value) in extra {
                payload[key] = value;
            }
        }
        let event = Event::new(
            request.execution_id.unwrap_or(Uuid::nil()),
            request.node_id.clone(),
            kind,
            payload,
        );
        self.sink.publish(event).await;
    }
}

fn parses_as_json(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text.trim()).is_ok()
}

fn jitter(base: Duration) -> Duration {
    let millis = base.as_millis() as u64;
    let jittered = rand::thread_rng().gen_range(millis / 2..=millis.max(1));
    Duration::from_millis(jittered)
}
