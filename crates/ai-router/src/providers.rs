//! Provider adapters
//!
//! Each adapter maps the native request/response schema of one backend to
//! the common shape and extracts token usage. Groq, Kimi, Qwen and GLM-4
//! all speak OpenAI-compatible chat completions, so one parameterized
//! adapter covers them; Gemini and HuggingFace have their own wire formats.

use crate::config::ProviderEndpoint;
use crate::models::TokenUsage;
use crate::RouterError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Options resolved by the router for a single provider call.
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

/// A provider's raw reply before cost accounting.
#[derive(Debug, Clone)]
pub struct ProviderReply {
    pub text: String,
    pub model: String,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    fn default_model(&self) -> &str;
    async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        options: &GenerationOptions,
    ) -> Result<ProviderReply, RouterError>;
}

fn map_status(provider: &str, status: StatusCode, body: &str) -> RouterError {
    match status.as_u16() {
        401 | 403 => RouterError::Auth(format!("{}: {}", provider, status)),
        429 => RouterError::RateLimited {
            provider: provider.to_string(),
        },
        code if code >= 500 => {
            RouterError::ProviderUnavailable(format!("{}: {} {}", provider, status, body))
        }
        _ => RouterError::Validation(format!("{}: {} {}", provider, status, body)),
    }
}

fn map_request_error(provider: &str, error: reqwest::Error) -> RouterError {
    if error.is_timeout() {
        RouterError::ProviderUnavailable(format!("{}: request timed out", provider))
    } else {
        RouterError::Network(format!("{}: {}", provider, error))
    }
}

/// OpenAI-compatible `/chat/completions` adapter.
pub struct OpenAiCompatProvider {
    name: String,
    endpoint: ProviderEndpoint,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    model: Option<String>,
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

impl OpenAiCompatProvider {
    pub fn new(name: impl Into<String>, endpoint: ProviderEndpoint) -> Self {
        Self {
            name: name.into(),
            endpoint,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        &self.endpoint.default_model
    }

    async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        options: &GenerationOptions,
    ) -> Result<ProviderReply, RouterError> {
        let api_key = self
            .endpoint
            .api_key
            .as_deref()
            .ok_or_else(|| RouterError::Auth(format!("{}: no API key configured", self.name)))?;

        let mut messages = Vec::new();
        if let Some(system) = system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": prompt}));

        let body = json!({
            "model": options.model,
            "messages": messages,
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
            "stream": false,
        });

        let url = format!(
            "{}/chat/completions",
            self.endpoint.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .timeout(options.timeout)
            .send()
            .await
            .map_err(|e| map_request_error(&self.name, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(&self.name, status, &body));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| RouterError::ProviderUnavailable(format!("{}: bad response body: {}", self.name, e)))?;

        let text = parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| {
                RouterError::ProviderUnavailable(format!("{}: empty choices", self.name))
            })?;

        let usage = match parsed.usage {
            Some(u) => TokenUsage {
                prompt_tokens: u.prompt_tokens.unwrap_or(0),
                completion_tokens: u.completion_tokens.unwrap_or(0),
                total_tokens: u
                    .total_tokens
                    .unwrap_or(u.prompt_tokens.unwrap_or(0) + u.completion_tokens.unwrap_or(0)),
            },
            None => TokenUsage::estimate(prompt, &text),
        };

        Ok(ProviderReply {
            text,
            model: parsed.model.unwrap_or_else(|| options.model.clone()),
            usage,
        })
    }
}

/// Google Gemini `generateContent` adapter.
pub struct GeminiProvider {
    endpoint: ProviderEndpoint,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u32>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u32>,
    #[serde(rename = "totalTokenCount")]
    total_token_count: Option<u32>,
}

impl GeminiProvider {
    pub fn new(endpoint: ProviderEndpoint) -> Self {
        Self {
            endpoint,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn default_model(&self) -> &str {
        &self.endpoint.default_model
    }

    async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        options: &GenerationOptions,
    ) -> Result<ProviderReply, RouterError> {
        let api_key = self
            .endpoint
            .api_key
            .as_deref()
            .ok_or_else(|| RouterError::Auth("gemini: no API key configured".to_string()))?;

        let mut body = json!({
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": options.temperature,
                "maxOutputTokens": options.max_tokens,
            }
        });
        if let Some(system) = system {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }

        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.endpoint.base_url.trim_end_matches('/'),
            options.model,
            api_key
        );
        let response = self
            .client
            .post(&url)
            .json(&body)
            .timeout(options.timeout)
            .send()
            .await
            .map_err(|e| map_request_error("gemini", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status("gemini", status, &body));
        }

        let parsed: GeminiResponse = response
            .json()
            .await
            .map_err(|e| RouterError::ProviderUnavailable(format!("gemini: bad response body: {}", e)))?;

        let text = parsed
            .candidates
            .as_ref()
            .and_then(|c| c.first())
            .and_then(|c| c.content.parts.first())
            .and_then(|p| p.text.clone())
            .ok_or_else(|| RouterError::ProviderUnavailable("gemini: empty candidates".to_string()))?;

        let usage = match parsed.usage_metadata {
            Some(u) => TokenUsage {
                prompt_tokens: u.prompt_token_count.unwrap_or(0),
                completion_tokens: u.candidates_token_count.unwrap_or(0),
                total_tokens: u.total_token_count.unwrap_or(0),
            },
            None => TokenUsage::estimate(prompt, &text),
        };

        Ok(ProviderReply {
            text,
            model: options.model.clone(),
            usage,
        })
    }
}

/// HuggingFace inference API adapter.
///
/// Used for classification-style tasks; the API reports no token usage,
/// so tokens are estimated.
pub struct HuggingFaceProvider {
    endpoint: ProviderEndpoint,
    client: Client,
}

impl HuggingFaceProvider {
    pub fn new(endpoint: ProviderEndpoint) -> Self {
        Self {
            endpoint,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Provider for HuggingFaceProvider {
    fn name(&self) -> &str {
        "huggingface"
    }

    fn default_model(&self) -> &str {
        &self.endpoint.default_model
    }

    async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        options: &GenerationOptions,
    ) -> Result<ProviderReply, RouterError> {
        let api_key = self
            .endpoint
            .api_key
            .as_deref()
            .ok_or_else(|| RouterError::Auth("huggingface: no API key configured".to_string()))?;

        let input = match system {
            Some(system) => format!("{}\n\n{}", system, prompt),
            None => prompt.to_string(),
        };
        let body = json!({
            "inputs": input,
            "parameters": {
                "temperature": options.temperature,
                "max_new_tokens": options.max_tokens,
            }
        });

        let url = format!(
            "{}/models/{}",
            self.endpoint.base_url.trim_end_matches('/'),
            options.model
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .timeout(options.timeout)
            .send()
            .await
            .map_err(|e| map_request_error("huggingface", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status("huggingface", status, &body));
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RouterError::ProviderUnavailable(format!("huggingface: bad response body: {}", e)))?;

        // Text-generation replies are `[{"generated_text": ...}]`;
        // classification replies are label/score arrays returned verbatim.
        let text = parsed
            .get(0)
            .and_then(|v| v.get("generated_text"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| parsed.to_string());

        Ok(ProviderReply {
            usage: TokenUsage::estimate(&input, &text),
            model: options.model.clone(),
            text,
        })
    }
}

/// Instantiate the adapter registered for `name`.
pub fn build_provider(
    name: &str,
    endpoint: &ProviderEndpoint,
) -> Option<std::sync::Arc<dyn Provider>> {
    match name {
        "gemini" => Some(std::sync::Arc::new(GeminiProvider::new(endpoint.clone()))),
        "huggingface" => Some(std::sync::Arc::new(HuggingFaceProvider::new(endpoint.clone()))),
        "groq" | "kimi" | "qwen" | "glm4" => Some(std::sync::Arc::new(
            OpenAiCompatProvider::new(name, endpoint.clone()),
        )),
        _ => None,
    }
}
