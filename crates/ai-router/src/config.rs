use crate::models::TaskType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub providers: HashMap<String, ProviderEndpoint>,
    /// Preferred provider per task type.
    pub routing_table: HashMap<TaskType, String>,
    /// Providers tried in order once the primary fails or is out of quota.
    pub fallback_chains: HashMap<String, Vec<String>>,
    /// Per-provider fixed-window admission quotas.
    pub quotas: HashMap<String, ProviderQuota>,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub enabled: bool,
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    pub default_model: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProviderQuota {
    pub window_ms: u64,
    pub max_requests: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        let mut providers = HashMap::new();
        providers.insert(
            "groq".to_string(),
            ProviderEndpoint {
                enabled: true,
                base_url: "https://api.groq.com/openai/v1".to_string(),
                api_key: None,
                timeout_ms: 30_000,
                default_model: "llama-3.1-8b-instant".to_string(),
            },
        );
        providers.insert(
            "gemini".to_string(),
            ProviderEndpoint {
                enabled: true,
                base_url: "https://generativelanguage.googleapis.com".to_string(),
                api_key: None,
                timeout_ms: 45_000,
                default_model: "gemini-1.5-flash".to_string(),
            },
        );
        providers.insert(
            "kimi".to_string(),
            ProviderEndpoint {
                enabled: true,
                base_url: "https://api.moonshot.cn/v1".to_string(),
                api_key: None,
                timeout_ms: 60_000,
                default_model: "moonshot-v1-128k".to_string(),
            },
        );
        providers.insert(
            "huggingface".to_string(),
            ProviderEndpoint {
                enabled: true,
                base_url: "https://api-inference.huggingface.co".to_string(),
                api_key: None,
                timeout_ms: 30_000,
                default_model: "cardiffnlp/twitter-roberta-base-sentiment-latest".to_string(),
            },
        );
        providers.insert(
            "qwen".to_string(),
            ProviderEndpoint {
                enabled: true,
                base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string(),
                api_key: None,
                timeout_ms: 45_000,
                default_model: "qwen-plus".to_string(),
            },
        );
        providers.insert(
            "glm4".to_string(),
            ProviderEndpoint {
                enabled: true,
                base_url: "https://open.bigmodel.cn/api/paas/v4".to_string(),
                api_key: None,
                timeout_ms: 45_000,
                default_model: "glm-4-flash".to_string(),
            },
        );

        let routing_table = HashMap::from([
            (TaskType::QuickDecision, "groq".to_string()),
            (TaskType::ContentGeneration, "gemini".to_string()),
            (TaskType::LongContext, "kimi".to_string()),
            (TaskType::SentimentAnalysis, "huggingface".to_string()),
            (TaskType::CodeGeneration, "qwen".to_string()),
            (TaskType::MathReasoning, "glm4".to_string()),
            (TaskType::Multilingual, "qwen".to_string()),
            (TaskType::Auto, "gemini".to_string()),
        ]);

        let fallback_chains = HashMap::from([
            ("groq".to_string(), vec!["gemini".to_string(), "qwen".to_string()]),
            ("gemini".to_string(), vec!["groq".to_string(), "kimi".to_string()]),
            ("kimi".to_string(), vec!["gemini".to_string(), "qwen".to_string()]),
            ("huggingface".to_string(), vec!["gemini".to_string()]),
            ("qwen".to_string(), vec!["glm4".to_string(), "gemini".to_string()]),
            ("glm4".to_string(), vec!["qwen".to_string(), "gemini".to_string()]),
        ]);

        let quotas = HashMap::from([
            ("groq".to_string(), ProviderQuota { window_ms: 60_000, max_requests: 30 }),
            ("gemini".to_string(), ProviderQuota { window_ms: 60_000, max_requests: 60 }),
            ("kimi".to_string(), ProviderQuota { window_ms: 60_000, max_requests: 20 }),
            ("huggingface".to_string(), ProviderQuota { window_ms: 60_000, max_requests: 120 }),
            ("qwen".to_string(), ProviderQuota { window_ms: 60_000, max_requests: 60 }),
            ("glm4".to_string(), ProviderQuota { window_ms: 60_000, max_requests: 60 }),
        ]);

        Self {
            providers,
            routing_table,
            fallback_chains,
            quotas,
            retry: RetryConfig::default(),
        }
    }
}

impl RouterConfig {
    /// Defaults overridden from `<PROVIDER>_API_KEY` / `<PROVIDER>_BASE_URL`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        for (name, endpoint) in config.providers.iter_mut() {
            let prefix = name.to_uppercase();
            if let Ok(key) = env::var(format!("{}_API_KEY", prefix)) {
                endpoint.api_key = Some(key);
            }
            if let Ok(url) = env::var(format!("{}_BASE_URL", prefix)) {
                endpoint.base_url = url;
            }
        }
        config
    }

    pub fn preferred_provider(&self, task_type: TaskType) -> Option<&str> {
        self.routing_table
            .get(&task_type)
            .or_else(|| self.routing_table.get(&TaskType::Auto))
            .map(String::as_str)
    }

    /// The primary followed by its fallback chain, unknown names dropped.
    pub fn chain_for(&self, primary: &str) -> Vec<String> {
        let mut chain = vec![primary.to_string()];
        if let Some(fallbacks) = self.fallback_chains.get(primary) {
            for name in fallbacks {
                if self.providers.contains_key(name) && !chain.contains(name) {
                    chain.push(name.clone());
                }
            }
        }
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_table_covers_every_task_type() {
        let config = RouterConfig::default();
        for task_type in [
            TaskType::QuickDecision,
            TaskType::ContentGeneration,
            TaskType::LongContext,
            TaskType::SentimentAnalysis,
            TaskType::CodeGeneration,
            TaskType::MathReasoning,
            TaskType::Multilingual,
            TaskType::Auto,
        ] {
            let provider = config.preferred_provider(task_type).unwrap();
            assert!(config.providers.contains_key(provider));
        }
        assert_eq!(config.preferred_provider(TaskType::QuickDecision), Some("groq"));
        assert_eq!(config.preferred_provider(TaskType::Auto), Some("gemini"));
    }

    #[test]
    fn chain_starts_with_primary_and_dedupes() {
        let config = RouterConfig::default();
        let chain = config.chain_for("groq");
        assert_eq!(chain[0], "groq");
        assert!(chain.contains(&"gemini".to_string()));
        let unique: std::collections::HashSet<_> = chain.iter().collect();
        assert_eq!(unique.len(), chain.len());
    }
}
