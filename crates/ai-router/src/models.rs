use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Task categories the routing table keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    QuickDecision,
    ContentGeneration,
    LongContext,
    SentimentAnalysis,
    CodeGeneration,
    MathReasoning,
    Multilingual,
    #[default]
    Auto,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::QuickDecision => "quick_decision",
            TaskType::ContentGeneration => "content_generation",
            TaskType::LongContext => "long_context",
            TaskType::SentimentAnalysis => "sentiment_analysis",
            TaskType::CodeGeneration => "code_generation",
            TaskType::MathReasoning => "math_reasoning",
            TaskType::Multilingual => "multilingual",
            TaskType::Auto => "auto",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "quick_decision" => Some(TaskType::QuickDecision),
            "content_generation" => Some(TaskType::ContentGeneration),
            "long_context" => Some(TaskType::LongContext),
            "sentiment_analysis" => Some(TaskType::SentimentAnalysis),
            "code_generation" => Some(TaskType::CodeGeneration),
            "math_reasoning" => Some(TaskType::MathReasoning),
            "multilingual" => Some(TaskType::Multilingual),
            "auto" | "" => Some(TaskType::Auto),
            _ => None,
        }
    }
}

/// A normalized AI request, provider-agnostic.
#[derive(Debug, Clone)]
pub struct AiRequest {
    pub task_type: TaskType,
    /// Bypass the routing table and force a provider.
    pub explicit_provider: Option<String>,
    pub model: Option<String>,
    pub prompt: String,
    pub context: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Validate the reply parses as JSON, retrying once with a stronger
    /// instruction before failing.
    pub parse_json: bool,
    pub trace_id: Option<String>,
    /// Execution context stamped on the ai_request/ai_response events.
    pub execution_id: Option<Uuid>,
    pub node_id: Option<String>,
    /// Caller deadline; the HTTP call uses min(this, 60s).
    pub timeout: Option<Duration>,
}

impl AiRequest {
    pub fn new(task_type: TaskType, prompt: impl Into<String>) -> Self {
        Self {
            task_type,
            explicit_provider: None,
            model: None,
            prompt: prompt.into(),
            context: None,
            temperature: 0.7,
            max_tokens: 1024,
            parse_json: false,
            trace_id: None,
            execution_id: None,
            node_id: None,
            timeout: None,
        }
    }
}

/// The normalized reply handed back to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiResponse {
    pub text: String,
    pub provider: String,
    pub model: String,
    pub tokens_used: u32,
    pub cost: f64,
    pub confidence: f32,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    /// Rough 4-chars-per-token estimate for providers that report nothing.
    pub fn estimate(prompt: &str, completion: &str) -> Self {
        let prompt_tokens = (prompt.len() / 4) as u32;
        let completion_tokens = (completion.len() / 4) as u32;
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}
