//! Router dispatch behavior against scripted provider backends.

use ai_router::{
    AiRequest, AiRouter, GenerationOptions, Provider, ProviderReply, RouterConfig, RouterError,
    TaskType, TokenUsage,
};
use async_trait::async_trait;
use coordination_service::RateLimiter;
use event_bus::{EventBus, EventFilter, EventKind};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Provider returning scripted results; after the script is exhausted it
/// answers with a fixed success.
struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<Result<ProviderReply, RouterError>>>,
    calls: AtomicU32,
    fallback_text: String,
}

impl ScriptedProvider {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
            fallback_text: format!("reply from {}", name),
        })
    }

    fn push(&self, result: Result<ProviderReply, RouterError>) {
        self.script.lock().push_back(result);
    }

    fn push_rate_limited(&self, times: usize) {
        for _ in 0..times {
            self.push(Err(RouterError::RateLimited {
                provider: self.name.clone(),
            }));
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn reply(&self, text: &str) -> ProviderReply {
        ProviderReply {
            text: text.to_string(),
            model: "scripted-model".to_string(),
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 20,
                total_tokens: 30,
            },
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }

    async fn generate(
        &self,
        _prompt: &str,
        _system: Option<&str>,
        _options: &GenerationOptions,
    ) -> Result<ProviderReply, RouterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().pop_front() {
            Some(result) => result,
            None => Ok(self.reply(&self.fallback_text)),
        }
    }
}

fn router_with_stubs(
    config: RouterConfig,
    bus: &EventBus,
) -> (AiRouter, Arc<ScriptedProvider>, Arc<ScriptedProvider>) {
    let quotas = Arc::new(RateLimiter::new());
    let mut router = AiRouter::new(config, quotas, Arc::new(bus.clone()));
    let groq = ScriptedProvider::new("groq");
    let gemini = ScriptedProvider::new("gemini");
    router.add_provider("groq", groq.clone());
    router.add_provider("gemini", gemini.clone());
    (router, groq, gemini)
}

fn ai_request_count(bus: &EventBus, provider: &str) -> usize {
    bus.recent(
        100,
        &EventFilter {
            kinds: Some(vec![EventKind::AiRequest]),
            ..Default::default()
        },
    )
    .iter()
    .filter(|e| e.payload["provider"] == provider)
    .count()
}

#[tokio::test]
async fn routes_by_task_type() {
    let bus = EventBus::default();
    let (router, groq, gemini) = router_with_stubs(RouterConfig::default(), &bus);

    let response = router
        .dispatch(AiRequest::new(TaskType::QuickDecision, "approve?"))
        .await
        .unwrap();

    assert_eq!(response.provider, "groq");
    assert_eq!(response.tokens_used, 30);
    assert_eq!(groq.calls(), 1);
    assert_eq!(gemini.calls(), 0);
}

#[tokio::test]
async fn explicit_provider_bypasses_routing_table() {
    let bus = EventBus::default();
    let (router, groq, gemini) = router_with_stubs(RouterConfig::default(), &bus);

    let mut request = AiRequest::new(TaskType::QuickDecision, "hello");
    request.explicit_provider = Some("gemini".to_string());
    let response = router.dispatch(request).await.unwrap();

    assert_eq!(response.provider, "gemini");
    assert_eq!(groq.calls(), 0);
    assert_eq!(gemini.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn retries_then_falls_back_down_the_chain() {
    let bus = EventBus::default();
    let (router, groq, gemini) = router_with_stubs(RouterConfig::default(), &bus);
    // Primary rate-limits through the whole retry budget.
    groq.push_rate_limited(4);

    let response = router
        .dispatch(AiRequest::new(TaskType::QuickDecision, "approve?"))
        .await
        .unwrap();

    assert_eq!(response.provider, "gemini");
    // 1 initial + 3 retries against groq, then one fresh request to gemini.
    assert_eq!(groq.calls(), 4);
    assert_eq!(gemini.calls(), 1);
    assert_eq!(ai_request_count(&bus, "groq"), 4);
    assert_eq!(ai_request_count(&bus, "gemini"), 1);

    let responses = bus.recent(
        100,
        &EventFilter {
            kinds: Some(vec![EventKind::AiResponse]),
            ..Default::default()
        },
    );
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].payload["provider"], "gemini");
}

#[tokio::test]
async fn auth_errors_do_not_fall_back() {
    let bus = EventBus::default();
    let (router, groq, gemini) = router_with_stubs(RouterConfig::default(), &bus);
    groq.push(Err(RouterError::Auth("bad key".to_string())));

    let error = router
        .dispatch(AiRequest::new(TaskType::QuickDecision, "approve?"))
        .await
        .unwrap_err();

    assert!(matches!(error, RouterError::Auth(_)));
    assert_eq!(groq.calls(), 1);
    assert_eq!(gemini.calls(), 0);
}

#[tokio::test]
async fn quota_exhaustion_skips_to_fallback_without_calling() {
    let bus = EventBus::default();
    let mut config = RouterConfig::default();
    if let Some(quota) = config.quotas.get_mut("groq") {
        quota.max_requests = 0;
    }
    let (router, groq, gemini) = router_with_stubs(config, &bus);

    let response = router
        .dispatch(AiRequest::new(TaskType::QuickDecision, "approve?"))
        .await
        .unwrap();

    assert_eq!(response.provider, "gemini");
    assert_eq!(groq.calls(), 0);
    assert_eq!(gemini.calls(), 1);
}

#[tokio::test]
async fn parse_json_retries_once_with_strict_instruction() {
    let bus = EventBus::default();
    let (router, _groq, gemini) = router_with_stubs(RouterConfig::default(), &bus);
    gemini.push(Ok(gemini.reply("Sure! Here is your JSON: {\"a\": 1}")));
    gemini.push(Ok(gemini.reply("{\"a\": 1}")));

    let mut request = AiRequest::new(TaskType::Auto, "give me json");
    request.parse_json = true;
    let response = router.dispatch(request).await.unwrap();

    assert_eq!(response.text, "{\"a\": 1}");
    assert_eq!(gemini.calls(), 2);
    // Both attempts' tokens are accounted.
    assert_eq!(response.tokens_used, 60);
}

#[tokio::test]
async fn parse_json_surfaces_error_after_second_failure() {
    let bus = EventBus::default();
    let (router, _groq, gemini) = router_with_stubs(RouterConfig::default(), &bus);
    gemini.push(Ok(gemini.reply("not json")));
    gemini.push(Ok(gemini.reply("still not json")));

    let mut request = AiRequest::new(TaskType::Auto, "give me json");
    request.parse_json = true;
    let error = router.dispatch(request).await.unwrap_err();

    assert!(matches!(error, RouterError::Parse(_)));
}

#[tokio::test]
async fn unknown_explicit_provider_is_rejected() {
    let bus = EventBus::default();
    let (router, _groq, _gemini) = router_with_stubs(RouterConfig::default(), &bus);

    let mut request = AiRequest::new(TaskType::Auto, "hello");
    request.explicit_provider = Some("nonexistent".to_string());
    let error = router.dispatch(request).await.unwrap_err();

    assert!(matches!(error, RouterError::UnknownProvider(_)));
}
