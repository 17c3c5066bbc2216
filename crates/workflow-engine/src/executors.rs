//! Node executors
//!
//! One handler per node kind. Executors receive the workflow snapshot and
//! the execution's variables and either complete with an output value and
//! metrics, suspend (human task, timer), or fail with a retryable or
//! non-retryable error.

use crate::approvals::{ApprovalService, ApprovalTicket};
use crate::expression;
use crate::interpolate::{interpolate, interpolate_value, resolve_path, value_to_string};
use ai_router::{AiRequest, AiRouter, TaskType};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{json, Map, Value};
use state_store::{
    AiProcessorConfig, ConditionConfig, DataConfig, Execution, HttpActionConfig, HumanTaskConfig,
    Node, NodeKind, NodeMetrics, TimerConfig, TransformConfig, TransformOperation, TriggerConfig,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;

#[derive(Error, Debug)]
pub enum ExecutorError {
    /// Transient failures the engine may re-enqueue with backoff.
    #[error("{0}")]
    Retryable(String),

    #[error("{0}")]
    NonRetryable(String),

    #[error("Missing required variable: {0}")]
    MissingVariable(String),
}

impl ExecutorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutorError::Retryable(_))
    }
}

/// A node's cooperative yield back to the engine.
#[derive(Debug, Clone)]
pub enum Suspension {
    Approval { ticket: ApprovalTicket },
    Timer { wake_at: DateTime<Utc> },
}

pub enum ExecutorOutcome {
    Completed { output: Value, metrics: NodeMetrics },
    Suspended(Suspension),
}

impl ExecutorOutcome {
    fn plain(output: Value) -> Self {
        ExecutorOutcome::Completed {
            output,
            metrics: NodeMetrics::default(),
        }
    }
}

/// Per-node timeout used for the run and the lock TTL.
pub fn node_timeout(node: &Node, default: Duration) -> Duration {
    match &node.kind {
        NodeKind::HttpAction(config) => {
            Duration::from_millis(config.timeout_ms.unwrap_or(DEFAULT_HTTP_TIMEOUT_MS))
        }
        _ => default,
    }
}

#[derive(Clone)]
pub struct NodeExecutor {
    router: Arc<AiRouter>,
    approvals: Arc<ApprovalService>,
    http: Client,
}

impl NodeExecutor {
    pub fn new(router: Arc<AiRouter>, approvals: Arc<ApprovalService>) -> Self {
        Self {
            router,
            approvals,
            http: Client::new(),
        }
    }

    pub async fn execute(
        &self,
        execution: &Execution,
        node: &Node,
    ) -> Result<ExecutorOutcome, ExecutorError> {
        let variables = &execution.variables;
        match &node.kind {
            NodeKind::Trigger(config) => Ok(passthrough(variables, config)),
            NodeKind::DataInput(config) => Ok(data_input(variables, config)),
            NodeKind::DataOutput(config) => data_output(variables, config),
            NodeKind::Timer(config) => Ok(timer(config)),
            NodeKind::Transform(config) => transform(variables, config),
            NodeKind::Condition(config) => condition(variables, config, false),
            NodeKind::Decision(config) => condition(variables, config, true),
            NodeKind::HttpAction(config) => self.http_action(variables, config).await,
            NodeKind::AiProcessor(config) => self.ai_processor(execution, node, config).await,
            NodeKind::HumanTask(config) => Ok(self.human_task(execution, node, config).await),
        }
    }

    async fn http_action(
        &self,
        variables: &Map<String, Value>,
        config: &HttpActionConfig,
    ) -> Result<ExecutorOutcome, ExecutorError> {
        let required = &config.validation.required;
        let url =
            interpolate(&config.url, variables, required).map_err(ExecutorError::MissingVariable)?;
        let method = reqwest::Method::from_bytes(config.method.to_uppercase().as_bytes())
            .map_err(|_| ExecutorError::NonRetryable(format!("bad method: {}", config.method)))?;
        let timeout = Duration::from_millis(config.timeout_ms.unwrap_or(DEFAULT_HTTP_TIMEOUT_MS));

        let mut request = self.http.request(method, &url).timeout(timeout);
        for (name, value) in &config.headers {
            let value = interpolate(value, variables, required)
                .map_err(ExecutorError::MissingVariable)?;
            request = request.header(name.as_str(), value);
        }
        if let Some(body) = &config.body {
            let body = interpolate_value(body, variables, required)
                .map_err(ExecutorError::MissingVariable)?;
            request = request.json(&body);
        }

        debug!(url = %url, "Executing http_action");
        // Network errors retry like 5xx.
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ExecutorError::Retryable(format!("request timed out: {}", url))
            } else {
                ExecutorError::Retryable(format!("request failed: {}", e))
            }
        })?;

        let status = response.status();
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("json"))
            .unwrap_or(false);
        let body = response
            .text()
            .await
            .map_err(|e| ExecutorError::Retryable(format!("reading body failed: {}", e)))?;

        if status.is_success() {
            let output = if is_json {
                serde_json::from_str(&body).unwrap_or(Value::String(body))
            } else {
                Value::String(body)
            };
            Ok(ExecutorOutcome::plain(output))
        } else if status.is_server_error() {
            Err(ExecutorError::Retryable(format!("{} from {}", status, url)))
        } else {
            Err(ExecutorError::NonRetryable(format!(
                "{} from {}: {}",
                status, url, body
            )))
        }
    }

    async fn ai_processor(
        &self,
        execution: &Execution,
        node: &Node,
        config: &AiProcessorConfig,
    ) -> Result<ExecutorOutcome, ExecutorError> {
        let prompt = interpolate(&config.prompt, &execution.variables, &config.validation.required)
            .map_err(ExecutorError::MissingVariable)?;
        let task_type = TaskType::parse(&config.task_type).ok_or_else(|| {
            ExecutorError::NonRetryable(format!("unknown task_type: {}", config.task_type))
        })?;

        let mut request = AiRequest::new(task_type, prompt);
        request.explicit_provider = config.provider.clone();
        request.model = config.model.clone();
        request.parse_json = config.parse_json;
        request.execution_id = Some(execution.id);
        request.node_id = Some(node.id.clone());
        if let Some(temperature) = config.temperature {
            request.temperature = temperature;
        }
        if let Some(max_tokens) = config.max_tokens {
            request.max_tokens = max_tokens;
        }

        let response = self.router.dispatch(request).await.map_err(|e| {
            if e.is_retryable() {
                ExecutorError::Retryable(e.to_string())
            } else {
                ExecutorError::NonRetryable(e.to_string())
            }
        })?;

        let output = if config.parse_json {
            serde_json::from_str(response.text.trim())
                .map_err(|e| ExecutorError::NonRetryable(format!("unparseable AI reply: {}", e)))?
        } else {
            Value::String(response.text.clone())
        };

        Ok(ExecutorOutcome::Completed {
            output,
            metrics: NodeMetrics {
                duration_ms: response.latency_ms,
                ai_tokens_used: response.tokens_used,
                ai_cost: response.cost,
                memory_peak: 0,
            },
        })
    }

    async fn human_task(
        &self,
        execution: &Execution,
        node: &Node,
        config: &HumanTaskConfig,
    ) -> ExecutorOutcome {
        let ticket = self
            .approvals
            .issue(execution.id, &node.id, &config.assignee, config.timeout_ms)
            .await;
        ExecutorOutcome::Suspended(Suspension::Approval { ticket })
    }
}

fn passthrough(variables: &Map<String, Value>, config: &TriggerConfig) -> ExecutorOutcome {
    let input = variables.get("input").cloned().unwrap_or(Value::Null);
    let output = match (&input, &config.default) {
        (Value::Null, Some(default)) => default.clone(),
        _ => input,
    };
    ExecutorOutcome::plain(output)
}

fn data_input(variables: &Map<String, Value>, config: &DataConfig) -> ExecutorOutcome {
    if let Some(source) = &config.source {
        if let Some(value) = resolve_path(variables, strip_braces(source)) {
            return ExecutorOutcome::plain(value);
        }
    }
    let input = variables.get("input").cloned().unwrap_or(Value::Null);
    let output = match (&input, &config.default) {
        (Value::Null, Some(default)) => default.clone(),
        _ => input,
    };
    ExecutorOutcome::plain(output)
}

fn data_output(
    variables: &Map<String, Value>,
    config: &DataConfig,
) -> Result<ExecutorOutcome, ExecutorError> {
    if let Some(source) = &config.source {
        let path = strip_braces(source);
        return resolve_path(variables, path)
            .map(ExecutorOutcome::plain)
            .ok_or_else(|| ExecutorError::MissingVariable(path.to_string()));
    }
    Ok(ExecutorOutcome::plain(
        variables.get("input").cloned().unwrap_or(Value::Null),
    ))
}

fn timer(config: &TimerConfig) -> ExecutorOutcome {
    let wake_at = match (config.until, config.delay_ms) {
        (Some(until), _) => until,
        (None, Some(delay_ms)) => Utc::now() + chrono::Duration::milliseconds(delay_ms as i64),
        (None, None) => Utc::now(),
    };
    ExecutorOutcome::Suspended(Suspension::Timer { wake_at })
}

fn condition(
    variables: &Map<String, Value>,
    config: &ConditionConfig,
    branch_label: bool,
) -> Result<ExecutorOutcome, ExecutorError> {
    let result = expression::evaluate(&config.expression, variables)
        .map_err(ExecutorError::NonRetryable)?;
    let output = if branch_label {
        json!({"result": result, "branch": if result { "true" } else { "false" }})
    } else {
        json!({"result": result})
    };
    Ok(ExecutorOutcome::plain(output))
}

fn transform(
    variables: &Map<String, Value>,
    config: &TransformConfig,
) -> Result<ExecutorOutcome, ExecutorError> {
    let input = match &config.source {
        Some(source) => {
            let path = strip_braces(source);
            resolve_path(variables, path)
                .ok_or_else(|| ExecutorError::MissingVariable(path.to_string()))?
        }
        None => variables.get("input").cloned().unwrap_or(Value::Null),
    };

    let output = match config.operation {
        TransformOperation::SplitByLines => {
            let text = value_to_string(&input);
            Value::Array(
                text.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(|line| Value::String(line.to_string()))
                    .collect(),
            )
        }
        TransformOperation::ValidateStructure => {
            let missing: Vec<String> = match &input {
                Value::Object(map) => config
                    .required_fields
                    .iter()
                    .filter(|field| !map.contains_key(*field))
                    .cloned()
                    .collect(),
                _ => config.required_fields.clone(),
            };
            json!({"valid": missing.is_empty(), "missing": missing, "value": input})
        }
        TransformOperation::JsonpathPick => {
            let path = config
                .path
                .as_deref()
                .ok_or_else(|| ExecutorError::NonRetryable("jsonpath_pick without path".into()))?;
            pick_path(&input, path)
                .ok_or_else(|| ExecutorError::NonRetryable(format!("path not found: {}", path)))?
        }
        TransformOperation::Merge => {
            let mut merged = match input {
                Value::Object(map) => map,
                Value::Null => Map::new(),
                other => {
                    let mut map = Map::new();
                    map.insert("value".to_string(), other);
                    map
                }
            };
            for reference in &config.with {
                let path = strip_braces(reference);
                let resolved = resolve_path(variables, path)
                    .ok_or_else(|| ExecutorError::MissingVariable(path.to_string()))?;
                match resolved {
                    Value::Object(map) => merged.extend(map),
                    other => {
                        let key = path.rsplit('.').next().unwrap_or(path).to_string();
                        merged.insert(key, other);
                    }
                }
            }
            Value::Object(merged)
        }
    };
    Ok(ExecutorOutcome::plain(output))
}

fn pick_path(value: &Value, path: &str) -> Option<Value> {
    let mut current = value.clone();
    for segment in path.split('.') {
        current = match &current {
            Value::Object(map) => map.get(segment)?.clone(),
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?.clone(),
            _ => return None,
        };
    }
    Some(current)
}

fn strip_braces(reference: &str) -> &str {
    let trimmed = reference.trim();
    trimmed
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
        .map(str::trim)
        .unwrap_or(trimmed)
}
