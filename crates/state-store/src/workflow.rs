use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A versioned directed graph of nodes and edges with settings,
/// permissions and metadata. Version increases monotonically on every
/// save while the workflow is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub version: u64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: WorkflowStatus,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub permissions: WorkflowPermissions,
    #[serde(default)]
    pub settings: WorkflowSettings,
    #[serde(default)]
    pub metadata: WorkflowMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(name: String, nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            version: 1,
            name,
            description: String::new(),
            status: WorkflowStatus::Draft,
            nodes,
            edges,
            permissions: WorkflowPermissions::default(),
            settings: WorkflowSettings::default(),
            metadata: WorkflowMetadata::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// The node execution starts from: first trigger or timer node,
    /// otherwise the first node in declaration order.
    pub fn entry_node(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| matches!(n.kind, NodeKind::Trigger(_) | NodeKind::Timer(_)))
            .or_else(|| self.nodes.first())
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Outgoing edges of `node_id`, highest priority first.
    pub fn outgoing_edges(&self, node_id: &str) -> Vec<&Edge> {
        let mut edges: Vec<&Edge> = self
            .edges
            .iter()
            .filter(|e| e.source == node_id)
            .collect();
        edges.sort_by(|a, b| b.priority.cmp(&a.priority));
        edges
    }

    pub fn incoming_edges(&self, node_id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.target == node_id).collect()
    }

    pub fn is_visible_to(&self, principal: &str) -> bool {
        self.metadata.creator == principal
            || self.permissions.owners.iter().any(|p| p == principal)
            || self.permissions.editors.iter().any(|p| p == principal)
            || self.permissions.viewers.iter().any(|p| p == principal)
    }

    pub fn is_editable_by(&self, principal: &str) -> bool {
        self.metadata.creator == principal
            || self.permissions.owners.iter().any(|p| p == principal)
            || self.permissions.editors.iter().any(|p| p == principal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Archived,
}

/// A unit of work in the graph. `config` is kind-specific; unknown kinds
/// are rejected when the document is deserialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    /// Editor canvas coordinates; opaque to the engine.
    #[serde(default)]
    pub position: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "config", rename_all = "snake_case")]
pub enum NodeKind {
    Trigger(TriggerConfig),
    Timer(TimerConfig),
    AiProcessor(AiProcessorConfig),
    HttpAction(HttpActionConfig),
    Condition(ConditionConfig),
    Decision(ConditionConfig),
    HumanTask(HumanTaskConfig),
    Transform(TransformConfig),
    DataInput(DataConfig),
    DataOutput(DataConfig),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Trigger(_) => "trigger",
            NodeKind::Timer(_) => "timer",
            NodeKind::AiProcessor(_) => "ai_processor",
            NodeKind::HttpAction(_) => "http_action",
            NodeKind::Condition(_) => "condition",
            NodeKind::Decision(_) => "decision",
            NodeKind::HumanTask(_) => "human_task",
            NodeKind::Transform(_) => "transform",
            NodeKind::DataInput(_) => "data_input",
            NodeKind::DataOutput(_) => "data_output",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Payload substituted when the trigger carries none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// Shared secret for webhook-initiated triggers; requests must carry
    /// a matching body HMAC when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiProcessorConfig {
    pub prompt: String,
    #[serde(default)]
    pub task_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub parse_json: bool,
    #[serde(default)]
    pub validation: ValidationRules,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpActionConfig {
    #[serde(default = "default_http_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub validation: ValidationRules,
}

fn default_http_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub expression: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanTaskConfig {
    pub assignee: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_assignee: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub fallback: ApprovalFallback,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// What happens when an approval deadline passes with the ticket still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalFallback {
    Escalate,
    AutoApprove,
    #[default]
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    pub operation: TransformOperation,
    /// Template reference to the input value, e.g. `{{fetch.result}}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Dotted path for `jsonpath_pick`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Additional template references merged for `merge`.
    #[serde(default)]
    pub with: Vec<String>,
    /// Field names `validate_structure` requires on the input object.
    #[serde(default)]
    pub required_fields: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformOperation {
    SplitByLines,
    ValidateStructure,
    JsonpathPick,
    Merge,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Variable references a node requires to be present before it runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationRules {
    #[serde(default)]
    pub required: Vec<String>,
}

/// A directed link between nodes. Traversable once the source completed
/// and the condition (if any) evaluates true.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub retry_on_fail: bool,
    #[serde(default, rename = "type")]
    pub edge_type: EdgeType,
}

fn default_priority() -> u32 {
    1
}

impl Edge {
    pub fn new(id: &str, source: &str, target: &str) -> Self {
        Self {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            condition: None,
            priority: 1,
            retry_on_fail: false,
            edge_type: EdgeType::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    #[default]
    Normal,
    /// Taken instead of failing the workflow when the source node fails
    /// terminally.
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowPermissions {
    #[serde(default)]
    pub owners: Vec<String>,
    #[serde(default)]
    pub editors: Vec<String>,
    #[serde(default)]
    pub viewers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Wall-clock bound for a whole execution.
    pub timeout_ms: u64,
    pub max_retries: u32,
    /// Maximum concurrently running nodes of one execution.
    pub concurrency: usize,
    pub notify_on_failure: bool,
    pub notify_on_success: bool,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 300_000,
            max_retries: 3,
            concurrency: 4,
            notify_on_failure: false,
            notify_on_success: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    #[serde(default)]
    pub creator: String,
    #[serde(default)]
    pub last_editor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_kind_round_trips_with_tagged_config() {
        let node = Node {
            id: "summarize".to_string(),
            kind: NodeKind::AiProcessor(AiProcessorConfig {
                prompt: "Summarize: {{input}}".to_string(),
                task_type: "content_generation".to_string(),
                provider: None,
                model: None,
                temperature: Some(0.3),
                max_tokens: Some(512),
                parse_json: false,
                validation: ValidationRules::default(),
            }),
            position: json!({"x": 10, "y": 20}),
        };

        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["kind"], "ai_processor");
        assert_eq!(value["config"]["prompt"], "Summarize: {{input}}");

        let back: Node = serde_json::from_value(value).unwrap();
        assert!(matches!(back.kind, NodeKind::AiProcessor(_)));
    }

    #[test]
    fn unknown_node_kind_is_rejected() {
        let raw = json!({
            "id": "x",
            "kind": "quantum_processor",
            "config": {}
        });
        assert!(serde_json::from_value::<Node>(raw).is_err());
    }

    #[test]
    fn entry_node_prefers_trigger() {
        let nodes = vec![
            Node {
                id: "out".to_string(),
                kind: NodeKind::DataOutput(DataConfig::default()),
                position: serde_json::Value::Null,
            },
            Node {
                id: "start".to_string(),
                kind: NodeKind::Trigger(TriggerConfig::default()),
                position: serde_json::Value::Null,
            },
        ];
        let workflow = Workflow::new("wf".to_string(), nodes, vec![]);
        assert_eq!(workflow.entry_node().unwrap().id, "start");
    }

    #[test]
    fn entry_node_falls_back_to_first() {
        let nodes = vec![Node {
            id: "only".to_string(),
            kind: NodeKind::DataInput(DataConfig::default()),
            position: serde_json::Value::Null,
        }];
        let workflow = Workflow::new("wf".to_string(), nodes, vec![]);
        assert_eq!(workflow.entry_node().unwrap().id, "only");
    }
}
