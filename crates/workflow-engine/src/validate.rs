//! Save-time workflow validation
//!
//! Rejects graphs the engine cannot run: duplicate or dangling node
//! references, cycles (strict-AND join semantics would deadlock on them),
//! and per-kind config problems.

use crate::expression;
use crate::EngineError;
use petgraph::graph::Graph;
use petgraph::Directed;
use state_store::{NodeKind, Workflow};
use std::collections::{HashMap, HashSet};

pub fn validate_workflow(workflow: &Workflow) -> Result<(), EngineError> {
    if workflow.nodes.is_empty() {
        return Err(EngineError::Validation(
            "workflow has no nodes".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for node in &workflow.nodes {
        if node.id.trim().is_empty() {
            return Err(EngineError::Validation("node id is empty".to_string()));
        }
        if !seen.insert(node.id.as_str()) {
            return Err(EngineError::Validation(format!(
                "duplicate node id: {}",
                node.id
            )));
        }
        validate_node_config(&node.id, &node.kind)?;
    }

    for edge in &workflow.edges {
        if !seen.contains(edge.source.as_str()) {
            return Err(EngineError::Validation(format!(
                "edge {} references unknown source node: {}",
                edge.id, edge.source
            )));
        }
        if !seen.contains(edge.target.as_str()) {
            return Err(EngineError::Validation(format!(
                "edge {} references unknown target node: {}",
                edge.id, edge.target
            )));
        }
        if let Some(condition) = &edge.condition {
            expression::parse(condition).map_err(|e| {
                EngineError::Validation(format!("edge {} condition: {}", edge.id, e))
            })?;
        }
    }

    if has_cycles(workflow) {
        return Err(EngineError::Validation(
            "workflow contains cycles".to_string(),
        ));
    }
    Ok(())
}

fn validate_node_config(node_id: &str, kind: &NodeKind) -> Result<(), EngineError> {
    let problem = match kind {
        NodeKind::AiProcessor(config) if config.prompt.trim().is_empty() => {
            Some("ai_processor requires a prompt".to_string())
        }
        NodeKind::HttpAction(config) if config.url.trim().is_empty() => {
            Some("http_action requires a url".to_string())
        }
        NodeKind::HttpAction(config) => {
            let method = config.method.to_uppercase();
            if !matches!(
                method.as_str(),
                "GET" | "POST" | "PUT" | "PATCH" | "DELETE" | "HEAD"
            ) {
                Some(format!("http_action has unsupported method: {}", config.method))
            } else {
                None
            }
        }
        NodeKind::Condition(config) | NodeKind::Decision(config) => {
            expression::parse(&config.expression).err()
        }
        NodeKind::HumanTask(config) if config.assignee.trim().is_empty() => {
            Some("human_task requires an assignee".to_string())
        }
        NodeKind::Timer(config) if config.delay_ms.is_none() && config.until.is_none() => {
            Some("timer requires a delay or an absolute deadline".to_string())
        }
        NodeKind::Transform(config)
            if config.operation == state_store::TransformOperation::JsonpathPick
                && config.path.is_none() =>
        {
            Some("jsonpath_pick requires a path".to_string())
        }
        _ => None,
    };

    match problem {
        Some(problem) => Err(EngineError::Validation(format!("node {}: {}", node_id, problem))),
        None => Ok(()),
    }
}

fn has_cycles(workflow: &Workflow) -> bool {
    let mut graph: Graph<&str, (), Directed> = Graph::new();
    let mut indices = HashMap::new();

    for node in &workflow.nodes {
        let index = graph.add_node(node.id.as_str());
        indices.insert(node.id.as_str(), index);
    }
    for edge in &workflow.edges {
        if let (Some(&source), Some(&target)) = (
            indices.get(edge.source.as_str()),
            indices.get(edge.target.as_str()),
        ) {
            graph.add_edge(source, target, ());
        }
    }
    petgraph::algo::is_cyclic_directed(&graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use state_store::{
        ConditionConfig, DataConfig, Edge, Node, TriggerConfig, Workflow,
    };

    fn node(id: &str, kind: NodeKind) -> Node {
        Node {
            id: id.to_string(),
            kind,
            position: serde_json::Value::Null,
        }
    }

    fn linear_workflow() -> Workflow {
        Workflow::new(
            "wf".to_string(),
            vec![
                node("start", NodeKind::Trigger(TriggerConfig::default())),
                node("out", NodeKind::DataOutput(DataConfig::default())),
            ],
            vec![Edge::new("e1", "start", "out")],
        )
    }

    #[test]
    fn accepts_a_valid_workflow() {
        assert!(validate_workflow(&linear_workflow()).is_ok());
    }

    #[test]
    fn rejects_duplicate_node_ids() {
        let mut workflow = linear_workflow();
        workflow.nodes.push(node("out", NodeKind::DataOutput(DataConfig::default())));
        assert!(validate_workflow(&workflow).is_err());
    }

    #[test]
    fn rejects_dangling_edges() {
        let mut workflow = linear_workflow();
        workflow.edges.push(Edge::new("e2", "out", "ghost"));
        assert!(validate_workflow(&workflow).is_err());
    }

    #[test]
    fn rejects_cycles() {
        let mut workflow = linear_workflow();
        workflow.edges.push(Edge::new("e2", "out", "start"));
        assert!(validate_workflow(&workflow).is_err());
    }

    #[test]
    fn rejects_unparseable_conditions() {
        let mut workflow = linear_workflow();
        workflow.nodes.push(node(
            "cond",
            NodeKind::Condition(ConditionConfig {
                expression: "no operator".to_string(),
            }),
        ));
        assert!(validate_workflow(&workflow).is_err());
    }
}
