use crate::auth::Principal;
use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use state_store::{
    Edge, Node, Workflow, WorkflowListFilter, WorkflowSettings, WorkflowStatus,
};
use uuid::Uuid;
use workflow_engine::validate_workflow;

#[derive(Debug, Deserialize)]
pub struct WorkflowBody {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub settings: Option<WorkflowSettings>,
    #[serde(default)]
    pub status: Option<WorkflowStatus>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateWorkflowBody {
    pub version: u64,
    #[serde(flatten)]
    pub body: WorkflowBody,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub status: Option<WorkflowStatus>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteBody {
    #[serde(default)]
    pub trigger_data: serde_json::Value,
}

pub async fn create(
    State(state): State<AppState>,
    principal: Principal,
    Json(body): Json<WorkflowBody>,
) -> Result<(StatusCode, Json<Workflow>), ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::Validation("workflow name is required".to_string()));
    }

    let mut workflow = Workflow::new(body.name, body.nodes, body.edges);
    workflow.description = body.description;
    if let Some(settings) = body.settings {
        workflow.settings = settings;
    }
    if let Some(status) = body.status {
        workflow.status = status;
    }
    workflow.metadata.creator = principal.0.clone();
    workflow.metadata.last_editor = principal.0;
    workflow.metadata.category = body.category;
    workflow.metadata.tags = body.tags;

    validate_workflow(&workflow).map_err(ApiError::from)?;
    let workflow = state.store.create_workflow(workflow).await?;
    Ok((StatusCode::CREATED, Json(workflow)))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    principal: Principal,
    Json(update): Json<UpdateWorkflowBody>,
) -> Result<Json<Workflow>, ApiError> {
    let existing = state.store.get_workflow(id).await?;
    if !existing.is_editable_by(&principal.0) {
        return Err(ApiError::Forbidden(
            "no edit permission on this workflow".to_string(),
        ));
    }

    let body = update.body;
    let mut workflow = existing.clone();
    workflow.name = body.name;
    workflow.description = body.description;
    workflow.nodes = body.nodes;
    workflow.edges = body.edges;
    if let Some(settings) = body.settings {
        workflow.settings = settings;
    }
    if let Some(status) = body.status {
        workflow.status = status;
    }
    workflow.metadata.last_editor = principal.0;
    workflow.metadata.category = body.category.or(existing.metadata.category);
    if !body.tags.is_empty() {
        workflow.metadata.tags = body.tags;
    }

    validate_workflow(&workflow).map_err(ApiError::from)?;
    let saved = state
        .store
        .update_workflow_if_version(workflow, update.version)
        .await?;
    state
        .cache
        .invalidate_prefix(&format!("workflow:{}:", id))
        .await;
    Ok(Json(saved))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    principal: Principal,
) -> Result<Json<Workflow>, ApiError> {
    let workflow = state.store.get_workflow(id).await?;
    if !workflow.is_visible_to(&principal.0) {
        return Err(ApiError::Forbidden(
            "no view permission on this workflow".to_string(),
        ));
    }
    Ok(Json(workflow))
}

pub async fn list(
    State(state): State<AppState>,
    principal: Principal,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let filter = WorkflowListFilter {
        page: query.page.unwrap_or(1),
        limit: query.limit.unwrap_or(20).min(100),
        status: query.status,
        category: query.category,
        search: query.search,
    };
    let workflows = state.store.list_workflows(&principal.0, &filter).await?;
    Ok(Json(json!({
        "workflows": workflows,
        "page": filter.page,
        "limit": filter.limit,
    })))
}

pub async fn archive(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    principal: Principal,
) -> Result<StatusCode, ApiError> {
    let workflow = state.store.get_workflow(id).await?;
    if !workflow.is_editable_by(&principal.0) {
        return Err(ApiError::Forbidden(
            "no edit permission on this workflow".to_string(),
        ));
    }
    state.store.archive_workflow(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn stats(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    principal: Principal,
) -> Result<Json<serde_json::Value>, ApiError> {
    let workflow = state.store.get_workflow(id).await?;
    if !workflow.is_visible_to(&principal.0) {
        return Err(ApiError::Forbidden(
            "no view permission on this workflow".to_string(),
        ));
    }

    // Derived aggregation; cached briefly and invalidated on writes.
    let key = format!("workflow:{}:stats", id);
    let store = state.store.clone();
    let bytes = state
        .cache
        .get_or_compute(&key, Some(std::time::Duration::from_secs(5)), || async move {
            let stats = store
                .stats_by_workflow(id)
                .await
                .map_err(|e| coordination_service::CoordinationError::Producer(e.to_string()))?;
            serde_json::to_vec(&stats)
                .map_err(|e| coordination_service::CoordinationError::Producer(e.to_string()))
        })
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let stats: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|e| ApiError::Internal(format!("corrupt cached stats: {}", e)))?;
    Ok(Json(json!({"workflow_id": id, "stats": stats})))
}

pub async fn execute(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ExecuteBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let execution_id = state.engine.execute(id, body.trigger_data, true).await?;
    state
        .cache
        .invalidate_prefix(&format!("workflow:{}:", id))
        .await;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"execution_id": execution_id, "status": "running"})),
    ))
}
