use crate::api::errors::{internal_error, not_found, unprocessable, ApiJson, ApiPath, ApiQuery};
use crate::api::user_context::resolve_user;
use crate::core::state::AppState;
use crate::core::time_utils::{format_ts, now_ts};
use crate::storage::ProjectRecord;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::{routing::get, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

const DEFAULT_STATUS: &str = "active";
const PROJECT_STATUSES: [&str; 3] = ["active", "completed", "archived"];

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/projects", get(list_projects).post(create_project))
        .route(
            "/api/projects/{project_id}",
            get(get_project).put(update_project).delete(delete_project),
        )
}

#[derive(Debug, Deserialize)]
struct CreateProjectRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateProjectRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default)]
    skip: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn create_project(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiJson(payload): ApiJson<CreateProjectRequest>,
) -> Result<(StatusCode, Json<Value>), Response> {
    let user = resolve_user(&state, &headers)?;
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(unprocessable("name must not be empty"));
    }
    let status = validate_status(payload.status)?;
    let now = now_ts();
    let mut record = ProjectRecord {
        id: 0,
        owner_id: user.id,
        name: name.to_string(),
        description: non_empty(payload.description),
        status,
        task_count: 0,
        created_at: now,
        updated_at: now,
    };
    record.id = state
        .storage
        .insert_project(&record)
        .map_err(|err| internal_error("create project failed", err))?;
    Ok((StatusCode::CREATED, Json(project_payload(&record))))
}

async fn list_projects(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiQuery(page): ApiQuery<PageQuery>,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let projects = state
        .storage
        .list_projects(
            user.id,
            page.skip.unwrap_or(0).max(0),
            page.limit.unwrap_or(100).clamp(1, 1000),
        )
        .map_err(|err| internal_error("list projects failed", err))?;
    Ok(Json(Value::Array(
        projects.iter().map(project_payload).collect(),
    )))
}

async fn get_project(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiPath(project_id): ApiPath<i64>,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let project = load_project(&state, user.id, project_id)?;
    Ok(Json(project_payload(&project)))
}

async fn update_project(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiPath(project_id): ApiPath<i64>,
    ApiJson(payload): ApiJson<UpdateProjectRequest>,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let mut project = load_project(&state, user.id, project_id)?;
    if let Some(name) = payload.name {
        project.name = non_empty(Some(name)).ok_or_else(|| unprocessable("name must not be empty"))?;
    }
    if let Some(description) = payload.description {
        project.description = non_empty(Some(description));
    }
    if let Some(status) = payload.status {
        project.status = validate_status(Some(status))?;
    }
    project.updated_at = now_ts();
    state
        .storage
        .update_project(&project)
        .map_err(|err| internal_error("update project failed", err))?;
    Ok(Json(project_payload(&project)))
}

async fn delete_project(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiPath(project_id): ApiPath<i64>,
) -> Result<StatusCode, Response> {
    let user = resolve_user(&state, &headers)?;
    let affected = state
        .storage
        .delete_project(user.id, project_id)
        .map_err(|err| internal_error("delete project failed", err))?;
    if affected == 0 {
        return Err(not_found("Project"));
    }
    info!("user {} deleted project {project_id}", user.id);
    Ok(StatusCode::NO_CONTENT)
}

fn load_project(state: &AppState, user_id: i64, project_id: i64) -> Result<ProjectRecord, Response> {
    state
        .storage
        .get_project(user_id, project_id)
        .map_err(|err| internal_error("load project failed", err))?
        .ok_or_else(|| not_found("Project"))
}

fn validate_status(raw: Option<String>) -> Result<String, Response> {
    let Some(status) = non_empty(raw) else {
        return Ok(DEFAULT_STATUS.to_string());
    };
    let normalized = status.to_ascii_lowercase();
    if PROJECT_STATUSES.contains(&normalized.as_str()) {
        Ok(normalized)
    } else {
        Err(unprocessable(format!(
            "invalid status '{status}', expected one of: {}",
            PROJECT_STATUSES.join(", ")
        )))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn project_payload(project: &ProjectRecord) -> Value {
    json!({
        "id": project.id,
        "owner_id": project.owner_id,
        "name": project.name,
        "description": project.description,
        "status": project.status,
        "task_count": project.task_count,
        "created_at": format_ts(project.created_at),
        "updated_at": format_ts(project.updated_at),
    })
}
