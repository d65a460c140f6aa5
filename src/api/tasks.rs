use crate::api::errors::{
    error_response, error_response_with_detail, internal_error, not_found, unprocessable,
    ApiJson, ApiPath, ApiQuery,
};
use crate::api::user_context::resolve_user;
use crate::core::state::AppState;
use crate::core::time_utils::{format_opt_ts, format_ts, now_ts};
use crate::services::subscription::usage_summary;
use crate::services::task_queue::EnqueueError;
use crate::storage::{
    SubTaskRecord, TaskQuery, TaskRecord, UserRecord, TASK_STATUS_COMPLETED, TASK_STATUS_FAILED,
    TASK_STATUS_IN_PROGRESS, TASK_STATUS_PENDING,
};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::{routing::get, routing::post, Json, Router};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use std::sync::Arc;

const DEFAULT_PRIORITY: &str = "medium";
const DEFAULT_LIST_LIMIT: i64 = 100;
const MAX_LIST_LIMIT: i64 = 1000;
const TASK_STATUSES: [&str; 4] = [
    TASK_STATUS_PENDING,
    TASK_STATUS_IN_PROGRESS,
    TASK_STATUS_COMPLETED,
    TASK_STATUS_FAILED,
];
const TASK_PRIORITIES: [&str; 4] = ["low", "medium", "high", "urgent"];

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/execute", post(create_and_execute))
        .route(
            "/api/tasks/{task_id}",
            get(get_task)
                .put(update_task)
                .patch(update_task)
                .delete(delete_task),
        )
        .route("/api/tasks/{task_id}/execute", post(execute_task))
        .route("/api/tasks/{task_id}/subtasks", get(list_subtasks))
}

/// Distinguishes an absent field from an explicit `null`.
fn deserialize_some<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    task_type: Option<String>,
    #[serde(default)]
    agent_name: Option<String>,
    #[serde(default)]
    project_id: Option<i64>,
    #[serde(default)]
    priority: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecuteNewTaskRequest {
    query: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    task_type: Option<String>,
    #[serde(default)]
    agent_name: Option<String>,
    #[serde(default)]
    project_id: Option<i64>,
    #[serde(default)]
    priority: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UpdateTaskRequest {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    task_type: Option<String>,
    #[serde(default)]
    agent_name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_some")]
    project_id: Option<Option<i64>>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default, deserialize_with = "deserialize_some")]
    result: Option<Option<Value>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    error: Option<Option<String>>,
    #[serde(default)]
    output_files: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ListTasksQuery {
    #[serde(default)]
    skip: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    project_id: Option<i64>,
    #[serde(default)]
    agent_name: Option<String>,
    #[serde(default)]
    search: Option<String>,
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiJson(payload): ApiJson<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Value>), Response> {
    let user = resolve_user(&state, &headers)?;
    let record = build_task(
        &state,
        &user,
        NewTaskFields {
            title: payload.title,
            description: payload.description,
            query: payload.query,
            task_type: payload.task_type,
            agent_name: payload.agent_name,
            project_id: payload.project_id,
            priority: payload.priority,
        },
    )?;
    Ok((StatusCode::CREATED, Json(task_payload(&record))))
}

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiQuery(params): ApiQuery<ListTasksQuery>,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let status = match params.status.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => Some(validate_status(value)?),
        _ => None,
    };
    let query = TaskQuery {
        user_id: user.id,
        status,
        project_id: params.project_id,
        agent_name: params.agent_name.and_then(clean_text),
        search: params.search.and_then(clean_text),
        offset: params.skip.unwrap_or(0).max(0),
        limit: params
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT),
    };
    let tasks = state
        .storage
        .list_tasks(&query)
        .map_err(|err| internal_error("list tasks failed", err))?;
    Ok(Json(Value::Array(tasks.iter().map(task_payload).collect())))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiPath(task_id): ApiPath<i64>,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let task = load_owned_task(&state, user.id, task_id)?;
    Ok(Json(task_payload(&task)))
}

async fn update_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiPath(task_id): ApiPath<i64>,
    ApiJson(payload): ApiJson<UpdateTaskRequest>,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let mut task = load_owned_task(&state, user.id, task_id)?;
    let now = now_ts();
    if let Some(title) = payload.title {
        task.title = clean_text(title).ok_or_else(|| unprocessable("title must not be empty"))?;
    }
    if let Some(description) = payload.description {
        task.description = clean_text(description);
    }
    if let Some(query) = payload.query {
        task.query = clean_text(query);
    }
    if let Some(task_type) = payload.task_type {
        task.task_type = clean_text(task_type);
    }
    if let Some(agent_name) = payload.agent_name {
        task.agent_name = validate_agent(&state, clean_text(agent_name))?;
    }
    if let Some(project_id) = payload.project_id {
        if let Some(project_id) = project_id {
            ensure_project(&state, user.id, project_id)?;
        }
        task.project_id = project_id;
    }
    if let Some(priority) = payload.priority {
        task.priority = validate_priority(Some(priority))?;
    }
    if let Some(status) = payload.status {
        let status = validate_status(status.trim())?;
        if status == TASK_STATUS_IN_PROGRESS && task.started_at.is_none() {
            task.started_at = Some(now);
        }
        if (status == TASK_STATUS_COMPLETED || status == TASK_STATUS_FAILED)
            && task.completed_at.is_none()
        {
            task.completed_at = Some(now);
        }
        task.status = status;
    }
    if let Some(result) = payload.result {
        task.result = result;
    }
    if let Some(error) = payload.error {
        task.error = error;
    }
    if let Some(output_files) = payload.output_files {
        task.output_files = output_files;
    }
    task.updated_at = now;
    state
        .storage
        .update_task(&task)
        .map_err(|err| internal_error("update task failed", err))?;
    Ok(Json(task_payload(&task)))
}

async fn delete_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiPath(task_id): ApiPath<i64>,
) -> Result<StatusCode, Response> {
    let user = resolve_user(&state, &headers)?;
    let affected = state
        .storage
        .delete_task(user.id, task_id)
        .map_err(|err| internal_error("delete task failed", err))?;
    if affected == 0 {
        return Err(not_found("Task"));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn execute_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiPath(task_id): ApiPath<i64>,
) -> Result<(StatusCode, Json<Value>), Response> {
    let user = resolve_user(&state, &headers)?;
    let task = load_owned_task(&state, user.id, task_id)?;
    if task.status == TASK_STATUS_IN_PROGRESS {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "Task is already in progress",
        ));
    }
    ensure_quota(&state, &user)?;
    let queued = enqueue(&state, task).await?;
    Ok((StatusCode::ACCEPTED, Json(execution_payload(&queued))))
}

async fn create_and_execute(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiJson(payload): ApiJson<ExecuteNewTaskRequest>,
) -> Result<(StatusCode, Json<Value>), Response> {
    let user = resolve_user(&state, &headers)?;
    let query = clean_text(payload.query).ok_or_else(|| unprocessable("query must not be empty"))?;
    ensure_quota(&state, &user)?;
    let title = payload
        .title
        .and_then(clean_text)
        .unwrap_or_else(|| default_title(&query));
    let task = build_task(
        &state,
        &user,
        NewTaskFields {
            title,
            description: payload.description,
            query: Some(query),
            task_type: payload.task_type,
            agent_name: payload.agent_name,
            project_id: payload.project_id,
            priority: payload.priority,
        },
    )?;
    let queued = enqueue(&state, task).await?;
    let mut body = execution_payload(&queued);
    body["task"] = task_payload(&queued);
    Ok((StatusCode::ACCEPTED, Json(body)))
}

async fn list_subtasks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiPath(task_id): ApiPath<i64>,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let task = load_owned_task(&state, user.id, task_id)?;
    let subtasks = state
        .storage
        .list_subtasks(task.id)
        .map_err(|err| internal_error("list subtasks failed", err))?;
    Ok(Json(Value::Array(
        subtasks.iter().map(subtask_payload).collect(),
    )))
}

struct NewTaskFields {
    title: String,
    description: Option<String>,
    query: Option<String>,
    task_type: Option<String>,
    agent_name: Option<String>,
    project_id: Option<i64>,
    priority: Option<String>,
}

fn build_task(
    state: &AppState,
    user: &UserRecord,
    fields: NewTaskFields,
) -> Result<TaskRecord, Response> {
    let title = clean_text(fields.title).ok_or_else(|| unprocessable("title must not be empty"))?;
    if let Some(project_id) = fields.project_id {
        ensure_project(state, user.id, project_id)?;
    }
    let agent_name = validate_agent(state, fields.agent_name.and_then(clean_text))?;
    let priority = validate_priority(fields.priority)?;
    let now = now_ts();
    let mut record = TaskRecord {
        id: 0,
        user_id: user.id,
        project_id: fields.project_id,
        title,
        description: fields.description.and_then(clean_text),
        query: fields.query.and_then(clean_text),
        task_type: fields.task_type.and_then(clean_text),
        agent_name,
        status: TASK_STATUS_PENDING.to_string(),
        priority,
        job_id: None,
        queued_at: None,
        started_at: None,
        completed_at: None,
        execution_time: None,
        result: None,
        output_files: Vec::new(),
        error: None,
        created_at: now,
        updated_at: now,
    };
    record.id = state
        .storage
        .insert_task(&record)
        .map_err(|err| internal_error("create task failed", err))?;
    Ok(record)
}

pub(crate) fn load_owned_task(
    state: &AppState,
    user_id: i64,
    task_id: i64,
) -> Result<TaskRecord, Response> {
    state
        .storage
        .get_task(task_id)
        .map_err(|err| internal_error("load task failed", err))?
        .filter(|task| task.user_id == user_id)
        .ok_or_else(|| not_found("Task"))
}

fn ensure_project(state: &AppState, user_id: i64, project_id: i64) -> Result<(), Response> {
    state
        .storage
        .get_project(user_id, project_id)
        .map_err(|err| internal_error("load project failed", err))?
        .map(|_| ())
        .ok_or_else(|| not_found("Project"))
}

fn ensure_quota(state: &AppState, user: &UserRecord) -> Result<(), Response> {
    let usage = usage_summary(
        state.storage.as_ref(),
        &state.config.subscription,
        user,
        now_ts(),
    )
    .map_err(|err| internal_error("load usage failed", err))?;
    if usage.exhausted() {
        return Err(error_response_with_detail(
            StatusCode::PAYMENT_REQUIRED,
            None,
            format!(
                "Monthly task limit exceeded for the {} plan ({} tasks). Upgrade your subscription to run more tasks.",
                usage.tier, usage.monthly_limit
            ),
            None,
            Some(json!({
                "tier": usage.tier,
                "limit": usage.monthly_limit,
                "used": usage.used,
            })),
        ));
    }
    Ok(())
}

async fn enqueue(state: &AppState, task: TaskRecord) -> Result<TaskRecord, Response> {
    state.queue.enqueue(task).await.map_err(|err| match err {
        EnqueueError::QueueFull | EnqueueError::Closed => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
        EnqueueError::Internal(err) => internal_error("enqueue task failed", err),
    })
}

fn validate_status(raw: &str) -> Result<String, Response> {
    let normalized = raw.trim().to_ascii_lowercase();
    if TASK_STATUSES.contains(&normalized.as_str()) {
        Ok(normalized)
    } else {
        Err(unprocessable(format!(
            "invalid status '{raw}', expected one of: {}",
            TASK_STATUSES.join(", ")
        )))
    }
}

/// Blank or missing priorities fall back to `medium`.
fn validate_priority(raw: Option<String>) -> Result<String, Response> {
    let Some(priority) = raw.and_then(clean_text) else {
        return Ok(DEFAULT_PRIORITY.to_string());
    };
    let normalized = priority.to_ascii_lowercase();
    if TASK_PRIORITIES.contains(&normalized.as_str()) {
        Ok(normalized)
    } else {
        Err(unprocessable(format!(
            "invalid priority '{priority}', expected one of: {}",
            TASK_PRIORITIES.join(", ")
        )))
    }
}

fn validate_agent(state: &AppState, agent: Option<String>) -> Result<Option<String>, Response> {
    match agent {
        None => Ok(None),
        Some(name) => state
            .agents
            .get(&name)
            .map(|spec| Some(spec.name.to_string()))
            .ok_or_else(|| unprocessable(format!("unknown agent '{name}'"))),
    }
}

fn clean_text(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn default_title(query: &str) -> String {
    let mut title: String = query.chars().take(50).collect();
    if query.chars().count() > 50 {
        title.push_str("...");
    }
    title
}

fn execution_payload(task: &TaskRecord) -> Value {
    json!({
        "task_id": task.id,
        "job_id": task.job_id,
        "status": "queued",
        "message": "Task queued for execution",
    })
}

pub(crate) fn task_payload(task: &TaskRecord) -> Value {
    json!({
        "id": task.id,
        "user_id": task.user_id,
        "project_id": task.project_id,
        "title": task.title,
        "description": task.description,
        "query": task.query,
        "task_type": task.task_type,
        "agent_name": task.agent_name,
        "status": task.status,
        "priority": task.priority,
        "job_id": task.job_id,
        "result": task.result,
        "output_files": task.output_files,
        "error": task.error,
        "execution_time": task.execution_time,
        "queued_at": format_opt_ts(task.queued_at),
        "started_at": format_opt_ts(task.started_at),
        "completed_at": format_opt_ts(task.completed_at),
        "created_at": format_ts(task.created_at),
        "updated_at": format_ts(task.updated_at),
    })
}

fn subtask_payload(subtask: &SubTaskRecord) -> Value {
    json!({
        "id": subtask.id,
        "task_id": subtask.task_id,
        "agent_name": subtask.agent_name,
        "description": subtask.description,
        "status": subtask.status,
        "result": subtask.result,
        "execution_order": subtask.execution_order,
        "created_at": format_ts(subtask.created_at),
        "completed_at": format_opt_ts(subtask.completed_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_request_distinguishes_null_from_missing() {
        let payload: UpdateTaskRequest =
            serde_json::from_value(json!({ "project_id": null, "status": "completed" })).unwrap();
        assert_eq!(payload.project_id, Some(None));
        assert!(payload.result.is_none());

        let payload: UpdateTaskRequest = serde_json::from_value(json!({})).unwrap();
        assert!(payload.project_id.is_none());
    }

    #[test]
    fn default_title_truncates_long_queries() {
        assert_eq!(default_title("short"), "short");
        let long = "x".repeat(60);
        assert_eq!(default_title(&long).len(), 53);
    }
}
