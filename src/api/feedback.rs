use crate::api::errors::{internal_error, unprocessable, ApiJson, ApiPath, ApiQuery};
use crate::api::tasks::load_owned_task;
use crate::api::user_context::resolve_user;
use crate::core::state::AppState;
use crate::core::time_utils::{format_ts, now_ts};
use crate::services::learning::learn_from_feedback;
use crate::storage::FeedbackRecord;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::{routing::get, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

const DEFAULT_FEEDBACK_TYPE: &str = "general";

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/feedback", get(list_feedback).post(submit_feedback))
        .route("/api/feedback/task/{task_id}", get(task_feedback))
}

#[derive(Debug, Deserialize)]
struct SubmitFeedbackRequest {
    task_id: i64,
    rating: i64,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    feedback_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default)]
    skip: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn submit_feedback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiJson(payload): ApiJson<SubmitFeedbackRequest>,
) -> Result<(StatusCode, Json<Value>), Response> {
    let user = resolve_user(&state, &headers)?;
    if !(1..=5).contains(&payload.rating) {
        return Err(unprocessable("rating must be between 1 and 5"));
    }
    let task = load_owned_task(&state, user.id, payload.task_id)?;
    let mut record = FeedbackRecord {
        id: 0,
        user_id: user.id,
        task_id: task.id,
        rating: payload.rating,
        comment: payload
            .comment
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty()),
        feedback_type: payload
            .feedback_type
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_FEEDBACK_TYPE.to_string()),
        created_at: now_ts(),
    };
    record.id = state
        .storage
        .insert_feedback(&record)
        .map_err(|err| internal_error("store feedback failed", err))?;
    let agent = state
        .agents
        .resolve_for_task(task.agent_name.as_deref(), task.task_type.as_deref());
    if let Err(err) =
        learn_from_feedback(state.storage.as_ref(), &task, agent.name, &record, now_ts())
    {
        warn!("feedback {} was stored but not learned from: {err}", record.id);
    }
    Ok((StatusCode::CREATED, Json(feedback_payload(&record))))
}

async fn list_feedback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiQuery(page): ApiQuery<PageQuery>,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let items = state
        .storage
        .list_feedback_by_user(
            user.id,
            page.skip.unwrap_or(0).max(0),
            page.limit.unwrap_or(100).clamp(1, 1000),
        )
        .map_err(|err| internal_error("list feedback failed", err))?;
    Ok(Json(Value::Array(items.iter().map(feedback_payload).collect())))
}

async fn task_feedback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiPath(task_id): ApiPath<i64>,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let task = load_owned_task(&state, user.id, task_id)?;
    let items = state
        .storage
        .list_feedback_by_task(task.id)
        .map_err(|err| internal_error("list feedback failed", err))?;
    Ok(Json(Value::Array(items.iter().map(feedback_payload).collect())))
}

fn feedback_payload(record: &FeedbackRecord) -> Value {
    json!({
        "id": record.id,
        "user_id": record.user_id,
        "task_id": record.task_id,
        "rating": record.rating,
        "comment": record.comment,
        "feedback_type": record.feedback_type,
        "created_at": format_ts(record.created_at),
    })
}
