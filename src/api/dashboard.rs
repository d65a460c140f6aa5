use crate::api::errors::internal_error;
use crate::api::tasks::task_payload;
use crate::api::user_context::resolve_user;
use crate::core::state::AppState;
use crate::core::time_utils::now_ts;
use crate::services::subscription::usage_summary;
use crate::storage::{TaskQuery, UserRecord};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

const RECENT_TASKS: i64 = 5;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/dashboard", get(dashboard))
}

async fn dashboard(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    dashboard_payload(&state, &user).map(Json)
}

pub(crate) fn dashboard_payload(state: &AppState, user: &UserRecord) -> Result<Value, Response> {
    let storage = state.storage.as_ref();
    let stats = storage
        .task_stats(Some(user.id))
        .map_err(|err| internal_error("load task stats failed", err))?;
    let total_projects = storage
        .count_projects(Some(user.id))
        .map_err(|err| internal_error("count projects failed", err))?;
    let recent = storage
        .list_tasks(&TaskQuery {
            user_id: user.id,
            limit: RECENT_TASKS,
            ..TaskQuery::default()
        })
        .map_err(|err| internal_error("load recent tasks failed", err))?;
    let usage = usage_summary(storage, &state.config.subscription, user, now_ts())
        .map_err(|err| internal_error("load usage failed", err))?;
    let success_rate = if stats.completed + stats.failed > 0 {
        stats.completed as f64 / (stats.completed + stats.failed) as f64
    } else {
        0.0
    };
    Ok(json!({
        "total_tasks": stats.total,
        "pending_tasks": stats.pending,
        "in_progress_tasks": stats.in_progress,
        "completed_tasks": stats.completed,
        "failed_tasks": stats.failed,
        "success_rate": success_rate,
        "avg_execution_time": stats.avg_execution_time,
        "total_projects": total_projects,
        "recent_tasks": recent.iter().map(task_payload).collect::<Vec<_>>(),
        "usage": usage,
    }))
}
