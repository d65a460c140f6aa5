// Agent catalogue, agent memory and per-agent performance.
use crate::api::errors::{internal_error, not_found, unprocessable, ApiJson, ApiPath, ApiQuery};
use crate::api::user_context::resolve_user;
use crate::core::state::AppState;
use crate::core::time_utils::{format_opt_ts, format_ts, now_ts};
use crate::services::agents::AgentSpec;
use crate::storage::AgentMemoryRecord;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::{routing::get, routing::post, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

const DEFAULT_MEMORY_LIMIT: i64 = 50;
const MAX_MEMORY_LIMIT: i64 = 500;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/agents/available", get(available_agents))
        .route("/api/agents/status/{agent_name}", get(agent_status))
        .route(
            "/api/agents/capability/{capability}",
            get(agents_by_capability),
        )
        .route("/api/agents/memory", post(store_memory))
        .route("/api/agents/memory/{agent_name}", get(list_memory))
        .route("/api/agents/performance", get(performance))
}

#[derive(Debug, Deserialize)]
struct StoreMemoryRequest {
    agent_name: String,
    memory_type: String,
    content: Value,
    #[serde(default)]
    context_tags: Vec<String>,
    #[serde(default)]
    relevance_score: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct MemoryQuery {
    #[serde(default)]
    memory_type: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn available_agents(State(state): State<Arc<AppState>>) -> Json<Value> {
    let agents: Vec<Value> = state.agents.all().iter().map(agent_payload).collect();
    Json(json!({
        "agents": agents,
        "capabilities": state.agents.capabilities(),
    }))
}

async fn agent_status(
    State(state): State<Arc<AppState>>,
    ApiPath(agent_name): ApiPath<String>,
) -> Result<Json<Value>, Response> {
    let agent = state
        .agents
        .get(&agent_name)
        .ok_or_else(|| not_found("Agent"))?;
    let mut payload = agent_payload(agent);
    payload["status"] = json!("available");
    Ok(Json(payload))
}

async fn agents_by_capability(
    State(state): State<Arc<AppState>>,
    ApiPath(capability): ApiPath<String>,
) -> Json<Value> {
    let agents: Vec<Value> = state
        .agents
        .find_by_capability(&capability)
        .into_iter()
        .map(agent_payload)
        .collect();
    Json(json!({ "capability": capability, "agents": agents }))
}

async fn store_memory(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiJson(payload): ApiJson<StoreMemoryRequest>,
) -> Result<(StatusCode, Json<Value>), Response> {
    resolve_user(&state, &headers)?;
    let agent = state
        .agents
        .get(&payload.agent_name)
        .ok_or_else(|| unprocessable(format!("unknown agent '{}'", payload.agent_name)))?;
    let memory_type = payload.memory_type.trim();
    if memory_type.is_empty() {
        return Err(unprocessable("memory_type must not be empty"));
    }
    let relevance_score = payload.relevance_score.unwrap_or(1.0);
    if !(0.0..=1.0).contains(&relevance_score) {
        return Err(unprocessable("relevance_score must be between 0 and 1"));
    }
    let mut record = AgentMemoryRecord {
        id: 0,
        agent_name: agent.name.to_string(),
        memory_type: memory_type.to_string(),
        content: payload.content,
        context_tags: payload
            .context_tags
            .into_iter()
            .map(|tag| tag.trim().to_string())
            .filter(|tag| !tag.is_empty())
            .collect(),
        relevance_score,
        access_count: 0,
        created_at: now_ts(),
        accessed_at: None,
    };
    record.id = state
        .storage
        .insert_agent_memory(&record)
        .map_err(|err| internal_error("store agent memory failed", err))?;
    Ok((StatusCode::CREATED, Json(memory_payload(&record))))
}

async fn list_memory(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiPath(agent_name): ApiPath<String>,
    ApiQuery(query): ApiQuery<MemoryQuery>,
) -> Result<Json<Value>, Response> {
    resolve_user(&state, &headers)?;
    let agent = state
        .agents
        .get(&agent_name)
        .ok_or_else(|| not_found("Agent"))?;
    let memory_type = query
        .memory_type
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let limit = query
        .limit
        .unwrap_or(DEFAULT_MEMORY_LIMIT)
        .clamp(1, MAX_MEMORY_LIMIT);
    let items = state
        .storage
        .list_agent_memory(agent.name, memory_type, limit)
        .map_err(|err| internal_error("list agent memory failed", err))?;
    Ok(Json(Value::Array(items.iter().map(memory_payload).collect())))
}

async fn performance(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let stats = state
        .storage
        .agent_task_stats(Some(user.id))
        .map_err(|err| internal_error("load agent stats failed", err))?;
    let agents: Vec<Value> = stats
        .iter()
        .map(|item| {
            let success_rate = if item.total > 0 {
                item.completed as f64 / item.total as f64
            } else {
                0.0
            };
            json!({
                "agent_name": item.agent_name,
                "total_tasks": item.total,
                "completed_tasks": item.completed,
                "failed_tasks": item.failed,
                "success_rate": success_rate,
                "avg_execution_time": item.avg_execution_time,
            })
        })
        .collect();
    Ok(Json(json!({ "agents": agents })))
}

fn agent_payload(agent: &AgentSpec) -> Value {
    json!({
        "name": agent.name,
        "description": agent.description,
        "capabilities": agent.capabilities,
        "required_integrations": agent.required_integrations,
    })
}

fn memory_payload(record: &AgentMemoryRecord) -> Value {
    json!({
        "id": record.id,
        "agent_name": record.agent_name,
        "memory_type": record.memory_type,
        "content": record.content,
        "context_tags": record.context_tags,
        "relevance_score": record.relevance_score,
        "access_count": record.access_count,
        "created_at": format_ts(record.created_at),
        "accessed_at": format_opt_ts(record.accessed_at),
    })
}
