use crate::api::errors::{
    error_response, internal_error, not_found, unprocessable, ApiJson, ApiPath,
};
use crate::api::user_context::resolve_user;
use crate::core::state::AppState;
use crate::core::time_utils::{format_ts, now_ts};
use crate::services::llm::mask_secret;
use crate::storage::IntegrationRecord;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::{routing::get, Json, Router};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/api/integrations",
            get(list_integrations).post(create_integration),
        )
        .route(
            "/api/integrations/{integration_id}",
            get(get_integration)
                .put(update_integration)
                .delete(delete_integration),
        )
}

fn deserialize_some<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize)]
struct CreateIntegrationRequest {
    integration_type: String,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    config: Option<Value>,
    #[serde(default)]
    is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct UpdateIntegrationRequest {
    #[serde(default, deserialize_with = "deserialize_some")]
    api_key: Option<Option<String>>,
    #[serde(default)]
    config: Option<Value>,
    #[serde(default)]
    is_active: Option<bool>,
}

async fn list_integrations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let items = state
        .storage
        .list_integrations(user.id)
        .map_err(|err| internal_error("list integrations failed", err))?;
    Ok(Json(Value::Array(
        items.iter().map(integration_payload).collect(),
    )))
}

async fn create_integration(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiJson(payload): ApiJson<CreateIntegrationRequest>,
) -> Result<(StatusCode, Json<Value>), Response> {
    let user = resolve_user(&state, &headers)?;
    let integration_type = normalize_type(&payload.integration_type)
        .ok_or_else(|| unprocessable("integration_type must not be empty"))?;
    let existing = state
        .storage
        .get_integration_by_type(user.id, &integration_type)
        .map_err(|err| internal_error("load integration failed", err))?;
    if existing.is_some() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            format!("Integration '{integration_type}' already exists"),
        ));
    }
    let now = now_ts();
    let mut record = IntegrationRecord {
        id: 0,
        user_id: user.id,
        integration_type,
        api_key: clean_secret(payload.api_key),
        config: validate_config(payload.config)?,
        is_active: payload.is_active.unwrap_or(true),
        created_at: now,
        updated_at: now,
    };
    record.id = state
        .storage
        .insert_integration(&record)
        .map_err(|err| internal_error("create integration failed", err))?;
    Ok((StatusCode::CREATED, Json(integration_payload(&record))))
}

async fn get_integration(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiPath(integration_id): ApiPath<i64>,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let record = load_integration(&state, user.id, integration_id)?;
    Ok(Json(integration_payload(&record)))
}

async fn update_integration(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiPath(integration_id): ApiPath<i64>,
    ApiJson(payload): ApiJson<UpdateIntegrationRequest>,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let mut record = load_integration(&state, user.id, integration_id)?;
    if let Some(api_key) = payload.api_key {
        record.api_key = clean_secret(api_key);
    }
    if let Some(config) = payload.config {
        record.config = validate_config(Some(config))?;
    }
    if let Some(is_active) = payload.is_active {
        record.is_active = is_active;
    }
    record.updated_at = now_ts();
    state
        .storage
        .update_integration(&record)
        .map_err(|err| internal_error("update integration failed", err))?;
    Ok(Json(integration_payload(&record)))
}

async fn delete_integration(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiPath(integration_id): ApiPath<i64>,
) -> Result<StatusCode, Response> {
    let user = resolve_user(&state, &headers)?;
    let affected = state
        .storage
        .delete_integration(user.id, integration_id)
        .map_err(|err| internal_error("delete integration failed", err))?;
    if affected == 0 {
        return Err(not_found("Integration"));
    }
    Ok(StatusCode::NO_CONTENT)
}

fn load_integration(
    state: &AppState,
    user_id: i64,
    integration_id: i64,
) -> Result<IntegrationRecord, Response> {
    state
        .storage
        .get_integration(user_id, integration_id)
        .map_err(|err| internal_error("load integration failed", err))?
        .ok_or_else(|| not_found("Integration"))
}

fn normalize_type(raw: &str) -> Option<String> {
    let cleaned = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

fn clean_secret(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn validate_config(config: Option<Value>) -> Result<Value, Response> {
    match config {
        None | Some(Value::Null) => Ok(Value::Object(Map::new())),
        Some(value @ Value::Object(_)) => Ok(value),
        Some(_) => Err(unprocessable("config must be a JSON object")),
    }
}

fn integration_payload(record: &IntegrationRecord) -> Value {
    json!({
        "id": record.id,
        "user_id": record.user_id,
        "integration_type": record.integration_type,
        "api_key": mask_secret(record.api_key.as_deref()),
        "has_api_key": record.api_key.is_some(),
        "config": record.config,
        "is_active": record.is_active,
        "created_at": format_ts(record.created_at),
        "updated_at": format_ts(record.updated_at),
    })
}
