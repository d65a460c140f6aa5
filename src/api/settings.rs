use crate::api::errors::{
    error_response, internal_error, not_found, unprocessable, ApiJson,
};
use crate::api::user_context::resolve_user;
use crate::core::state::AppState;
use crate::core::time_utils::{format_ts, now_ts};
use crate::services::llm::{mask_secret, ChatMessage, LlmSettings};
use crate::storage::{UserRecord, UserSettingsRecord};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::{routing::get, routing::post, Json, Router};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/api/settings",
            get(get_settings)
                .put(update_settings)
                .post(create_settings)
                .delete(delete_settings),
        )
        .route("/api/settings/llm-config", get(llm_config))
        .route("/api/settings/test-llm-connection", post(test_llm_connection))
}

fn deserialize_some<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[derive(Debug, Default, Deserialize)]
struct SettingsPatch {
    #[serde(default)]
    llm_provider: Option<String>,
    #[serde(default)]
    llm_model: Option<String>,
    #[serde(default, deserialize_with = "deserialize_some")]
    llm_api_key: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    llm_api_base: Option<Option<String>>,
    #[serde(default)]
    theme: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    email_notifications: Option<bool>,
    #[serde(default)]
    task_completion_notifications: Option<bool>,
    #[serde(default)]
    project_updates_notifications: Option<bool>,
    #[serde(default)]
    auto_save_interval: Option<i64>,
    #[serde(default)]
    max_concurrent_tasks: Option<i64>,
}

impl SettingsPatch {
    fn apply(self, record: &mut UserSettingsRecord) -> Result<(), Response> {
        if let Some(provider) = self.llm_provider {
            let provider = provider.trim();
            if provider.is_empty() {
                return Err(unprocessable("llm_provider must not be empty"));
            }
            record.llm_provider = provider.to_string();
        }
        if let Some(model) = self.llm_model {
            let model = model.trim();
            if model.is_empty() {
                return Err(unprocessable("llm_model must not be empty"));
            }
            record.llm_model = model.to_string();
        }
        if let Some(api_key) = self.llm_api_key {
            record.llm_api_key = clean(api_key);
        }
        if let Some(api_base) = self.llm_api_base {
            record.llm_api_base = clean(api_base);
        }
        if let Some(theme) = clean(self.theme) {
            record.theme = theme;
        }
        if let Some(language) = clean(self.language) {
            record.language = language;
        }
        if let Some(timezone) = clean(self.timezone) {
            record.timezone = timezone;
        }
        if let Some(value) = self.email_notifications {
            record.email_notifications = value;
        }
        if let Some(value) = self.task_completion_notifications {
            record.task_completion_notifications = value;
        }
        if let Some(value) = self.project_updates_notifications {
            record.project_updates_notifications = value;
        }
        if let Some(value) = self.auto_save_interval {
            if value <= 0 {
                return Err(unprocessable("auto_save_interval must be positive"));
            }
            record.auto_save_interval = value;
        }
        if let Some(value) = self.max_concurrent_tasks {
            if value <= 0 {
                return Err(unprocessable("max_concurrent_tasks must be positive"));
            }
            record.max_concurrent_tasks = value;
        }
        Ok(())
    }
}

async fn get_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let record = load_or_create(&state, &user)?;
    Ok(Json(settings_payload(&record)))
}

async fn update_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiJson(patch): ApiJson<SettingsPatch>,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let mut record = load_or_create(&state, &user)?;
    patch.apply(&mut record)?;
    record.updated_at = now_ts();
    save(&state, &record)?;
    Ok(Json(settings_payload(&record)))
}

async fn create_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiJson(patch): ApiJson<SettingsPatch>,
) -> Result<(StatusCode, Json<Value>), Response> {
    let user = resolve_user(&state, &headers)?;
    if load(&state, user.id)?.is_some() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "Settings already exist for this user",
        ));
    }
    let mut record = UserSettingsRecord::defaults(user.id, now_ts());
    patch.apply(&mut record)?;
    save(&state, &record)?;
    Ok((StatusCode::CREATED, Json(settings_payload(&record))))
}

async fn delete_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let affected = state
        .storage
        .delete_user_settings(user.id)
        .map_err(|err| internal_error("delete settings failed", err))?;
    if affected == 0 {
        return Err(not_found("Settings"));
    }
    Ok(Json(json!({ "message": "User settings deleted successfully" })))
}

async fn llm_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let row = load(&state, user.id)?;
    let settings = LlmSettings::resolve(&state.config.llm, row.as_ref());
    Ok(Json(json!({
        "provider": settings.provider,
        "model": settings.model,
        "api_base": settings.resolved_base_url(),
        "api_key": mask_secret(settings.api_key.as_deref()),
        "has_api_key": settings.api_key.is_some(),
        "configured": settings.is_configured(),
        "source": if row.is_some() { "user" } else { "default" },
    })))
}

async fn test_llm_connection(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let row = load(&state, user.id)?;
    let mut settings = LlmSettings::resolve(&state.config.llm, row.as_ref());
    if !settings.is_configured() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "LLM API key not configured",
        ));
    }
    settings.max_output = Some(10);
    settings.mock_if_unconfigured = false;
    let messages = [ChatMessage::user("Hello")];
    match state.llm.complete(&settings, &messages).await {
        Ok(response) => Ok(Json(json!({
            "status": "success",
            "message": "Connection successful",
            "provider": settings.provider,
            "model": response.model,
        }))),
        Err(err) => {
            warn!("llm connection test failed for user {}: {err}", user.id);
            Err(error_response(
                StatusCode::BAD_REQUEST,
                format!("Connection failed: {err}"),
            ))
        }
    }
}

fn load(state: &AppState, user_id: i64) -> Result<Option<UserSettingsRecord>, Response> {
    state
        .storage
        .get_user_settings(user_id)
        .map_err(|err| internal_error("load settings failed", err))
}

fn load_or_create(state: &AppState, user: &UserRecord) -> Result<UserSettingsRecord, Response> {
    if let Some(record) = load(state, user.id)? {
        return Ok(record);
    }
    let record = UserSettingsRecord::defaults(user.id, now_ts());
    save(state, &record)?;
    Ok(record)
}

fn save(state: &AppState, record: &UserSettingsRecord) -> Result<(), Response> {
    state
        .storage
        .upsert_user_settings(record)
        .map_err(|err| internal_error("save settings failed", err))
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn settings_payload(record: &UserSettingsRecord) -> Value {
    json!({
        "user_id": record.user_id,
        "llm_provider": record.llm_provider,
        "llm_model": record.llm_model,
        "llm_api_key": mask_secret(record.llm_api_key.as_deref()),
        "llm_api_base": record.llm_api_base,
        "theme": record.theme,
        "language": record.language,
        "timezone": record.timezone,
        "email_notifications": record.email_notifications,
        "task_completion_notifications": record.task_completion_notifications,
        "project_updates_notifications": record.project_updates_notifications,
        "auto_save_interval": record.auto_save_interval,
        "max_concurrent_tasks": record.max_concurrent_tasks,
        "created_at": format_ts(record.created_at),
        "updated_at": format_ts(record.updated_at),
    })
}
