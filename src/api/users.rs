use crate::api::auth::user_store_error;
use crate::api::dashboard::dashboard_payload;
use crate::api::errors::ApiJson;
use crate::api::user_context::resolve_user;
use crate::core::state::AppState;
use crate::services::user_store::UserStore;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::{routing::get, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/users/me", get(get_me).put(update_me))
        .route("/api/users/dashboard", get(dashboard))
}

#[derive(Debug, Deserialize)]
struct UpdateProfileRequest {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    full_name: Option<String>,
}

async fn get_me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    Ok(Json(json!(UserStore::to_profile(&user))))
}

async fn update_me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiJson(payload): ApiJson<UpdateProfileRequest>,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    let updated = state
        .user_store
        .update_profile(user, payload.email.as_deref(), payload.full_name.as_deref())
        .map_err(user_store_error)?;
    Ok(Json(json!(UserStore::to_profile(&updated))))
}

async fn dashboard(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    dashboard_payload(&state, &user).map(Json)
}
