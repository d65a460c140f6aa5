// Admin API: development login, user management and platform analytics.
use crate::api::auth::issue_pair;
use crate::api::errors::{error_response, internal_error, not_found, unprocessable, ApiJson, ApiPath, ApiQuery};
use crate::api::user_context::resolve_admin;
use crate::core::state::AppState;
use crate::core::time_utils::now_ts;
use crate::services::maintenance::generate_usage_analytics;
use crate::services::user_store::{UserStore, ROLE_ADMIN, ROLE_USER, SUBSCRIPTION_TIERS};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::{routing::get, routing::post, routing::put, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

const SUBSCRIPTION_STATUSES: [&str; 4] = ["active", "inactive", "cancelled", "past_due"];

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/admin/dev-login", post(dev_login))
        .route("/api/admin/users", get(list_users))
        .route("/api/admin/users/{user_id}", put(update_user))
        .route("/api/admin/analytics", get(analytics))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default)]
    skip: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct AdminUserUpdate {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    subscription_tier: Option<String>,
    #[serde(default)]
    subscription_status: Option<String>,
    #[serde(default)]
    is_active: Option<bool>,
    #[serde(default)]
    is_verified: Option<bool>,
}

async fn dev_login(State(state): State<Arc<AppState>>) -> Result<Json<Value>, Response> {
    if !state.config.is_development() {
        return Err(error_response(
            StatusCode::FORBIDDEN,
            "Dev login is only available in development",
        ));
    }
    let admin = state
        .user_store
        .default_admin()
        .map_err(|err| internal_error("load default admin failed", err))?;
    warn!("dev login issued for '{}'", admin.username);
    let pair = issue_pair(&state, &admin)?;
    let mut payload = json!(pair);
    payload["user"] = json!(UserStore::to_profile(&admin));
    Ok(Json(payload))
}

async fn list_users(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiQuery(page): ApiQuery<PageQuery>,
) -> Result<Json<Value>, Response> {
    resolve_admin(&state, &headers)?;
    let (users, total) = state
        .storage
        .list_users(
            page.skip.unwrap_or(0).max(0),
            page.limit.unwrap_or(100).clamp(1, 1000),
        )
        .map_err(|err| internal_error("list users failed", err))?;
    let users: Vec<Value> = users
        .iter()
        .map(|user| json!(UserStore::to_profile(user)))
        .collect();
    Ok(Json(json!({ "users": users, "total": total })))
}

async fn update_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiPath(user_id): ApiPath<i64>,
    ApiJson(payload): ApiJson<AdminUserUpdate>,
) -> Result<Json<Value>, Response> {
    let admin = resolve_admin(&state, &headers)?;
    let mut user = state
        .user_store
        .get_user(user_id)
        .map_err(|err| internal_error("load user failed", err))?
        .ok_or_else(|| not_found("User"))?;
    if let Some(role) = payload.role {
        let role = role.trim().to_ascii_lowercase();
        if role != ROLE_ADMIN && role != ROLE_USER {
            return Err(unprocessable(format!("unknown role '{role}'")));
        }
        if user.id == admin.id && role != ROLE_ADMIN {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "Admins cannot remove their own admin role",
            ));
        }
        user.role = role;
    }
    if let Some(tier) = payload.subscription_tier {
        let tier = tier.trim().to_ascii_lowercase();
        if !SUBSCRIPTION_TIERS.contains(&tier.as_str()) {
            return Err(unprocessable(format!("unknown subscription tier '{tier}'")));
        }
        user.subscription_tier = tier;
    }
    if let Some(status) = payload.subscription_status {
        let status = status.trim().to_ascii_lowercase();
        if !SUBSCRIPTION_STATUSES.contains(&status.as_str()) {
            return Err(unprocessable(format!(
                "unknown subscription status '{status}'"
            )));
        }
        user.subscription_status = status;
    }
    if let Some(is_active) = payload.is_active {
        if user.id == admin.id && !is_active {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "Admins cannot deactivate themselves",
            ));
        }
        user.is_active = is_active;
    }
    if let Some(is_verified) = payload.is_verified {
        user.is_verified = is_verified;
    }
    user.updated_at = now_ts();
    state
        .storage
        .update_user(&user)
        .map_err(|err| internal_error("update user failed", err))?;
    info!("admin {} updated user {}", admin.username, user.id);
    Ok(Json(json!(UserStore::to_profile(&user))))
}

/// Serves the last snapshot from the maintenance loop, computing one when none exists yet.
async fn analytics(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, Response> {
    resolve_admin(&state, &headers)?;
    if let Some(snapshot) = state.analytics.read().clone() {
        return Ok(Json(snapshot));
    }
    let snapshot = generate_usage_analytics(state.storage.as_ref(), now_ts())
        .map_err(|err| internal_error("generate analytics failed", err))?;
    *state.analytics.write() = Some(snapshot.clone());
    Ok(Json(snapshot))
}
