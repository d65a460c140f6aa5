use crate::api::errors::{
    error_response, internal_error, unauthorized, unprocessable, ApiForm, ApiJson,
};
use crate::api::user_context::resolve_user;
use crate::core::auth::{TokenKind, TokenPair};
use crate::core::state::AppState;
use crate::services::user_store::{NewUser, UserStore, UserStoreError};
use crate::storage::UserRecord;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::{routing::get, routing::post, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/login-json", post(login_json))
        .route("/api/auth/login", post(login_form))
        .route("/api/auth/refresh", post(refresh))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/me", get(me))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    username: String,
    email: String,
    password: String,
    #[serde(default)]
    full_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

async fn register(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<RegisterRequest>,
) -> Result<(StatusCode, Json<Value>), Response> {
    let user = state
        .user_store
        .register(NewUser {
            username: payload.username,
            email: payload.email,
            password: payload.password,
            full_name: payload.full_name,
        })
        .map_err(user_store_error)?;
    info!("registered user {} ({})", user.username, user.id);
    Ok((
        StatusCode::CREATED,
        Json(json!(UserStore::to_profile(&user))),
    ))
}

async fn login_json(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<LoginRequest>,
) -> Result<Json<Value>, Response> {
    login(&state, &payload)
}

async fn login_form(
    State(state): State<Arc<AppState>>,
    ApiForm(payload): ApiForm<LoginRequest>,
) -> Result<Json<Value>, Response> {
    login(&state, &payload)
}

fn login(state: &AppState, payload: &LoginRequest) -> Result<Json<Value>, Response> {
    let user = state
        .user_store
        .login(&payload.username, &payload.password)
        .map_err(user_store_error)?;
    let pair = issue_pair(state, &user)?;
    Ok(Json(json!(pair)))
}

async fn refresh(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<RefreshRequest>,
) -> Result<Json<Value>, Response> {
    let claims = state
        .tokens
        .verify(&payload.refresh_token, TokenKind::Refresh)
        .map_err(|err| unauthorized(err.message()))?;
    let user = state
        .user_store
        .get_user(claims.uid)
        .map_err(|err| internal_error("load user for refresh failed", err))?
        .filter(|user| user.username == claims.sub && user.is_active)
        .ok_or_else(|| unauthorized("Could not validate credentials"))?;
    let pair = issue_pair(&state, &user)?;
    Ok(Json(json!(pair)))
}

/// Tokens are stateless; the client discards them.
async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    info!("user {} logged out", user.username);
    Ok(Json(json!({ "message": "Successfully logged out" })))
}

async fn me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, Response> {
    let user = resolve_user(&state, &headers)?;
    Ok(Json(json!(UserStore::to_profile(&user))))
}

pub(crate) fn issue_pair(state: &AppState, user: &UserRecord) -> Result<TokenPair, Response> {
    state
        .tokens
        .issue_pair(user)
        .map_err(|err| internal_error("issue token pair failed", err))
}

pub(crate) fn user_store_error(err: UserStoreError) -> Response {
    match err {
        UserStoreError::InvalidInput(message) => unprocessable(message),
        UserStoreError::UsernameTaken | UserStoreError::EmailTaken | UserStoreError::Inactive => {
            error_response(StatusCode::BAD_REQUEST, err.to_string())
        }
        UserStoreError::InvalidCredentials => unauthorized(err.to_string()),
        UserStoreError::Internal(err) => internal_error("user store failed", err),
    }
}
